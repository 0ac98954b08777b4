//! JSON-RPC 2.0 client for the Monitor API.
//!
//! Supports token and user/password authentication, optional acceptance
//! of self-signed certificates, and HTTP basic auth in front of the API.
//! Auth placement is release-aware: 6.4 and later take a bearer header,
//! older releases take the `auth` request field.

use crate::error::{ApiError, PreconditionError};
use crate::kind::EntityKind;
use crate::release::Release;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use url::Url;

const API_PATH: &str = "api_jsonrpc.php";

/// Methods that must never carry credentials.
fn is_unauthenticated(method: &str) -> bool {
    matches!(method, "apiinfo.version" | "user.login")
}

/// One Monitor endpoint.
pub struct MonitorClient {
    http: reqwest::Client,
    endpoint: Url,
    api_url: Url,
    basic_auth: Option<(String, String)>,
    session: RwLock<Option<String>>,
    release: RwLock<Release>,
    request_id: AtomicU64,
}

impl MonitorClient {
    /// Build a client for an endpoint. `self_cert` accepts self-signed
    /// certificates; `basic_auth` enables HTTP basic auth in front of the
    /// API.
    pub fn new(
        endpoint: &str,
        self_cert: bool,
        basic_auth: Option<(String, String)>,
    ) -> Result<Self, ApiError> {
        let endpoint = Url::parse(endpoint)?;
        let api_url = endpoint.join(API_PATH)?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(self_cert)
            .build()?;
        Ok(MonitorClient {
            http,
            endpoint,
            api_url,
            basic_auth,
            session: RwLock::new(None),
            // Assume the newest surface until api_version() says otherwise.
            release: RwLock::new(Release::R7_0),
            request_id: AtomicU64::new(1),
        })
    }

    /// The endpoint this client talks to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Fix the release used for auth placement. Set right after
    /// [`api_version`](Self::api_version).
    pub fn set_release(&self, release: Release) {
        *self.release.write().unwrap_or_else(|e| e.into_inner()) = release;
    }

    fn session_token(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Verify the endpoint serves the expected node. The front end prints
    /// its configured name in a `server-name` block; the API itself does
    /// not expose it.
    pub async fn check_server_name(&self, node: &str) -> Result<(), PreconditionError> {
        let body = self
            .request(self.endpoint.clone())
            .send()
            .await
            .map_err(|e| PreconditionError::NodeMismatch {
                expected: node.to_string(),
                found: format!("unreachable ({e})"),
            })?
            .text()
            .await
            .map_err(|e| PreconditionError::NodeMismatch {
                expected: node.to_string(),
                found: format!("unreadable ({e})"),
            })?;
        #[allow(clippy::unwrap_used)] // literal pattern
        let pattern = Regex::new(r#"<div class="server-name">([0-9a-zA-Z-_.]*)</div>"#).unwrap();
        let found = pattern
            .captures(&body)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        if found != node {
            return Err(PreconditionError::NodeMismatch {
                expected: node.to_string(),
                found,
            });
        }
        Ok(())
    }

    /// The release the endpoint runs, from `apiinfo.version`.
    pub async fn api_version(&self) -> Result<Release, ApiError> {
        let result = self.call("apiinfo.version", json!([])).await?;
        let text = result
            .as_str()
            .ok_or_else(|| ApiError::Malformed("apiinfo.version is not a string".into()))?;
        Release::parse(text).map_err(|_| ApiError::Malformed(format!("bad release: {text}")))
    }

    /// Adopt an API token as the session credential and verify it works.
    pub async fn login_token(&self, token: &str) -> Result<(), ApiError> {
        {
            let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
            *session = Some(token.to_string());
        }
        // Tokens are not validated at issue time; probe with a harmless
        // authorized call.
        match self.call("user.get", json!({"output": [], "limit": 1})).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
                *session = None;
                Err(ApiError::Auth(format!("token rejected: {e}")))
            }
        }
    }

    /// Authenticate with user and password. The parameter name changed at
    /// 5.4 (`user` → `username`).
    pub async fn login_password(&self, user: &str, password: &str) -> Result<(), ApiError> {
        let release = *self.release.read().unwrap_or_else(|e| e.into_inner());
        let user_key = if release >= Release::R5_4 {
            "username"
        } else {
            "user"
        };
        let result = self
            .call("user.login", json!({user_key: user, "password": password}))
            .await?;
        let token = result
            .as_str()
            .ok_or_else(|| ApiError::Auth("login returned no session".into()))?;
        let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
        *session = Some(token.to_string());
        Ok(())
    }

    /// Drop the session credential.
    pub fn forget_session(&self) {
        let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
        *session = None;
    }

    /// Whether the client currently holds a session credential.
    pub fn is_authenticated(&self) -> bool {
        self.session_token().is_some()
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        let mut builder = self.http.get(url);
        if let Some((user, password)) = &self.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        builder
    }

    /// One JSON-RPC call. Returns the `result` member or the API error.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ApiError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let mut body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let release = *self.release.read().unwrap_or_else(|e| e.into_inner());
        let mut builder = self.http.post(self.api_url.clone()).header(
            reqwest::header::CONTENT_TYPE,
            "application/json-rpc",
        );
        if let Some((user, password)) = &self.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        if !is_unauthenticated(method) {
            if let Some(token) = self.session_token() {
                if release >= Release::R6_4 {
                    builder = builder.bearer_auth(&token);
                } else {
                    body["auth"] = Value::String(token);
                }
            }
        }

        let response: Value = builder.json(&body).send().await?.json().await?;
        if let Some(error) = response.get("error") {
            return Err(ApiError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                data: error
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| ApiError::Malformed("response carries neither result nor error".into()))
    }

    /// `kind.get` with the given options.
    pub async fn get(&self, kind: EntityKind, options: Value) -> Result<Value, ApiError> {
        self.call(&format!("{}.get", kind.api_method()), options)
            .await
    }

    /// `kind.create`; global macros use their `createglobal` variant.
    pub async fn create(&self, kind: EntityKind, params: Value) -> Result<Value, ApiError> {
        self.call(&format!("{}.{}", kind.api_method(), suffixed("create", kind)), params)
            .await
    }

    /// `kind.update`; global macros use their `updateglobal` variant.
    pub async fn update(&self, kind: EntityKind, params: Value) -> Result<Value, ApiError> {
        self.call(&format!("{}.{}", kind.api_method(), suffixed("update", kind)), params)
            .await
    }

    /// `kind.delete` over a list of ids; global macros use
    /// `deleteglobal`.
    pub async fn delete(&self, kind: EntityKind, ids: Vec<String>) -> Result<Value, ApiError> {
        self.call(
            &format!("{}.{}", kind.api_method(), suffixed("delete", kind)),
            Value::Array(ids.into_iter().map(Value::String).collect()),
        )
        .await
    }

    /// Bundled configuration export. Returns the serialized bundle text.
    pub async fn configuration_export(&self, options: Value) -> Result<String, ApiError> {
        let result = self
            .call("configuration.export", json!({"format": "json", "options": options}))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::Malformed("export did not return text".into()))
    }

    /// Bundled configuration import of a serialized bundle.
    pub async fn configuration_import(
        &self,
        rules: Value,
        source: String,
    ) -> Result<Value, ApiError> {
        self.call(
            "configuration.import",
            json!({"format": "json", "rules": rules, "source": source}),
        )
        .await
    }

    /// `task.create` for check-now requests.
    pub async fn task_create(&self, params: Value) -> Result<Value, ApiError> {
        self.call("task.create", params).await
    }
}

/// Global macros live behind `*global` method variants.
fn suffixed(function: &'static str, kind: EntityKind) -> String {
    if kind == EntityKind::UserMacroGlobal {
        format!("{function}global")
    } else {
        function.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc_result(value: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "result": value,
            "id": 1,
        }))
    }

    #[tokio::test]
    async fn api_version_parses_release() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{API_PATH}")))
            .and(body_partial_json(json!({"method": "apiinfo.version"})))
            .respond_with(rpc_result(json!("6.4.12")))
            .mount(&server)
            .await;

        let client = MonitorClient::new(&server.uri(), false, None).unwrap();
        assert_eq!(client.api_version().await.unwrap(), Release::R6_4);
    }

    #[tokio::test]
    async fn rpc_errors_surface_code_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "error": {"code": -32602, "message": "Invalid params.", "data": "No permissions."},
                "id": 1,
            })))
            .mount(&server)
            .await;

        let client = MonitorClient::new(&server.uri(), false, None).unwrap();
        let err = client.call("host.get", json!({})).await.unwrap_err();
        match err {
            ApiError::Rpc { code, message, data } => {
                assert_eq!(code, -32602);
                assert_eq!(message, "Invalid params.");
                assert_eq!(data, "No permissions.");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn password_login_uses_release_specific_parameter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "user.login",
                "params": {"user": "Admin"},
            })))
            .respond_with(rpc_result(json!("sessionid-1")))
            .mount(&server)
            .await;

        let client = MonitorClient::new(&server.uri(), false, None).unwrap();
        client.set_release(Release::R5_0);
        client.login_password("Admin", "secret").await.unwrap();
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn old_releases_put_auth_in_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "user.login"})))
            .respond_with(rpc_result(json!("legacy-session")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "host.get",
                "auth": "legacy-session",
            })))
            .respond_with(rpc_result(json!([])))
            .mount(&server)
            .await;

        let client = MonitorClient::new(&server.uri(), false, None).unwrap();
        client.set_release(Release::R5_0);
        client.login_password("Admin", "secret").await.unwrap();
        let hosts = client.get(EntityKind::Host, json!({})).await.unwrap();
        assert_eq!(hosts, json!([]));
    }

    #[tokio::test]
    async fn bad_token_is_cleared_after_probe() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "error": {"code": -32602, "message": "Not authorised.", "data": ""},
                "id": 1,
            })))
            .mount(&server)
            .await;

        let client = MonitorClient::new(&server.uri(), false, None).unwrap();
        assert!(client.login_token("bad-token").await.is_err());
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn server_name_check_reads_front_end_block() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><div class=\"server-name\">edge-7</div></html>",
            ))
            .mount(&server)
            .await;

        let client = MonitorClient::new(&server.uri(), false, None).unwrap();
        client.check_server_name("edge-7").await.unwrap();
        let err = client.check_server_name("edge-8").await.unwrap_err();
        match err {
            PreconditionError::NodeMismatch { expected, found } => {
                assert_eq!(expected, "edge-8");
                assert_eq!(found, "edge-7");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn global_macros_use_global_method_variants() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "usermacro.createglobal"})))
            .respond_with(rpc_result(json!({"globalmacroids": ["7"]})))
            .mount(&server)
            .await;

        let client = MonitorClient::new(&server.uri(), false, None).unwrap();
        client
            .create(
                EntityKind::UserMacroGlobal,
                json!({"macro": "{$X}", "value": "1"}),
            )
            .await
            .unwrap();
    }
}
