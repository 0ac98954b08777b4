//! Layered configuration.
//!
//! Values merge from four layers, weakest first: the base JSON config
//! file, a node-local overlay (winning key-by-key for keys present in the
//! base), `MC_`-prefixed environment variables, and explicit overrides
//! from the command line. The merged map resolves into [`Settings`].
//!
//! Boolean knobs accept JSON `true`/`false` or the string `"YES"`, so the
//! same value works from a file, an environment variable, or a flag.

use crate::error::ConfigError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default base configuration file.
pub const BASE_CONFIG: &str = "/etc/monclone/monclone.conf";
/// Node-local overlay merged over the base file.
pub const NODE_CONFIG: &str = "/var/lib/monclone/conf.d/monclone.conf";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MC_";

/// Role of the node in a clone topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Produces snapshots.
    Master,
    /// Consumes snapshots; adopts only hosts scoped to its node name.
    #[default]
    Worker,
    /// Consumes snapshots with no host scoping; hosts arrive disabled.
    Replica,
}

impl Role {
    pub fn parse(text: &str) -> Result<Role, ConfigError> {
        match text {
            "master" => Ok(Role::Master),
            "worker" => Ok(Role::Worker),
            "replica" => Ok(Role::Replica),
            other => Err(ConfigError::Invalid(format!("unknown role: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker => "worker",
            Role::Replica => "replica",
        }
    }

    /// Whether this role takes every snapshot host regardless of scoping.
    pub fn takes_all_hosts(self) -> bool {
        matches!(self, Role::Master | Role::Replica)
    }
}

/// Connection settings for the selected store driver.
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    /// Driver type tag (`file`, `dydb`, `redis`, `direct`, or a
    /// registered extension tag).
    pub store_type: String,
    /// Region (KV-table), host (Redis), master URL (direct), or directory
    /// override (file).
    pub endpoint: Option<String>,
    /// Port where the backend needs one (Redis default 6379).
    pub port: Option<u16>,
    /// Access id (KV-table) or master node name (direct).
    pub access: Option<String>,
    /// Secret key, password, or master token.
    pub credential: Option<String>,
    /// Items per write burst (KV-table pacing).
    pub batch_limit: usize,
    /// Seconds slept between write bursts.
    pub batch_wait: u64,
    /// Extension-driver parameters, passed through untouched.
    pub extra: Map<String, Value>,
}

/// One secret global macro to (re)create on the worker. Secret values
/// cannot be read back over the API, so they ride in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretMacro {
    #[serde(rename = "macro")]
    pub name: String,
    pub value: String,
}

/// Severity rename/recolor override for global settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeverityOverride {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

/// Operator overrides applied on top of snapshot global settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsOverrides {
    #[serde(default)]
    pub severity: BTreeMap<String, SeverityOverride>,
    #[serde(default)]
    pub timeout: BTreeMap<String, String>,
}

/// Alert-media assignment for one user on one media type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaTarget {
    /// Destination address(es): a string or a list of strings.
    #[serde(default)]
    pub to: Value,
    /// Per-severity-level switches, level → `"YES"`/`"NO"`.
    #[serde(default)]
    pub severity: BTreeMap<String, String>,
    /// Weekday → `HH:MM-HH:MM` notification window.
    #[serde(default)]
    pub work_time: BTreeMap<String, String>,
}

/// Fully resolved run settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub node: String,
    pub role: Role,
    pub endpoint: String,
    pub token: Option<String>,
    pub user: String,
    pub password: Option<String>,
    /// Default admin password generated by a hosted platform.
    pub platform_password: Option<String>,
    /// The endpoint is a hosted Monitor variant.
    pub hosted: bool,
    pub self_cert: bool,
    pub http_auth: bool,
    pub update_password: bool,
    /// Worker: apply this version instead of the latest.
    pub target_version: Option<String>,
    pub force_initialize: bool,
    pub force_useip: bool,
    pub host_update: bool,
    pub force_host_update: bool,
    pub no_delete: bool,
    pub checknow_execute: bool,
    pub checknow_interval: Vec<String>,
    pub checknow_wait: u64,
    pub worker_concurrency: usize,
    pub template_skip: bool,
    pub template_separate: usize,
    pub description: Option<String>,
    pub quiet: bool,
    pub assume_yes: bool,
    pub store: StoreSettings,
    pub secret_global_macros: Vec<SecretMacro>,
    /// Users allowed to clone, with the password for first creation.
    pub enable_user: BTreeMap<String, String>,
    pub cloning_super_admin: bool,
    /// Proxy name → (PSK identity, PSK hex).
    pub proxy_psk: BTreeMap<String, (String, String)>,
    pub settings_overrides: SettingsOverrides,
    /// Media type → user → assignment.
    pub media_settings: BTreeMap<String, BTreeMap<String, MediaTarget>>,
    /// MFA method name → Duo client secret.
    pub mfa_client_secret: BTreeMap<String, String>,
}

impl Settings {
    /// Load and merge all four layers. `overrides` holds command-line
    /// values keyed by config name; `config_file` replaces the default
    /// base path and suppresses the overlay; `no_config_files` uses only
    /// environment and overrides.
    pub fn load(
        overrides: Map<String, Value>,
        config_file: Option<&Path>,
        no_config_files: bool,
    ) -> Result<Settings, ConfigError> {
        let mut merged = Map::new();

        if !no_config_files {
            let base_path = config_file
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(BASE_CONFIG));
            if let Some(base) = read_json_map(&base_path)? {
                merged = base;
            }
            // The overlay only applies when no explicit file was given,
            // and only overrides keys the base actually defines.
            if config_file.is_none() {
                if let Some(overlay) = read_json_map(Path::new(NODE_CONFIG))? {
                    for (key, value) in overlay {
                        if merged.contains_key(&key) {
                            merged.insert(key, value);
                        }
                    }
                }
            }
        }

        apply_env(&mut merged, std::env::vars());
        for (key, value) in overrides {
            merged.insert(key, value);
        }

        Settings::resolve(merged)
    }

    /// Resolve a fully merged map. Split from [`Settings::load`] so tests
    /// can bypass the filesystem and process environment.
    pub fn resolve(merged: Map<String, Value>) -> Result<Settings, ConfigError> {
        let get_str = |key: &str| -> Option<String> {
            merged.get(key).and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };
        let get_flag = |key: &str| -> bool { merged.get(key).map(as_flag).unwrap_or(false) };
        let get_usize = |key: &str, default: usize| -> usize {
            merged
                .get(key)
                .and_then(value_as_u64)
                .map(|n| n as usize)
                .unwrap_or(default)
        };

        let role = match get_str("role") {
            Some(text) => Role::parse(&text)?,
            None => Role::Worker,
        };
        let endpoint = get_str("endpoint").unwrap_or_else(|| "http://localhost".to_string());
        let hosted = get_flag("hosted");

        let mut token = get_str("token");
        let mut update_password = get_flag("update_password");
        let mut http_auth = get_flag("http_auth");
        if hosted {
            // Hosted variants terminate HTTP auth at the platform edge.
            http_auth = false;
        }
        if http_auth {
            update_password = false;
            token = None;
        }

        let mut force_initialize = get_flag("force_initialize");
        let mut target_version = get_str("version");
        if role == Role::Master {
            force_initialize = false;
            update_password = false;
            target_version = None;
        }
        let mut template_skip = get_flag("template_skip");
        if force_initialize {
            template_skip = false;
        }

        let store = resolve_store(&merged)?;

        let checknow_interval = match merged.get("checknow_interval") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            _ => vec!["1h".to_string()],
        };

        Ok(Settings {
            node: get_str("node").unwrap_or_else(|| "mc-default".to_string()),
            role,
            endpoint,
            token,
            user: get_str("user").unwrap_or_else(|| crate::names::SUPER_USER.to_string()),
            password: get_str("password"),
            platform_password: get_str("platform_password"),
            hosted,
            self_cert: get_flag("self_cert"),
            http_auth,
            update_password,
            target_version,
            force_initialize,
            force_useip: get_flag("force_useip"),
            host_update: get_flag("host_update"),
            force_host_update: get_flag("force_host_update"),
            no_delete: get_flag("no_delete"),
            checknow_execute: get_flag("checknow_execute"),
            checknow_interval,
            checknow_wait: merged
                .get("checknow_wait")
                .and_then(value_as_u64)
                .unwrap_or(30),
            worker_concurrency: get_usize("worker_concurrency", 4),
            template_skip,
            template_separate: get_usize("template_separate", 100),
            description: get_str("description"),
            quiet: get_flag("quiet"),
            assume_yes: get_flag("yes"),
            store,
            secret_global_macros: parse_field(&merged, "secret_globalmacro")?,
            enable_user: parse_field(&merged, "enable_user")?,
            cloning_super_admin: get_flag("cloning_super_admin"),
            proxy_psk: parse_field(&merged, "proxy_psk")?,
            settings_overrides: parse_field(&merged, "settings")?,
            media_settings: parse_field(&merged, "media_settings")?,
            mfa_client_secret: parse_field(&merged, "mfa_client_secret")?,
        })
    }

    /// Derive the master-side settings for a direct (store-less) run from
    /// the worker's store connection block.
    pub fn for_direct_master(&self) -> Result<Settings, ConfigError> {
        let node = self.store.access.clone().ok_or_else(|| {
            ConfigError::Invalid("direct store needs the master node name in store access".into())
        })?;
        let endpoint = self.store.endpoint.clone().ok_or_else(|| {
            ConfigError::Invalid("direct store needs the master endpoint".into())
        })?;
        let mut master = self.clone();
        master.role = Role::Master;
        master.node = node;
        master.endpoint = endpoint;
        master.token = self.store.credential.clone();
        master.user = crate::names::SUPER_USER.to_string();
        master.password = None;
        master.http_auth = false;
        master.update_password = false;
        master.template_skip = false;
        master.force_initialize = false;
        master.target_version = None;
        Ok(master)
    }
}

/// Interpret a flag value: JSON booleans as-is, `"YES"` as true, anything
/// else as false.
fn as_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s == "YES",
        _ => false,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_field<T: serde::de::DeserializeOwned + Default>(
    merged: &Map<String, Value>,
    key: &str,
) -> Result<T, ConfigError> {
    match merged.get(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            ConfigError::Invalid(format!("bad {key} configuration: {e}"))
        }),
    }
}

fn read_json_map(path: &Path) -> Result<Option<Map<String, Value>>, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let value: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(ConfigError::Invalid(format!(
            "{} must hold a JSON object",
            path.display()
        ))),
    }
}

/// Merge `MC_`-prefixed environment variables into the map.
/// `MC_STORE_CONNECT_*` variables nest under `store_connect`.
pub fn apply_env<I>(merged: &mut Map<String, Value>, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, value) in vars {
        let upper = name.to_uppercase();
        let Some(key) = upper.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let key = key.to_lowercase();
        if let Some(nested) = key.strip_prefix("store_connect_") {
            let block = merged
                .entry("store_connect".to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(block) = block {
                block.insert(nested.to_string(), Value::String(value));
            }
        } else {
            merged.insert(key, Value::String(value));
        }
    }
}

fn resolve_store(merged: &Map<String, Value>) -> Result<StoreSettings, ConfigError> {
    let mut store_type = merged
        .get("store_type")
        .and_then(Value::as_str)
        .unwrap_or("file")
        .to_string();
    if store_type == "extend" {
        store_type = merged
            .get("extend_store")
            .and_then(Value::as_str)
            .unwrap_or("file")
            .to_string();
    }

    let connect = merged
        .get("store_connect")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let flat = |key: &str| merged.get(key).and_then(|v| value_as_string(v));
    let nested = |key: &str| connect.get(key).and_then(|v| value_as_string(v));

    let mut settings = StoreSettings {
        store_type: store_type.clone(),
        batch_limit: 10,
        batch_wait: 2,
        ..Default::default()
    };

    match store_type.as_str() {
        "dydb" => {
            settings.access = flat("store_access").or_else(|| nested("aws_access_id"));
            settings.credential = flat("store_credential").or_else(|| nested("aws_secret_key"));
            settings.endpoint = flat("store_endpoint")
                .or_else(|| nested("aws_region"))
                .or_else(|| Some("us-east-1".to_string()));
            settings.batch_limit = merged
                .get("store_limit")
                .and_then(value_as_u64)
                .or_else(|| connect.get("dydb_limit").and_then(value_as_u64))
                .unwrap_or(10) as usize;
            settings.batch_wait = merged
                .get("store_interval")
                .and_then(value_as_u64)
                .or_else(|| connect.get("dydb_wait").and_then(value_as_u64))
                .unwrap_or(2);
        }
        "redis" => {
            settings.endpoint = flat("store_endpoint")
                .or_else(|| nested("redis_host"))
                .or_else(|| Some("localhost".to_string()));
            settings.port = merged
                .get("store_port")
                .and_then(value_as_u64)
                .or_else(|| connect.get("redis_port").and_then(value_as_u64))
                .map(|p| p as u16)
                .or(Some(6379));
            settings.credential = flat("store_credential").or_else(|| nested("redis_password"));
        }
        "direct" => {
            settings.access = flat("store_access").or_else(|| nested("direct_node"));
            settings.endpoint = flat("store_endpoint").or_else(|| nested("direct_endpoint"));
            settings.credential = flat("store_credential").or_else(|| nested("direct_token"));
        }
        "file" => {
            settings.endpoint = flat("store_endpoint");
        }
        _ => {
            // Extension driver: hand every parameter through untouched.
            settings.extra = match merged.get("extend_params") {
                Some(Value::String(text)) => serde_json::from_str(text).map_err(|e| {
                    ConfigError::Invalid(format!("extend_params is not JSON: {e}"))
                })?,
                Some(Value::Object(map)) => map.clone(),
                _ => connect,
            };
            settings.endpoint = flat("store_endpoint");
            settings.port = merged
                .get("store_port")
                .and_then(value_as_u64)
                .map(|p| p as u16);
            settings.access = flat("store_access");
            settings.credential = flat("store_credential");
        }
    }

    Ok(settings)
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(pairs: Value) -> Settings {
        let Value::Object(map) = pairs else {
            panic!("fixture must be an object")
        };
        Settings::resolve(map).unwrap()
    }

    #[test]
    fn defaults_are_worker_file_store() {
        let settings = resolve(json!({}));
        assert_eq!(settings.role, Role::Worker);
        assert_eq!(settings.node, "mc-default");
        assert_eq!(settings.store.store_type, "file");
        assert_eq!(settings.worker_concurrency, 4);
        assert_eq!(settings.checknow_wait, 30);
        assert_eq!(settings.template_separate, 100);
        assert_eq!(settings.checknow_interval, vec!["1h"]);
    }

    #[test]
    fn yes_strings_and_bools_both_raise_flags() {
        let settings = resolve(json!({"no_delete": "YES", "force_useip": true}));
        assert!(settings.no_delete);
        assert!(settings.force_useip);
        let settings = resolve(json!({"no_delete": "NO", "force_useip": false}));
        assert!(!settings.no_delete);
        assert!(!settings.force_useip);
    }

    #[test]
    fn master_role_clears_worker_only_knobs() {
        let settings = resolve(json!({
            "role": "master",
            "force_initialize": "YES",
            "update_password": "YES",
            "version": "some-uuid",
        }));
        assert!(!settings.force_initialize);
        assert!(!settings.update_password);
        assert_eq!(settings.target_version, None);
    }

    #[test]
    fn http_auth_disables_token_and_password_update() {
        let settings = resolve(json!({
            "http_auth": "YES",
            "token": "t0ken",
            "update_password": "YES",
        }));
        assert!(settings.http_auth);
        assert_eq!(settings.token, None);
        assert!(!settings.update_password);
    }

    #[test]
    fn dydb_store_pulls_connection_block_defaults() {
        let settings = resolve(json!({
            "store_type": "dydb",
            "store_connect": {
                "aws_access_id": "AKIA",
                "aws_secret_key": "secret",
                "dydb_limit": 5,
            },
        }));
        assert_eq!(settings.store.access.as_deref(), Some("AKIA"));
        assert_eq!(settings.store.endpoint.as_deref(), Some("us-east-1"));
        assert_eq!(settings.store.batch_limit, 5);
        assert_eq!(settings.store.batch_wait, 2);
    }

    #[test]
    fn flat_store_flags_beat_the_connection_block() {
        let settings = resolve(json!({
            "store_type": "redis",
            "store_endpoint": "cache.internal",
            "store_connect": {"redis_host": "localhost", "redis_port": 6380},
        }));
        assert_eq!(settings.store.endpoint.as_deref(), Some("cache.internal"));
        assert_eq!(settings.store.port, Some(6380));
    }

    #[test]
    fn env_vars_merge_with_prefix_and_nesting() {
        let mut merged = Map::new();
        apply_env(
            &mut merged,
            [
                ("MC_NODE".to_string(), "edge-7".to_string()),
                ("MC_STORE_CONNECT_REDIS_HOST".to_string(), "r1".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ],
        );
        assert_eq!(merged.get("node"), Some(&json!("edge-7")));
        assert_eq!(
            merged.get("store_connect").unwrap().get("redis_host"),
            Some(&json!("r1"))
        );
        assert!(!merged.contains_key("home"));
    }

    #[test]
    fn direct_master_settings_derive_from_store_block() {
        let worker = resolve(json!({
            "store_type": "direct",
            "store_access": "primary",
            "store_endpoint": "https://primary.example",
            "store_credential": "master-token",
        }));
        let master = worker.for_direct_master().unwrap();
        assert_eq!(master.role, Role::Master);
        assert_eq!(master.node, "primary");
        assert_eq!(master.endpoint, "https://primary.example");
        assert_eq!(master.token.as_deref(), Some("master-token"));
        assert!(!master.update_password);
    }

    #[test]
    fn config_only_tables_deserialize() {
        let settings = resolve(json!({
            "enable_user": {"ops": "pass1"},
            "proxy_psk": {"edge-proxy": ["psk-id", "c0ffee"]},
            "secret_globalmacro": [{"macro": "{$SECRET}", "value": "s"}],
            "settings": {"severity": {"3": {"name": "Bad"}}, "timeout": {"external_check": "30s"}},
            "media_settings": {"Email": {"ops": {"to": "x@example.com"}}},
        }));
        assert_eq!(settings.enable_user.get("ops").map(String::as_str), Some("pass1"));
        assert_eq!(
            settings.proxy_psk.get("edge-proxy"),
            Some(&("psk-id".to_string(), "c0ffee".to_string()))
        );
        assert_eq!(settings.secret_global_macros[0].name, "{$SECRET}");
        assert!(settings.settings_overrides.severity.contains_key("3"));
        assert!(settings.media_settings.contains_key("Email"));
    }

    #[test]
    fn force_initialize_cancels_template_skip() {
        let settings = resolve(json!({"force_initialize": "YES", "template_skip": "YES"}));
        assert!(!settings.template_skip);
    }
}
