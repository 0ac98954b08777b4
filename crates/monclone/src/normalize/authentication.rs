//! Authentication singleton processing.
//!
//! The authentication object is the one kind that cannot be applied as
//! records: its properties merge into a single `authentication.update`,
//! and crossing the 6.2/6.4 boundaries turns embedded LDAP/SAML blocks
//! into user-directory entities. The worker side therefore produces a
//! [`AuthPlan`] that the orchestrator executes (directory creation needs
//! API calls).

use super::{Normalizer, Outcome};
use crate::error::NormalizeError;
use crate::kind::EntityKind;
use crate::release::Release;
use crate::snapshot::Record;
use crate::value::{as_str_like, int_field};
use serde_json::{Map, Value};

/// Worker-side application plan for the authentication singleton.
#[derive(Debug, Default)]
pub struct AuthPlan {
    /// The merged `authentication.update` payload. Directory ids and
    /// identity rewrites are already resolved; only the directory
    /// creations below may still patch it.
    pub update: Map<String, Value>,
    /// LDAP settings converted into a `userdirectory.create` payload.
    /// On success the orchestrator sets `ldap_auth_enabled` and
    /// `ldap_userdirectoryid` in the update.
    pub ldap_directory: Option<Value>,
    /// SAML settings converted into a `userdirectory.create` payload.
    /// On failure the orchestrator clears `saml_auth_enabled`.
    pub saml_directory: Option<Value>,
}

/// Master direction: flatten the group/MFA references to names so they
/// survive the trip between instances.
pub fn process_master(
    n: &Normalizer<'_>,
    records: Vec<Record>,
) -> Result<Outcome, NormalizeError> {
    if !n.is_master() {
        // Worker-side handling goes through `prepare_worker`.
        return Ok(Outcome::records(records));
    }
    let mut kept = Vec::new();
    for mut record in records {
        let data = record.payload.as_object_mut().ok_or_else(|| {
            NormalizeError::new(EntityKind::Authentication, "record is not an object")
        })?;
        match record.name.as_str() {
            "disabled_usrgrpid" => {
                if let Some(target) = data.get("disabled_usrgrpid").and_then(as_str_like) {
                    if let Some(name) = n.translate(EntityKind::UserGroup, &target) {
                        data.insert("disabled_usrgrpid".into(), Value::String(name));
                    }
                }
            }
            "mfaid" => {
                if let Some(target) = data.get("mfaid").and_then(as_str_like) {
                    if let Some(name) = n.translate(EntityKind::Mfa, &target) {
                        data.insert("mfaid".into(), Value::String(name));
                    }
                }
            }
            _ => {}
        }
        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

/// Worker direction: merge the property records and work out the
/// cross-release conversions.
pub fn prepare_worker(
    n: &Normalizer<'_>,
    records: &[Record],
) -> Result<Option<AuthPlan>, NormalizeError> {
    if records.is_empty() {
        return Ok(None);
    }
    let mut data = Map::new();
    for record in records {
        let Some(map) = record.payload.as_object() else {
            return Err(NormalizeError::new(
                EntityKind::Authentication,
                "record is not an object",
            ));
        };
        for (key, value) in map {
            data.insert(key.clone(), value.clone());
        }
    }

    let release = n.release();
    let mut plan = AuthPlan::default();

    if release <= Release::R6_2 {
        if int_field(&data, "ldap_configured", 0) == 0 {
            strip_fields(&mut data, n.profile.auth_ldap_fields());
            data.remove("ldap_configured");
        }
        if int_field(&data, "saml_auth_enabled", 0) == 0 {
            strip_fields(&mut data, n.profile.auth_saml_fields());
            data.remove("saml_auth_enabled");
        }
    }
    if release == Release::R6_2 {
        // 6.2 rejects the field outright unless an LDAP server is
        // already configured.
        data.remove("authentication_type");
    }
    if release >= Release::R6_2 && n.master_release < Release::R6_2 {
        // Pre-6.2 LDAP settings move into a user directory.
        if int_field(&data, "ldap_configured", 0) != 0 {
            let mut directory = Map::new();
            directory.insert(
                "name".into(),
                Value::String("LDAP settings migrated at import".into()),
            );
            for field in n.profile.auth_ldap_fields() {
                if let Some(value) = data.remove(*field) {
                    if !crate::value::is_emptyish(&value) {
                        let stripped = field.trim_start_matches("ldap_");
                        directory.insert(stripped.to_string(), value);
                    }
                }
            }
            if directory.contains_key("host") {
                plan.ldap_directory = Some(Value::Object(directory));
            }
        }
    }

    if release >= Release::R6_4 {
        if let Some(configured) = data.remove("ldap_configured") {
            data.insert("ldap_auth_enabled".into(), configured);
        }
        if n.master_release < Release::R6_4 && int_field(&data, "saml_auth_enabled", 0) != 0 {
            // Pre-6.4 SAML settings move into a user directory.
            let mut directory = Map::new();
            directory.insert(
                "name".into(),
                Value::String("SAML settings migrated at import".into()),
            );
            directory.insert("idp_type".into(), Value::String("1".into()));
            for field in n.profile.auth_saml_fields() {
                if let Some(value) = data.remove(*field) {
                    if !crate::value::is_emptyish(&value) {
                        let stripped = field.trim_start_matches("saml_");
                        directory.insert(stripped.to_string(), value);
                    }
                }
            }
            if directory.contains_key("idp_entityid") {
                plan.saml_directory = Some(Value::Object(directory));
            }
        }

        let ldap = int_field(&data, "ldap_auth_enabled", 0) != 0;
        if !ldap {
            strip_fields(&mut data, n.profile.auth_ldap_fields());
            data.remove("ldap_auth_enabled");
        }
        let saml = int_field(&data, "saml_auth_enabled", 0) != 0 || plan.saml_directory.is_some();
        if !saml {
            strip_fields(&mut data, n.profile.auth_saml_fields());
            data.remove("saml_auth_enabled");
        }
        if ldap || saml || plan.ldap_directory.is_some() {
            if let Some(target) = data.get("disabled_usrgrpid").and_then(as_str_like) {
                if let Some(id) = n.translate(EntityKind::UserGroup, &target) {
                    data.insert("disabled_usrgrpid".into(), Value::String(id));
                }
            }
        } else {
            data.remove("disabled_usrgrpid");
        }
    }

    if release >= Release::R7_0 {
        if int_field(&data, "mfa_status", 0) == 0 {
            data.remove("mfa_status");
            data.remove("mfaid");
        } else if let Some(target) = data.get("mfaid").and_then(as_str_like) {
            if let Some(id) = n.translate(EntityKind::Mfa, &target) {
                data.insert("mfaid".into(), Value::String(id));
            }
        }
    }

    if n.settings.hosted {
        for field in &n.profile.cloud_overrides().authentication_fields {
            data.remove(*field);
        }
    }

    plan.update = data;
    Ok(Some(plan))
}

fn strip_fields(data: &mut Map<String, Value>, fields: &[&str]) {
    for field in fields {
        data.remove(*field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::testutil::Fixture;
    use crate::normalize::Direction;
    use serde_json::json;

    fn record(name: &str, payload: Value) -> Record {
        Record::new(EntityKind::Authentication, name, payload)
    }

    #[test]
    fn master_flattens_group_reference_to_name() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Master);
        fixture.seed(EntityKind::UserGroup, &[("9", "Disabled accounts")]);
        let n = fixture.normalizer();
        let outcome = process_master(
            &n,
            vec![record("disabled_usrgrpid", json!({"disabled_usrgrpid": "9"}))],
        )
        .unwrap();
        assert_eq!(
            outcome.records[0].payload["disabled_usrgrpid"],
            json!("Disabled accounts")
        );
    }

    #[test]
    fn pre_6_2_ldap_block_becomes_a_directory() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_0, Direction::Worker);
        let n = fixture.normalizer();
        let plan = n
            .authentication_plan(&[
                record("authentication_type", json!({"authentication_type": "1"})),
                record("ldap_configured", json!({"ldap_configured": "1"})),
                record("ldap_host", json!({"ldap_host": "ldap.corp"})),
                record("ldap_port", json!({"ldap_port": "389"})),
            ])
            .unwrap()
            .unwrap();
        let directory = plan.ldap_directory.unwrap();
        assert_eq!(directory["host"], json!("ldap.corp"));
        assert_eq!(directory["port"], json!("389"));
        // The raw LDAP fields left the update payload.
        assert!(plan.update.get("ldap_host").is_none());
    }

    #[test]
    fn disabled_ldap_and_saml_strip_their_blocks() {
        let fixture = Fixture::new(Release::R6_0, Release::R6_0, Direction::Worker);
        let n = fixture.normalizer();
        let plan = n
            .authentication_plan(&[
                record("ldap_configured", json!({"ldap_configured": "0"})),
                record("ldap_host", json!({"ldap_host": "ldap.corp"})),
                record("saml_auth_enabled", json!({"saml_auth_enabled": "0"})),
                record("saml_sso_url", json!({"saml_sso_url": "https://sso"})),
                record("passwd_min_length", json!({"passwd_min_length": "12"})),
            ])
            .unwrap()
            .unwrap();
        assert!(plan.update.get("ldap_host").is_none());
        assert!(plan.update.get("saml_sso_url").is_none());
        assert_eq!(plan.update.get("passwd_min_length"), Some(&json!("12")));
        assert!(plan.ldap_directory.is_none());
    }

    #[test]
    fn mfa_reference_resolves_at_7_0() {
        let mut fixture = Fixture::new(Release::R7_0, Release::R7_0, Direction::Worker);
        fixture.seed(EntityKind::Mfa, &[("2", "duo-main")]);
        let n = fixture.normalizer();
        let plan = n
            .authentication_plan(&[
                record("mfa_status", json!({"mfa_status": "1"})),
                record("mfaid", json!({"mfaid": "duo-main"})),
            ])
            .unwrap()
            .unwrap();
        assert_eq!(plan.update.get("mfaid"), Some(&json!("2")));
    }

    #[test]
    fn hosted_variants_lose_http_auth_fields() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.settings.hosted = true;
        let n = fixture.normalizer();
        let plan = n
            .authentication_plan(&[record(
                "http_auth_enabled",
                json!({"http_auth_enabled": "1", "passwd_min_length": "8"}),
            )])
            .unwrap()
            .unwrap();
        assert!(plan.update.get("http_auth_enabled").is_none());
        assert_eq!(plan.update.get("passwd_min_length"), Some(&json!("8")));
    }
}
