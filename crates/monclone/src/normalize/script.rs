//! Script processor.
//!
//! Script objects are a union over their `type` (script, IPMI, SSH,
//! Telnet, webhook, URL) and `scope` (action vs manual host/event
//! action); the API rejects fields from the wrong arm, so the worker
//! prunes them down to the active arm before write.

use super::{Normalizer, Outcome};
use crate::error::NormalizeError;
use crate::kind::EntityKind;
use crate::release::Release;
use crate::snapshot::Record;
use crate::value::{as_str_like, int_field};
use serde_json::Value;

pub fn process(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut kept = Vec::new();
    for mut record in records {
        let data = record
            .payload
            .as_object_mut()
            .ok_or_else(|| NormalizeError::new(EntityKind::Script, "record is not an object"))?;

        // Group and user-group scoping translates in both directions.
        for kind in [EntityKind::UserGroup, EntityKind::HostGroup] {
            let Some(id_field) = n.profile.id_field(kind) else {
                continue;
            };
            if let Some(target) = data.get(id_field).and_then(as_str_like) {
                if let Some(translated) = n.translate(kind, &target) {
                    data.insert(id_field.to_string(), Value::String(translated));
                }
            }
        }

        if !n.is_master() {
            let script_type = int_field(data, "type", 0);
            let scope = int_field(data, "scope", 0);
            let manual_scope = matches!(scope, 2 | 4);

            if n.release() >= Release::R5_4 {
                if script_type != 0 {
                    data.remove("execute_on");
                }
                if script_type == 2 || script_type == 3 {
                    // SSH/Telnet: one credential arm only.
                    if script_type == 3 || int_field(data, "authtype", 0) == 0 {
                        data.remove("publickey");
                        data.remove("privatekey");
                    } else {
                        data.remove("password");
                    }
                    if script_type == 3 {
                        data.remove("authtype");
                    }
                } else {
                    data.remove("authtype");
                    data.remove("publickey");
                    data.remove("privatekey");
                    data.remove("username");
                    data.remove("password");
                    data.remove("port");
                }
                if script_type != 5 {
                    data.remove("timeout");
                    data.remove("parameters");
                }
                if !manual_scope {
                    data.remove("menu_path");
                    data.remove("usrgrpid");
                    data.remove("host_access");
                    data.remove("confirmation");
                }
            }
            if n.release() >= Release::R6_4 && script_type != 6 {
                data.remove("url");
                data.remove("new_window");
            }
            if n.release() >= Release::R7_0 {
                if !manual_scope || int_field(data, "manualinput", 0) == 0 {
                    for field in [
                        "manualinput",
                        "manualinput_prompt",
                        "manualinput_validator",
                        "manualinput_validator_type",
                        "manualinput_default_value",
                    ] {
                        data.remove(field);
                    }
                } else if int_field(data, "manualinput_validator_type", 0) == 1 {
                    data.remove("manualinput_default_value");
                }
            }
        }

        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::testutil::Fixture;
    use crate::normalize::Direction;
    use serde_json::json;

    fn script(payload: Value) -> Record {
        Record::new(EntityKind::Script, "restart-agent", payload)
    }

    #[test]
    fn webhook_fields_leave_plain_scripts() {
        let fixture = Fixture::new(Release::R6_0, Release::R6_0, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![script(json!({
                "type": "0",
                "scope": "1",
                "command": "systemctl restart agent",
                "timeout": "30s",
                "parameters": [],
                "menu_path": "ops/",
                "username": "root",
            }))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("timeout").is_none());
        assert!(data.get("parameters").is_none());
        assert!(data.get("menu_path").is_none());
        assert!(data.get("username").is_none());
        assert_eq!(data["command"], json!("systemctl restart agent"));
    }

    #[test]
    fn ssh_key_auth_drops_password() {
        let fixture = Fixture::new(Release::R6_0, Release::R6_0, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![script(json!({
                "type": "2",
                "scope": "2",
                "authtype": "1",
                "publickey": "id.pub",
                "privatekey": "id",
                "password": "hunter2",
                "username": "root",
            }))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("password").is_none());
        assert_eq!(data["publickey"], json!("id.pub"));
    }

    #[test]
    fn manual_input_fields_need_manual_scope_at_7_0() {
        let fixture = Fixture::new(Release::R7_0, Release::R7_0, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![script(json!({
                "type": "5",
                "scope": "1",
                "manualinput": "1",
                "manualinput_prompt": "which?",
                "timeout": "30s",
            }))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("manualinput").is_none());
        assert!(data.get("manualinput_prompt").is_none());
        assert_eq!(data["timeout"], json!("30s"));
    }

    #[test]
    fn group_references_translate_on_worker() {
        let mut fixture = Fixture::new(Release::R6_0, Release::R6_0, Direction::Worker);
        fixture.seed(EntityKind::HostGroup, &[("8", "Linux servers")]);
        fixture.seed(EntityKind::UserGroup, &[("3", "Operators")]);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![script(json!({
                "type": "0",
                "scope": "2",
                "groupid": "Linux servers",
                "usrgrpid": "Operators",
            }))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert_eq!(data["groupid"], json!("8"));
        assert_eq!(data["usrgrpid"], json!("3"));
    }
}
