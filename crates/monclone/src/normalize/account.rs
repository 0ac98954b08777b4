//! Account-family processors: users, user groups, roles, user
//! directories and MFA methods.

use super::{ExtendOp, Normalizer, Outcome};
use crate::error::NormalizeError;
use crate::kind::EntityKind;
use crate::names;
use crate::release::Release;
use crate::snapshot::Record;
use crate::value::{as_str_like, int_field, is_emptyish};
use serde_json::{json, Map, Value};

/// Users replicate only when explicitly allow-listed; directory-sourced
/// accounts and (by default) super administrators never do. The reserved
/// admin account is never touched in either direction.
pub fn process_user(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let permit_field = if n.release() >= Release::R5_2 {
        "roleid"
    } else {
        "type"
    };
    let mut kept = Vec::new();
    for mut record in records {
        let data = record
            .payload
            .as_object_mut()
            .ok_or_else(|| NormalizeError::new(EntityKind::User, "record is not an object"))?;

        // Media assignments reference media types by id/name.
        let media_id_field = n.profile.id_field(EntityKind::MediaType).unwrap_or("mediatypeid");
        if let Some(Value::Array(medias)) = data.get_mut("medias") {
            let mut surviving = Vec::new();
            for mut media in medias.drain(..) {
                let Some(map) = media.as_object_mut() else {
                    continue;
                };
                let Some(target) = map.get(media_id_field).and_then(as_str_like) else {
                    continue;
                };
                match n.translate(EntityKind::MediaType, &target) {
                    Some(translated) => {
                        map.insert(media_id_field.to_string(), Value::String(translated));
                        surviving.push(media);
                    }
                    None => continue,
                }
            }
            *medias = surviving;
        }

        if n.release() >= Release::R5_2 {
            if !n.is_master() && n.master_release < Release::R5_2 {
                // Pre-5.2 snapshots carry the numeric type instead of a
                // role reference.
                if let Some(user_type) = data.remove("type") {
                    data.insert(permit_field.to_string(), user_type);
                }
            } else if let Some(target) = data.get(permit_field).and_then(as_str_like) {
                if let Some(translated) = n.translate(EntityKind::Role, &target) {
                    data.insert(permit_field.to_string(), Value::String(translated));
                }
            }
        }

        if n.is_master() {
            let names: Vec<Value> = data
                .remove("usrgrps")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default()
                .iter()
                .filter_map(|item| item.get("name").and_then(as_str_like))
                .map(Value::String)
                .collect();
            data.insert("usrgrps".to_string(), Value::Array(names));
        } else {
            // Directory-provisioned accounts belong to the directory.
            if int_field(data, "userdirectoryid", 0) != 0 {
                continue;
            }
            let permit = data.get(permit_field).and_then(as_str_like).unwrap_or_default();
            if !n.settings.cloning_super_admin && permit == names::SUPER_ROLE_ID {
                continue;
            }
            let Some(password) = n.settings.enable_user.get(&record.name) else {
                continue;
            };
            if !n.local.contains(EntityKind::User, &record.name) {
                // Existing users keep whatever password they have; the
                // original cannot be recovered over the API anyway.
                data.insert("passwd".to_string(), Value::String(password.clone()));
            }

            let group_id_field = n.profile.id_field(EntityKind::UserGroup).unwrap_or("usrgrpid");
            let groups: Vec<Value> = data
                .remove("usrgrps")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default()
                .iter()
                .filter_map(as_str_like)
                .filter_map(|name| n.translate(EntityKind::UserGroup, &name))
                .map(|id| json!({group_id_field: id}))
                .collect();
            data.insert("usrgrps".to_string(), Value::Array(groups));

            for field in ["userdirectoryid", "users_status", "gui_access", "debug_mode"] {
                data.remove(field);
            }

            if let Some(Value::Array(mut medias)) = data.remove("medias") {
                let mut surviving = Vec::new();
                for mut media in medias.drain(..) {
                    let Some(map) = media.as_object_mut() else {
                        continue;
                    };
                    map.remove("mediaid");
                    map.remove("userid");
                    // Directory-provisioned medias stay with the
                    // directory.
                    if int_field(map, "userdirectory_mediaid", 0) != 0 {
                        continue;
                    }
                    map.remove("userdirectory_mediaid");
                    surviving.push(media);
                }
                if !surviving.is_empty() {
                    let media_key = if n.release() >= Release::R5_2 {
                        "medias"
                    } else {
                        "user_medias"
                    };
                    data.insert(media_key.to_string(), Value::Array(surviving));
                }
            }
        }
        kept.push(record);
    }

    let mut outcome = Outcome::records(kept);
    let ids = n.deletions_against(EntityKind::User, &outcome.records, &[names::SUPER_USER]);
    if !ids.is_empty() {
        outcome
            .extend
            .push((EntityKind::User, vec![ExtendOp::Delete { ids }]));
    }
    Ok(outcome)
}

/// User groups: tag filters and group rights reference host/template
/// groups, with the rights table split in two at 6.2.
pub fn process_usergroup(
    n: &Normalizer<'_>,
    records: Vec<Record>,
) -> Result<Outcome, NormalizeError> {
    let group_id_field = n.profile.id_field(EntityKind::HostGroup).unwrap_or("groupid");
    let mut kept = Vec::new();
    for mut record in records {
        let data = record
            .payload
            .as_object_mut()
            .ok_or_else(|| NormalizeError::new(EntityKind::UserGroup, "record is not an object"))?;

        if let Some(Value::Array(filters)) = data.get_mut("tag_filters") {
            for filter in filters.iter_mut() {
                let Some(map) = filter.as_object_mut() else {
                    continue;
                };
                if let Some(target) = map.get(group_id_field).and_then(as_str_like) {
                    if let Some(translated) = n.translate(EntityKind::HostGroup, &target) {
                        map.insert(group_id_field.to_string(), Value::String(translated));
                    }
                }
            }
        }

        rewrite_rights(n, data);

        if !n.is_master() {
            if n.release() >= Release::R6_2 {
                // A directory link only makes sense with directory-backed
                // front-end access.
                if int_field(data, "userdirectoryid", 0) == 0
                    || matches!(int_field(data, "gui_access", 0), 1 | 3)
                {
                    data.remove("userdirectoryid");
                }
            }
            if n.release() >= Release::R7_0 {
                if int_field(data, "mfa_status", 0) == 0 {
                    data.remove("mfa_status");
                    data.remove("mfaid");
                } else if let Some(target) = data.get("mfaid").and_then(as_str_like) {
                    if let Some(translated) = n.translate(EntityKind::Mfa, &target) {
                        data.insert("mfaid".to_string(), Value::String(translated));
                    }
                }
            }
            // Membership flows from the user side.
            data.remove("users");
            data.remove("userids");
            if data.get("tag_filters").map(is_emptyish).unwrap_or(false) {
                data.remove("tag_filters");
            }
        }
        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

/// Translate the rights tables, preserving them across the 6.2 split
/// into host-group and template-group rights.
fn rewrite_rights(n: &Normalizer<'_>, data: &mut Map<String, Value>) {
    let split = n.release() >= Release::R6_2;
    let targets: &[(EntityKind, &str)] = if split {
        &[
            (EntityKind::HostGroup, "hostgroup_rights"),
            (EntityKind::TemplateGroup, "templategroup_rights"),
        ]
    } else {
        &[(EntityKind::HostGroup, "rights")]
    };
    // Pre-6.2 snapshots carry one combined table; both split tables read
    // from it.
    let combined = (!n.is_master() && split && n.master_release < Release::R6_2)
        .then(|| data.get("rights").cloned())
        .flatten();
    if combined.is_some() {
        data.remove("rights");
    }

    for (kind, key) in targets {
        let source = combined
            .clone()
            .or_else(|| data.get(*key).cloned());
        let Some(Value::Array(rights)) = source else {
            continue;
        };
        if rights.is_empty() {
            continue;
        }
        let rewritten: Vec<Value> = rights
            .iter()
            .filter_map(|right| {
                let id = right.get("id").and_then(as_str_like)?;
                let translated = n.translate(*kind, &id)?;
                Some(json!({
                    "id": translated,
                    "permission": right.get("permission").cloned().unwrap_or(json!("0")),
                }))
            })
            .collect();
        data.insert((*key).to_string(), Value::Array(rewritten));
    }
}

/// Roles: strip write-rejected rule names, split the pre-6.4 combined
/// action right, and drop rule families hosted variants lack.
pub fn process_role(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let discard = n.profile.discard_fields(EntityKind::Role);
    let mut kept = Vec::new();
    for mut record in records {
        let data = record
            .payload
            .as_object_mut()
            .ok_or_else(|| NormalizeError::new(EntityKind::Role, "record is not an object"))?;

        if !n.is_master() {
            data.retain(|key, _| !discard.contains(&key.as_str()));
            if let Some(rules) = data.get_mut("rules").and_then(Value::as_object_mut) {
                rules.retain(|key, _| !discard.contains(&key.as_str()));
                for (_, params) in rules.iter_mut() {
                    if let Value::Array(items) = params {
                        items.retain(|item| {
                            item.get("name")
                                .and_then(Value::as_str)
                                .map(|name| !discard.contains(&name))
                                .unwrap_or(true)
                        });
                    }
                }

                if n.release() >= Release::R6_4 {
                    split_action_right(rules, n.master_release);
                }
                if n.settings.hosted {
                    for rule in &n.profile.cloud_overrides().role_rules {
                        rules.remove(*rule);
                    }
                }
            }
        }
        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

/// 6.4 split the single `configuration.actions` UI right into one right
/// per event source. Older snapshots expand to all five.
fn split_action_right(rules: &mut Map<String, Value>, master_release: Release) {
    let Some(Value::Array(ui)) = rules.get_mut("ui") else {
        return;
    };
    let mut status = None;
    ui.retain(|item| {
        if item.get("name").and_then(Value::as_str) == Some("configuration.actions") {
            status = item.get("status").and_then(crate::value::as_int);
            false
        } else {
            true
        }
    });
    if let Some(status) = status.filter(|s| *s != 0) {
        if master_release < Release::R6_4 {
            for name in [
                "configuration.trigger_actions",
                "configuration.service_actions",
                "configuration.discovery_actions",
                "configuration.autoregistration_actions",
                "configuration.internal_actions",
            ] {
                ui.push(json!({"name": name, "status": status.to_string()}));
            }
        }
    }
}

/// User directories: JIT provisioning references media types, roles and
/// user groups.
pub fn process_userdirectory(
    n: &Normalizer<'_>,
    records: Vec<Record>,
) -> Result<Outcome, NormalizeError> {
    let media_id_field = n.profile.id_field(EntityKind::MediaType).unwrap_or("mediatypeid");
    let group_id_field = n.profile.id_field(EntityKind::UserGroup).unwrap_or("usrgrpid");
    let mut kept = Vec::new();
    for mut record in records {
        let data = record.payload.as_object_mut().ok_or_else(|| {
            NormalizeError::new(EntityKind::UserDirectory, "record is not an object")
        })?;

        if let Some(Value::Array(medias)) = data.get_mut("provision_media") {
            let mut surviving = Vec::new();
            for mut media in medias.drain(..) {
                let Some(map) = media.as_object_mut() else {
                    continue;
                };
                map.remove("userdirectory_mediaid");
                let Some(target) = map.get(media_id_field).and_then(as_str_like) else {
                    continue;
                };
                match n.translate(EntityKind::MediaType, &target) {
                    Some(translated) => {
                        map.insert(media_id_field.to_string(), Value::String(translated));
                        surviving.push(media);
                    }
                    None => continue,
                }
            }
            *medias = surviving;
        }

        if let Some(Value::Array(groups)) = data.get_mut("provision_groups") {
            let mut surviving = Vec::new();
            for mut group in groups.drain(..) {
                let Some(map) = group.as_object_mut() else {
                    continue;
                };
                if let Some(target) = map.get("roleid").and_then(as_str_like) {
                    if let Some(translated) = n.translate(EntityKind::Role, &target) {
                        map.insert("roleid".to_string(), Value::String(translated));
                    }
                }
                let members: Vec<Value> = map
                    .remove("user_groups")
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|item| item.get(group_id_field).and_then(as_str_like))
                    .filter_map(|target| n.translate(EntityKind::UserGroup, &target))
                    .map(|id| json!({group_id_field: id}))
                    .collect();
                if members.is_empty() {
                    continue;
                }
                map.insert("user_groups".to_string(), Value::Array(members));
                surviving.push(group);
            }
            *groups = surviving;
        }

        if !n.is_master() {
            for key in ["provision_media", "provision_groups"] {
                if data.get(key).map(is_emptyish).unwrap_or(false) {
                    data.remove(key);
                }
            }
        }
        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

/// MFA methods: TOTP and Duo carry disjoint field sets, and the Duo
/// client secret comes from configuration because the API never returns
/// it.
pub fn process_mfa(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut kept = Vec::new();
    for mut record in records {
        let data = record
            .payload
            .as_object_mut()
            .ok_or_else(|| NormalizeError::new(EntityKind::Mfa, "record is not an object"))?;
        if !n.is_master() {
            match int_field(data, "type", 0) {
                1 => {
                    // TOTP
                    data.remove("api_hostname");
                    data.remove("clientid");
                    data.remove("client_secret");
                }
                2 => {
                    // Duo
                    data.remove("hash_function");
                    data.remove("code_length");
                    match n.settings.mfa_client_secret.get(&record.name) {
                        Some(secret) => {
                            data.insert("client_secret".to_string(), Value::String(secret.clone()));
                        }
                        None => continue,
                    }
                }
                _ => continue,
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

    fn user(name: &str, payload: Value) -> Record {
        Record::new(EntityKind::User, name, payload)
    }

    #[test]
    fn only_allow_listed_users_replicate() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.settings.enable_user.insert("ops".into(), "pw".into());
        fixture.seed(EntityKind::Role, &[("4", "Operator role")]);
        let n = fixture.normalizer();
        let outcome = process_user(
            &n,
            vec![
                user("ops", json!({"roleid": "Operator role", "usrgrps": []})),
                user("random", json!({"roleid": "Operator role", "usrgrps": []})),
            ],
        )
        .unwrap();
        let names: Vec<_> = outcome.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["ops"]);
        // New user gets the configured password.
        assert_eq!(outcome.records[0].payload["passwd"], json!("pw"));
        assert_eq!(outcome.records[0].payload["roleid"], json!("4"));
    }

    #[test]
    fn super_admins_are_skipped_without_explicit_permission() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture
            .settings
            .enable_user
            .insert("root-like".into(), "pw".into());
        fixture.seed(EntityKind::Role, &[("3", "Super admin role")]);
        let n = fixture.normalizer();
        let records = vec![user(
            "root-like",
            json!({"roleid": "Super admin role", "usrgrps": []}),
        )];
        let outcome = process_user(&n, records.clone()).unwrap();
        assert!(outcome.records.is_empty());

        let mut fixture2 = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture2
            .settings
            .enable_user
            .insert("root-like".into(), "pw".into());
        fixture2.settings.cloning_super_admin = true;
        fixture2.seed(EntityKind::Role, &[("3", "Super admin role")]);
        let n2 = fixture2.normalizer();
        assert_eq!(process_user(&n2, records).unwrap().records.len(), 1);
    }

    #[test]
    fn directory_sourced_users_never_replicate() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.settings.enable_user.insert("ldap-user".into(), "pw".into());
        let n = fixture.normalizer();
        let outcome = process_user(
            &n,
            vec![user("ldap-user", json!({"userdirectoryid": "7", "usrgrps": []}))],
        )
        .unwrap();
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn reserved_admin_is_never_deleted() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.seed(
            EntityKind::User,
            &[("1", names::SUPER_USER), ("5", "leaver")],
        );
        let n = fixture.normalizer();
        let outcome = process_user(&n, Vec::new()).unwrap();
        assert_eq!(
            outcome.extend,
            vec![(
                EntityKind::User,
                vec![ExtendOp::Delete { ids: vec!["5".into()] }]
            )]
        );
    }

    #[test]
    fn rights_split_feeds_both_tables_from_old_snapshots() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R5_4, Direction::Worker);
        fixture.seed(EntityKind::HostGroup, &[("5", "Linux servers")]);
        fixture.seed(EntityKind::TemplateGroup, &[("6", "Linux servers")]);
        let n = fixture.normalizer();
        let outcome = process_usergroup(
            &n,
            vec![Record::new(
                EntityKind::UserGroup,
                "Operators",
                json!({
                    "rights": [{"id": "Linux servers", "permission": "2"}],
                    "users": [{"userid": "1"}],
                }),
            )],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("rights").is_none());
        assert_eq!(
            data["hostgroup_rights"],
            json!([{"id": "5", "permission": "2"}])
        );
        assert_eq!(
            data["templategroup_rights"],
            json!([{"id": "6", "permission": "2"}])
        );
        assert!(data.get("users").is_none());
    }

    #[test]
    fn role_action_right_splits_for_old_snapshots() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_0, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process_role(
            &n,
            vec![Record::new(
                EntityKind::Role,
                "Operator role",
                json!({
                    "readonly": "0",
                    "rules": {
                        "ui": [
                            {"name": "configuration.actions", "status": "1"},
                            {"name": "monitoring.hosts", "status": "1"},
                        ],
                    },
                }),
            )],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("readonly").is_none());
        let ui = data["rules"]["ui"].as_array().unwrap();
        let names: Vec<_> = ui
            .iter()
            .map(|item| item["name"].as_str().unwrap().to_string())
            .collect();
        assert!(!names.contains(&"configuration.actions".to_string()));
        assert!(names.contains(&"configuration.trigger_actions".to_string()));
        assert!(names.contains(&"configuration.internal_actions".to_string()));
    }

    #[test]
    fn duo_mfa_requires_configured_secret() {
        let mut fixture = Fixture::new(Release::R7_0, Release::R7_0, Direction::Worker);
        fixture
            .settings
            .mfa_client_secret
            .insert("duo-main".into(), "s3cret".into());
        let n = fixture.normalizer();
        let outcome = process_mfa(
            &n,
            vec![
                Record::new(
                    EntityKind::Mfa,
                    "duo-main",
                    json!({"type": "2", "hash_function": "1"}),
                ),
                Record::new(EntityKind::Mfa, "duo-extra", json!({"type": "2"})),
                Record::new(
                    EntityKind::Mfa,
                    "totp",
                    json!({"type": "1", "clientid": "x", "hash_function": "1"}),
                ),
            ],
        )
        .unwrap();
        let names: Vec<_> = outcome.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["duo-main", "totp"]);
        assert_eq!(outcome.records[0].payload["client_secret"], json!("s3cret"));
        assert!(outcome.records[0].payload.get("hash_function").is_none());
        assert!(outcome.records[1].payload.get("clientid").is_none());
        assert_eq!(outcome.records[1].payload["hash_function"], json!("1"));
    }

    #[test]
    fn provision_groups_drop_when_memberless() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.seed(EntityKind::UserGroup, &[("3", "Operators")]);
        fixture.seed(EntityKind::Role, &[("4", "Operator role")]);
        let n = fixture.normalizer();
        let outcome = process_userdirectory(
            &n,
            vec![Record::new(
                EntityKind::UserDirectory,
                "corp-ldap",
                json!({
                    "provision_groups": [
                        {
                            "roleid": "Operator role",
                            "user_groups": [{"usrgrpid": "Operators"}],
                        },
                        {
                            "roleid": "Operator role",
                            "user_groups": [{"usrgrpid": "Gone group"}],
                        },
                    ],
                    "provision_media": [],
                }),
            )],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        let groups = data["provision_groups"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["roleid"], json!("4"));
        assert_eq!(groups[0]["user_groups"], json!([{"usrgrpid": "3"}]));
        assert!(data.get("provision_media").is_none());
    }
}
