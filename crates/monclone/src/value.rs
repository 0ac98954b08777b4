//! Pure transforms over dynamic Monitor payloads.
//!
//! Payloads are arbitrary JSON trees; release-specific reshaping is
//! expressed as small pure functions here so the per-kind processors stay
//! declarative. The one non-trivial transform is [`rewrite_id_fields`], a
//! recursive walk that renames ids to names (or back) wherever a map key
//! matches a known id field name.

use crate::identity::IdentityMap;
use crate::kind::EntityKind;
use crate::profile::Profile;
use serde_json::{Map, Value};

/// Direction of an identity rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdDirection {
    /// Local ids become stable names (master export).
    IdToName,
    /// Stable names become local ids (worker import).
    NameToId,
}

/// Read a value as an integer, accepting both numbers and numeric strings.
/// The Monitor API stringifies most numbers.
pub fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Integer field of a map, defaulting when absent or non-numeric.
pub fn int_field(map: &Map<String, Value>, key: &str, default: i64) -> i64 {
    map.get(key).and_then(as_int).unwrap_or(default)
}

/// Read a value as a string, accepting numbers.
pub fn as_str_like(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Whether a value is the kind of emptiness the Monitor treats as
/// "use the default": null, empty string, zero, empty list or map.
pub fn is_emptyish(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(n) => n.as_i64() == Some(0) || n.as_u64() == Some(0),
        Value::Bool(_) => false,
    }
}

/// Drop the listed keys from a map value. Non-maps pass through.
pub fn strip_keys(value: &mut Value, keys: &[&str]) {
    if let Value::Object(map) = value {
        for key in keys {
            map.remove(*key);
        }
    }
}

/// Drop every top-level key whose value is empty-ish.
pub fn strip_emptyish(value: &mut Value) {
    if let Value::Object(map) = value {
        map.retain(|_, v| !is_emptyish(v));
    }
}

/// Rename a key, keeping its value, when present.
pub fn rename_key(value: &mut Value, from: &str, to: &str) {
    if let Value::Object(map) = value {
        if let Some(v) = map.remove(from) {
            map.insert(to.to_string(), v);
        }
    }
}

/// Move a key's value out of a map.
pub fn take_key(value: &mut Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.remove(key),
        _ => None,
    }
}

/// Recursively rewrite every scalar sitting under a known id field name.
///
/// The walk descends maps and lists. For each map entry whose key resolves
/// through [`Profile::kind_for_id_field`], the scalar value is translated
/// through the identity map in the requested direction; unresolvable
/// targets are left untouched. `skip` names fields that must not be
/// rewritten even though they look like id fields (escape hook for kinds
/// whose processor handles them specially).
pub fn rewrite_id_fields(
    value: &mut Value,
    profile: &Profile,
    identity: &IdentityMap,
    direction: IdDirection,
    skip: &[&str],
) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if !skip.contains(&key.as_str()) {
                    if let Some(kind) = profile.kind_for_id_field(key) {
                        if let Some(target) = as_str_like(entry) {
                            if let Some(replacement) = translate(identity, kind, &target, direction)
                            {
                                *entry = Value::String(replacement);
                                continue;
                            }
                        }
                    }
                }
                rewrite_id_fields(entry, profile, identity, direction, skip);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_id_fields(item, profile, identity, direction, skip);
            }
        }
        _ => {}
    }
}

/// Translate one scalar through the identity map.
pub fn translate(
    identity: &IdentityMap,
    kind: EntityKind,
    target: &str,
    direction: IdDirection,
) -> Option<String> {
    match direction {
        IdDirection::IdToName => identity.to_name(kind, target),
        IdDirection::NameToId => identity.to_id(kind, target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::Release;
    use serde_json::json;

    fn fixture() -> (Profile, IdentityMap) {
        let profile = Profile::for_release(Release::R7_0).unwrap();
        let mut identity = IdentityMap::new();
        identity.load(
            EntityKind::Host,
            [("101".to_string(), "web1".to_string())],
        );
        identity.load(
            EntityKind::HostGroup,
            [("5".to_string(), "Linux servers".to_string())],
        );
        (profile, identity)
    }

    #[test]
    fn emptyish_covers_the_default_shapes() {
        assert!(is_emptyish(&json!(null)));
        assert!(is_emptyish(&json!("")));
        assert!(is_emptyish(&json!(0)));
        assert!(is_emptyish(&json!([])));
        assert!(is_emptyish(&json!({})));
        assert!(!is_emptyish(&json!("0.5")));
        assert!(!is_emptyish(&json!(false)));
    }

    #[test]
    fn id_walk_descends_nested_structures() {
        let (profile, identity) = fixture();
        let mut payload = json!({
            "operations": [
                {"opcommand_hst": [{"hostid": "101"}]},
                {"opgroup": [{"groupid": 5}]}
            ],
        });
        rewrite_id_fields(
            &mut payload,
            &profile,
            &identity,
            IdDirection::IdToName,
            &[],
        );
        assert_eq!(
            payload["operations"][0]["opcommand_hst"][0]["hostid"],
            json!("web1")
        );
        assert_eq!(
            payload["operations"][1]["opgroup"][0]["groupid"],
            json!("Linux servers")
        );
    }

    #[test]
    fn id_walk_leaves_unknown_targets_alone() {
        let (profile, identity) = fixture();
        let mut payload = json!({"hostid": "999"});
        rewrite_id_fields(
            &mut payload,
            &profile,
            &identity,
            IdDirection::IdToName,
            &[],
        );
        assert_eq!(payload["hostid"], json!("999"));
    }

    #[test]
    fn id_walk_honors_skip_list() {
        let (profile, identity) = fixture();
        let mut payload = json!({"hostid": "101"});
        rewrite_id_fields(
            &mut payload,
            &profile,
            &identity,
            IdDirection::IdToName,
            &["hostid"],
        );
        assert_eq!(payload["hostid"], json!("101"));
    }

    #[test]
    fn id_walk_reverses_on_import() {
        let (profile, identity) = fixture();
        let mut payload = json!({"opgroup": [{"groupid": "Linux servers"}]});
        rewrite_id_fields(
            &mut payload,
            &profile,
            &identity,
            IdDirection::NameToId,
            &[],
        );
        assert_eq!(payload["opgroup"][0]["groupid"], json!("5"));
    }
}
