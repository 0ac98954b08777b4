//! Action processor.
//!
//! Actions carry the widest shape drift of any kind: operation-list key
//! names moved between camelCase and snake_case, acknowledge operations
//! became update operations at 6.0, and several operation fields are only
//! legal for specific event sources.

use super::{Normalizer, Outcome};
use crate::error::NormalizeError;
use crate::kind::EntityKind;
use crate::release::Release;
use crate::snapshot::Record;
use crate::value::{as_int, int_field, is_emptyish, rewrite_id_fields, IdDirection};
use serde_json::{Map, Value};

/// Escalation fields dropped for discovery/autoregistration operations.
const ESCALATION_FIELDS: &[&str] = &["esc_period", "esc_step_from", "esc_step_to"];
/// Update-only fields dropped for event sources other than triggers.
const TRIGGER_ONLY_FIELDS: &[&str] = &["pause_symptoms", "pause_suppressed", "notify_if_canceled"];

pub fn process(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut kept = Vec::new();
    for mut record in records {
        let data = record
            .payload
            .as_object_mut()
            .ok_or_else(|| NormalizeError::new(EntityKind::Action, "record is not an object"))?;

        // Disabled actions never replicate.
        if int_field(data, "status", 0) == 1 {
            continue;
        }

        let operation_lists = normalize_operation_keys(data, n.release());
        let event_source = int_field(data, "eventsource", 0);

        if event_source != 0 {
            for field in TRIGGER_ONLY_FIELDS {
                data.remove(*field);
            }
        }
        // Update operations only exist for trigger and service events.
        if matches!(event_source, 1 | 2 | 3) {
            data.remove("update_operations");
            data.remove("updateOperations");
            data.remove("acknowledge_operations");
            data.remove("acknowledgeOperations");
        }
        // Discovery and autoregistration events have no recovery phase.
        if matches!(event_source, 1 | 2) {
            data.remove("recovery_operations");
            data.remove("recoveryOperations");
            data.remove("esc_period");
        }

        normalize_filter(n, data)?;

        for list_key in &operation_lists {
            let Some(Value::Array(operations)) = data.get_mut(list_key.as_str()) else {
                data.remove(list_key.as_str());
                continue;
            };
            for operation in operations.iter_mut() {
                normalize_operation(n, operation, list_key, event_source);
            }
            if data
                .get(list_key.as_str())
                .map(is_emptyish)
                .unwrap_or(true)
            {
                data.remove(list_key.as_str());
            }
        }

        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

/// Unify operation-list keys: `recoveryOperations` → `recovery_operations`
/// and, at 6.0 and later, `acknowledge_operations` → `update_operations`.
/// Returns the list keys present after unification.
fn normalize_operation_keys(data: &mut Map<String, Value>, release: Release) -> Vec<String> {
    let mut keys = vec!["operations".to_string()];
    for camel in ["recoveryOperations", "acknowledgeOperations"] {
        let mut snake = camel.replace('O', "_o");
        if release >= Release::R6_0 {
            snake = snake.replace("acknowledge", "update");
        }
        let value = data
            .remove(camel)
            .or_else(|| data.remove(&camel.replace('O', "_o")))
            .or_else(|| data.remove(&snake));
        if let Some(value) = value {
            data.insert(snake.clone(), value);
        }
        keys.push(snake);
    }
    keys
}

/// Normalize the condition filter. Returns whether a custom formula is in
/// use (which keeps per-condition formula ids alive).
fn normalize_filter(
    n: &Normalizer<'_>,
    data: &mut Map<String, Value>,
) -> Result<bool, NormalizeError> {
    let Some(filter) = data.get_mut("filter").and_then(Value::as_object_mut) else {
        return Ok(false);
    };

    // The server recomputes eval_formula on write.
    filter.remove("eval_formula");
    let custom_formula = int_field(filter, "evaltype", 0) >= 3;
    if !custom_formula {
        filter.remove("formula");
    }

    let release = n.release();
    let Some(Value::Array(conditions)) = filter.get_mut("conditions") else {
        return Ok(custom_formula);
    };
    let mut kept = Vec::new();
    for mut condition in conditions.drain(..) {
        let Some(map) = condition.as_object_mut() else {
            continue;
        };
        if release >= Release::R6_0 {
            if !custom_formula {
                map.remove("formulaid");
            }
            if map.get("value").map(is_emptyish).unwrap_or(false) {
                map.remove("value");
            }
            if map.get("value2").map(is_emptyish).unwrap_or(false) {
                map.remove("value2");
            }
        }
        let kind = match map.get("conditiontype").and_then(as_int) {
            Some(0) => Some(EntityKind::HostGroup),
            Some(1) => Some(EntityKind::Host),
            Some(13) => Some(EntityKind::Template),
            // Trigger-direct conditions cannot be correlated between
            // nodes; the condition is dropped entirely.
            Some(2) => continue,
            _ => None,
        };
        if let Some(kind) = kind {
            let Some(target) = map.get("value").and_then(|v| crate::value::as_str_like(v)) else {
                continue;
            };
            match n.translate(kind, &target) {
                Some(replacement) => {
                    map.insert("value".into(), Value::String(replacement));
                }
                None => continue,
            }
        }
        kept.push(condition);
    }
    *conditions = kept;
    Ok(custom_formula)
}

fn normalize_operation(
    n: &Normalizer<'_>,
    operation: &mut Value,
    list_key: &str,
    event_source: i64,
) {
    let Some(map) = operation.as_object_mut() else {
        return;
    };

    map.retain(|_, value| !is_emptyish(value));
    for field in n.profile.discard_fields(EntityKind::Action) {
        map.remove(*field);
    }
    if event_source != 0 {
        map.remove("evaltype");
    }
    if matches!(event_source, 1 | 2) {
        for field in ESCALATION_FIELDS {
            map.remove(*field);
        }
    }
    if list_key != "operations" {
        // Recovery/update phases carry no escalation conditions.
        map.remove("evaltype");
        // Notify-all-involved needs no media id.
        if int_field(map, "operationtype", -1) == 11 {
            if let Some(message) = map.get_mut("opmessage").and_then(Value::as_object_mut) {
                message.remove("mediatypeid");
            }
        }
    }

    // Scrub the nested operation bodies, then rename every id field in
    // one recursive walk.
    let discard = n.profile.discard_fields(EntityKind::Action);
    let mut empty_keys = Vec::new();
    for (key, value) in map.iter_mut() {
        match value {
            Value::Object(body) => {
                body.retain(|field, v| !discard.contains(&field.as_str()) && !is_emptyish(v));
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if let Some(body) = item.as_object_mut() {
                        body.retain(|field, _| !discard.contains(&field.as_str()));
                    }
                }
            }
            _ => {}
        }
        if is_emptyish(value) {
            empty_keys.push(key.clone());
        }
    }
    for key in empty_keys {
        map.remove(&key);
    }
    let direction = if n.is_master() {
        IdDirection::IdToName
    } else {
        IdDirection::NameToId
    };
    rewrite_id_fields(operation, n.profile, n.identity, direction, &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::testutil::Fixture;
    use crate::normalize::Direction;
    use serde_json::json;

    fn action_record(payload: Value) -> Record {
        Record::new(EntityKind::Action, "notify-ops", payload)
    }

    #[test]
    fn disabled_actions_are_dropped() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![action_record(json!({"status": "1", "eventsource": "0"}))],
        )
        .unwrap();
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn acknowledge_operations_become_update_operations_at_6_0() {
        let fixture = Fixture::new(Release::R6_0, Release::R5_4, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![action_record(json!({
                "status": "0",
                "eventsource": "0",
                "acknowledgeOperations": [{"operationtype": "0", "opmessage": {"default_msg": "1"}}],
            }))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("acknowledgeOperations").is_none());
        assert!(data.get("update_operations").is_some());
    }

    #[test]
    fn filter_conditions_rewrite_through_identity() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.seed(EntityKind::HostGroup, &[("21", "Linux servers")]);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![action_record(json!({
                "status": "0",
                "eventsource": "0",
                "filter": {
                    "evaltype": "0",
                    "eval_formula": "A",
                    "conditions": [
                        {"conditiontype": "0", "value": "Linux servers"},
                        {"conditiontype": "2", "value": "some trigger"},
                    ],
                },
            }))],
        )
        .unwrap();
        let filter = &outcome.records[0].payload["filter"];
        assert!(filter.get("eval_formula").is_none());
        let conditions = filter["conditions"].as_array().unwrap();
        // The trigger-direct condition is gone; the group resolved to id.
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0]["value"], json!("21"));
    }

    #[test]
    fn unresolvable_condition_targets_are_dropped() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![action_record(json!({
                "status": "0",
                "eventsource": "0",
                "filter": {
                    "evaltype": "0",
                    "conditions": [{"conditiontype": "0", "value": "No such group"}],
                },
            }))],
        )
        .unwrap();
        let conditions = outcome.records[0].payload["filter"]["conditions"]
            .as_array()
            .unwrap();
        assert!(conditions.is_empty());
    }

    #[test]
    fn discovery_actions_lose_recovery_and_escalation() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![action_record(json!({
                "status": "0",
                "eventsource": "1",
                "esc_period": "1h",
                "pause_suppressed": "1",
                "recovery_operations": [{"operationtype": "0"}],
                "operations": [{
                    "operationtype": "0",
                    "esc_period": "0",
                    "esc_step_from": "1",
                    "esc_step_to": "1",
                    "opmessage": {"default_msg": "1"},
                }],
            }))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("recovery_operations").is_none());
        assert!(data.get("esc_period").is_none());
        assert!(data.get("pause_suppressed").is_none());
        let operation = &data["operations"][0];
        assert!(operation.get("esc_step_from").is_none());
    }

    #[test]
    fn operation_ids_rewrite_on_export() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Master);
        fixture.seed(EntityKind::UserGroup, &[("9", "Operators")]);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![action_record(json!({
                "status": "0",
                "eventsource": "0",
                "operations": [{
                    "operationtype": "0",
                    "operationid": "77",
                    "opmessage_grp": [{"usrgrpid": "9"}],
                }],
            }))],
        )
        .unwrap();
        let operation = &outcome.records[0].payload["operations"][0];
        assert!(operation.get("operationid").is_none());
        assert_eq!(operation["opmessage_grp"][0]["usrgrpid"], json!("Operators"));
    }
}
