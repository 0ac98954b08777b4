//! Service, SLA and connector processors.
//!
//! Service trees are self-referential: parent/child links can only be
//! resolved after every service of the snapshot exists locally, so the
//! worker strips the links into follow-up EXTEND updates and resolves
//! them in a second pass.

use super::{ExtendOp, Normalizer, Outcome};
use crate::error::NormalizeError;
use crate::kind::EntityKind;
use crate::snapshot::Record;
use crate::value::{as_str_like, is_emptyish};
use serde_json::{json, Value};

pub fn process_service(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut kept = Vec::new();
    let mut links = Vec::new();
    for mut record in records {
        let data = record
            .payload
            .as_object_mut()
            .ok_or_else(|| NormalizeError::new(EntityKind::Service, "record is not an object"))?;

        if n.is_master() {
            // Flatten the relation objects to bare name lists.
            for key in ["parents", "children"] {
                let names: Vec<Value> = data
                    .remove(key)
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|item| item.get("name").and_then(as_str_like))
                    .map(Value::String)
                    .collect();
                data.insert(key.to_string(), Value::Array(names));
            }
        } else {
            for field in n.profile.discard_fields(EntityKind::Service) {
                data.remove(*field);
            }
            // Pull the relations out; they re-apply after creation.
            let parents = data.remove("parents").unwrap_or_else(|| json!([]));
            let children = data.remove("children").unwrap_or_else(|| json!([]));
            links.push(ExtendOp::Update {
                name: record.name.clone(),
                payload: json!({"parents": parents, "children": children}),
            });
        }
        kept.push(record);
    }

    let mut outcome = Outcome::records(kept);
    let deletions = n.deletions_against(EntityKind::Service, &outcome.records, &[]);
    let mut ops = links;
    if !deletions.is_empty() {
        ops.push(ExtendOp::Delete { ids: deletions });
    }
    if !ops.is_empty() {
        outcome.extend.push((EntityKind::Service, ops));
    }
    Ok(outcome)
}

/// Second pass, run at EXTEND time once services exist: replace the name
/// lists with `{serviceid: id}` references.
pub fn resolve_links(n: &Normalizer<'_>, payload: &mut Value) {
    let Some(map) = payload.as_object_mut() else {
        return;
    };
    let id_field = n.profile.id_field(EntityKind::Service).unwrap_or("serviceid");
    for key in ["parents", "children"] {
        let resolved: Vec<Value> = map
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(as_str_like)
                    .filter_map(|name| n.identity.to_id(EntityKind::Service, &name))
                    .map(|id| json!({id_field: id}))
                    .collect()
            })
            .unwrap_or_default();
        map.insert(key.to_string(), Value::Array(resolved));
    }
}

/// SLAs: drop write-rejected fields when empty; the worker also deletes
/// SLAs the snapshot no longer carries.
pub fn process_sla(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut kept = Vec::new();
    for mut record in records {
        if !n.is_master() {
            let data = record
                .payload
                .as_object_mut()
                .ok_or_else(|| NormalizeError::new(EntityKind::Sla, "record is not an object"))?;
            for field in n.profile.discard_fields(EntityKind::Sla) {
                if data.get(*field).map(is_emptyish).unwrap_or(false) {
                    data.remove(*field);
                }
            }
        }
        kept.push(record);
    }
    let mut outcome = Outcome::records(kept);
    let ids = n.deletions_against(EntityKind::Sla, &outcome.records, &[]);
    if !ids.is_empty() {
        outcome
            .extend
            .push((EntityKind::Sla, vec![ExtendOp::Delete { ids }]));
    }
    Ok(outcome)
}

/// Connectors replicate as-is; the worker computes deletions only.
pub fn process_connector(
    n: &Normalizer<'_>,
    records: Vec<Record>,
) -> Result<Outcome, NormalizeError> {
    let mut outcome = Outcome::records(records);
    let ids = n.deletions_against(EntityKind::Connector, &outcome.records, &[]);
    if !ids.is_empty() {
        outcome
            .extend
            .push((EntityKind::Connector, vec![ExtendOp::Delete { ids }]));
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::testutil::Fixture;
    use crate::normalize::Direction;
    use crate::release::Release;
    use serde_json::json;

    #[test]
    fn master_flattens_relations_to_names() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Master);
        let n = fixture.normalizer();
        let outcome = process_service(
            &n,
            vec![Record::new(
                EntityKind::Service,
                "checkout",
                json!({
                    "parents": [{"name": "shop"}],
                    "children": [{"name": "payments"}, {"name": "cart"}],
                }),
            )],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert_eq!(data["parents"], json!(["shop"]));
        assert_eq!(data["children"], json!(["payments", "cart"]));
        assert!(outcome.extend.is_empty());
    }

    #[test]
    fn worker_splits_relations_into_extend_updates() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.seed(EntityKind::Service, &[("1", "stale-service")]);
        let n = fixture.normalizer();
        let outcome = process_service(
            &n,
            vec![Record::new(
                EntityKind::Service,
                "checkout",
                json!({
                    "status": "-1",
                    "uuid": "x",
                    "parents": ["shop"],
                    "children": [],
                }),
            )],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("parents").is_none());
        assert!(data.get("status").is_none());
        let (kind, ops) = &outcome.extend[0];
        assert_eq!(*kind, EntityKind::Service);
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            ExtendOp::Update { name, payload } => {
                assert_eq!(name, "checkout");
                assert_eq!(payload["parents"], json!(["shop"]));
            }
            other => panic!("unexpected op: {other:?}"),
        }
        match &ops[1] {
            ExtendOp::Delete { ids } => assert_eq!(ids, &vec!["1".to_string()]),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn link_resolution_maps_names_to_ids() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.seed(EntityKind::Service, &[("11", "shop"), ("12", "checkout")]);
        let n = fixture.normalizer();
        let mut payload = json!({"parents": ["shop", "gone"], "children": []});
        resolve_links(&n, &mut payload);
        assert_eq!(payload["parents"], json!([{"serviceid": "11"}]));
        assert_eq!(payload["children"], json!([]));
    }

    #[test]
    fn sla_empty_discards_drop_but_populated_survive() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process_sla(
            &n,
            vec![Record::new(
                EntityKind::Sla,
                "gold",
                json!({
                    "schedule": [],
                    "service_tags": [{"tag": "tier", "value": "1"}],
                }),
            )],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("schedule").is_none());
        assert!(data.get("service_tags").is_some());
    }

    #[test]
    fn connector_deletions_track_departures() {
        let mut fixture = Fixture::new(Release::R7_0, Release::R7_0, Direction::Worker);
        fixture.seed(EntityKind::Connector, &[("2", "stream-old")]);
        let n = fixture.normalizer();
        let outcome = process_connector(&n, Vec::new()).unwrap();
        assert_eq!(
            outcome.extend,
            vec![(
                EntityKind::Connector,
                vec![ExtendOp::Delete { ids: vec!["2".into()] }]
            )]
        );
    }
}
