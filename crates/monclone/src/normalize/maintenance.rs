//! Maintenance-window processor.
//!
//! Windows are pruned of expired one-shot periods and of period fields
//! that do not apply to the period type. The group/host target lists use
//! different container keys per release and per call direction, so the
//! master flattens them to names and the worker rebuilds the id objects
//! under the key its own release expects.

use super::{Normalizer, Outcome};
use crate::error::NormalizeError;
use crate::kind::EntityKind;
use crate::release::Release;
use crate::snapshot::Record;
use crate::value::{as_str_like, int_field};
use chrono::Utc;
use serde_json::{json, Value};

pub fn process(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let now = Utc::now().timestamp();
    let mut kept = Vec::new();
    for mut record in records {
        let data = record.payload.as_object_mut().ok_or_else(|| {
            NormalizeError::new(EntityKind::Maintenance, "record is not an object")
        })?;

        if let Some(Value::Array(periods)) = data.get_mut("timeperiods") {
            let mut surviving = Vec::new();
            for mut period in periods.drain(..) {
                let Some(map) = period.as_object_mut() else {
                    continue;
                };
                match int_field(map, "timeperiod_type", -1) {
                    0 => {
                        // One-shot: drop once its window has passed.
                        let start = int_field(map, "start_date", 0);
                        let length = int_field(map, "period", 0);
                        if start + length < now {
                            continue;
                        }
                        for field in ["start_time", "every", "day", "dayofweek", "month"] {
                            map.remove(field);
                        }
                    }
                    1 => {
                        for field in ["start_date", "dayofweek"] {
                            map.remove(field);
                        }
                    }
                    2 => {
                        for field in ["start_date", "day"] {
                            map.remove(field);
                        }
                    }
                    3 => {
                        map.remove("start_date");
                    }
                    _ => {}
                }
                surviving.push(period);
            }
            *periods = surviving;
        }

        let no_periods = data
            .get("timeperiods")
            .and_then(Value::as_array)
            .map(Vec::is_empty)
            .unwrap_or(true);
        if no_periods || int_field(data, "active_till", 0) < now {
            continue;
        }

        if n.is_master() {
            flatten_targets(n, data);
        } else {
            resolve_targets(n, data);
        }

        let empty = |key: &str| {
            data.get(key)
                .and_then(Value::as_array)
                .map(Vec::is_empty)
                .unwrap_or(true)
        };
        let (groups_key, hosts_key) = worker_keys(n.release());
        if n.is_master() {
            if empty("groups") && empty("hosts") {
                continue;
            }
        } else if empty(groups_key) && empty(hosts_key) {
            continue;
        }

        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

/// Container keys a worker release expects on create/update.
fn worker_keys(release: Release) -> (&'static str, &'static str) {
    if release >= Release::R6_2 {
        ("groups", "hosts")
    } else {
        ("groupids", "hostids")
    }
}

/// Container keys the master's `get` returned the targets under.
fn master_source_keys(master_release: Release) -> (&'static str, &'static str) {
    if master_release >= Release::R6_2 {
        ("hostgroups", "hosts")
    } else {
        ("groups", "hosts")
    }
}

/// Master: collapse target objects to plain name lists under the
/// release-independent `groups`/`hosts` keys.
fn flatten_targets(n: &Normalizer<'_>, data: &mut serde_json::Map<String, Value>) {
    let (source_groups, source_hosts) = master_source_keys(n.release());
    for (source, target, kind) in [
        (source_groups, "groups", EntityKind::HostGroup),
        (source_hosts, "hosts", EntityKind::Host),
    ] {
        let name_field = n.profile.name_field(kind).unwrap_or("name");
        let names: Vec<Value> = data
            .remove(source)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
            .iter()
            .filter_map(|item| item.get(name_field).and_then(as_str_like))
            .map(Value::String)
            .collect();
        if names.is_empty() {
            data.remove(target);
        } else {
            data.insert(target.to_string(), Value::Array(names));
        }
    }
    if data
        .get("tags")
        .and_then(Value::as_array)
        .map(Vec::is_empty)
        .unwrap_or(false)
    {
        data.remove("tags");
    }
}

/// Worker: expand the name lists back into `{idField: id}` objects under
/// the keys this release accepts, dropping names without a local match.
fn resolve_targets(n: &Normalizer<'_>, data: &mut serde_json::Map<String, Value>) {
    let (groups_key, hosts_key) = worker_keys(n.release());
    let (snapshot_groups, snapshot_hosts) = if n.master_release >= Release::R6_2 {
        ("hostgroups", "hosts")
    } else {
        ("groups", "hosts")
    };
    // Snapshots produced by this engine flatten to groups/hosts; accept
    // the raw master container keys as well for direct-mode reads.
    for (target_key, source_keys, kind) in [
        (
            groups_key,
            ["groups", snapshot_groups],
            EntityKind::HostGroup,
        ),
        (hosts_key, ["hosts", snapshot_hosts], EntityKind::Host),
    ] {
        let mut names = Vec::new();
        for source in source_keys {
            if let Some(Value::Array(items)) = data.remove(source) {
                names.extend(items);
            }
        }
        let id_field = n.profile.id_field(kind).unwrap_or("groupid");
        let resolved: Vec<Value> = names
            .iter()
            .filter_map(as_str_like)
            .filter_map(|name| n.translate(kind, &name))
            .map(|id| json!({id_field: id}))
            .collect();
        if resolved.is_empty() {
            data.remove(target_key);
        } else {
            data.insert(target_key.to_string(), Value::Array(resolved));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::testutil::Fixture;
    use crate::normalize::Direction;
    use serde_json::json;

    fn window(payload: Value) -> Record {
        Record::new(EntityKind::Maintenance, "patchday", payload)
    }

    fn future() -> i64 {
        Utc::now().timestamp() + 86_400
    }

    #[test]
    fn expired_one_shot_periods_and_windows_drop() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Master);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![
                window(json!({
                    "active_till": future().to_string(),
                    "timeperiods": [
                        {"timeperiod_type": "0", "start_date": "1000", "period": "600"},
                    ],
                    "hosts": [{"host": "web1"}],
                })),
                window(json!({
                    "active_till": "1000",
                    "timeperiods": [{"timeperiod_type": "3", "start_date": "1"}],
                    "hosts": [{"host": "web1"}],
                })),
            ],
        )
        .unwrap();
        // First window loses its only period, second is expired outright.
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn period_type_specific_fields_are_pruned() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Master);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![window(json!({
                "active_till": future().to_string(),
                "timeperiods": [{
                    "timeperiod_type": "2",
                    "start_date": "123",
                    "day": "5",
                    "dayofweek": "64",
                    "every": "1",
                }],
                "hosts": [{"host": "web1"}],
            }))],
        )
        .unwrap();
        let period = &outcome.records[0].payload["timeperiods"][0];
        assert!(period.get("start_date").is_none());
        assert!(period.get("day").is_none());
        assert_eq!(period["dayofweek"], json!("64"));
    }

    #[test]
    fn master_flattens_targets_to_names() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Master);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![window(json!({
                "active_till": future().to_string(),
                "timeperiods": [{"timeperiod_type": "3", "start_date": "1"}],
                "hostgroups": [{"name": "Linux servers"}],
                "hosts": [{"host": "web1"}],
                "tags": [],
            }))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert_eq!(data["groups"], json!(["Linux servers"]));
        assert_eq!(data["hosts"], json!(["web1"]));
        assert!(data.get("tags").is_none());
    }

    #[test]
    fn worker_resolves_names_per_release_key() {
        let mut fixture = Fixture::new(Release::R6_0, Release::R6_4, Direction::Worker);
        fixture.seed(EntityKind::HostGroup, &[("4", "Linux servers")]);
        fixture.seed(EntityKind::Host, &[("10", "web1")]);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![window(json!({
                "active_till": future().to_string(),
                "timeperiods": [{"timeperiod_type": "3", "start_date": "1"}],
                "groups": ["Linux servers", "No such group"],
                "hosts": ["web1"],
            }))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        // 6.0 wants plural-id keys.
        assert_eq!(data["groupids"], json!([{"groupid": "4"}]));
        assert_eq!(data["hostids"], json!([{"hostid": "10"}]));
    }

    #[test]
    fn windows_with_no_resolvable_targets_drop() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![window(json!({
                "active_till": future().to_string(),
                "timeperiods": [{"timeperiod_type": "3", "start_date": "1"}],
                "groups": ["No such group"],
            }))],
        )
        .unwrap();
        assert!(outcome.records.is_empty());
    }
}
