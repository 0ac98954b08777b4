//! Network-discovery rule processor.
//!
//! Rules reference the proxy that runs them; the field name changed from
//! `proxy_hostid` to `proxyid` at 7.0. Each check carries only the fields
//! its check type understands, so everything else is pruned before write.

use super::{Normalizer, Outcome};
use crate::error::NormalizeError;
use crate::kind::EntityKind;
use crate::release::Release;
use crate::snapshot::Record;
use crate::value::{as_str_like, int_field};
use serde_json::Value;

// Check types by the fields they understand.
const AGENT_TYPES: &[i64] = &[9, 10, 11, 13];
const SNMP_V1_V2_TYPES: &[i64] = &[10, 11];
const SNMP_V3_TYPES: &[i64] = &[13];
const ICMP_TYPES: &[i64] = &[12];

const SNMP_V3_FIELDS: &[&str] = &[
    "snmpv3_authpassphrase",
    "snmpv3_authprotocol",
    "snmpv3_contextname",
    "snmpv3_privpassphrase",
    "snmpv3_privprotocol",
    "snmpv3_securitylevel",
    "snmpv3_securityname",
];

pub fn process(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut kept = Vec::new();
    for mut record in records {
        let data = record.payload.as_object_mut().ok_or_else(|| {
            NormalizeError::new(EntityKind::DiscoveryRule, "record is not an object")
        })?;

        // Which proxy field this release reads, and whether the snapshot
        // used the older name.
        let (source_field, rename_to) = if n.release() >= Release::R7_0 {
            if n.master_release < Release::R7_0 && !n.is_master() {
                ("proxy_hostid", Some("proxyid"))
            } else {
                ("proxyid", None)
            }
        } else {
            ("proxy_hostid", None)
        };
        let target = data.get(source_field).and_then(|v| as_str_like(v));
        let translated = target.and_then(|t| n.translate(EntityKind::Proxy, &t));
        let Some(proxy) = translated else {
            // A rule whose proxy does not exist here cannot run here.
            continue;
        };
        match rename_to {
            Some(new_field) => {
                data.remove(source_field);
                data.insert(new_field.to_string(), Value::String(proxy));
            }
            None => {
                data.insert(source_field.to_string(), Value::String(proxy));
            }
        }

        if !n.is_master() {
            for field in n.profile.discard_fields(EntityKind::DiscoveryRule) {
                data.remove(*field);
            }
            data.remove("error");
            if let Some(Value::Array(checks)) = data.get_mut("dchecks") {
                for check in checks.iter_mut() {
                    let Some(map) = check.as_object_mut() else {
                        continue;
                    };
                    let check_type = int_field(map, "type", -1);
                    map.remove("dcheckid");
                    map.remove("druleid");
                    for field in ["port", "host_source", "name_source"] {
                        if int_field(map, field, 0) == 0 {
                            map.remove(field);
                        }
                    }
                    if !AGENT_TYPES.contains(&check_type) {
                        map.remove("key_");
                    }
                    if !SNMP_V1_V2_TYPES.contains(&check_type) {
                        map.remove("snmp_community");
                    }
                    if !SNMP_V3_TYPES.contains(&check_type) {
                        for field in SNMP_V3_FIELDS {
                            map.remove(*field);
                        }
                    }
                    if !ICMP_TYPES.contains(&check_type) {
                        map.remove("allow_redirect");
                    }
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

    fn rule(payload: Value) -> Record {
        Record::new(EntityKind::DiscoveryRule, "lan-sweep", payload)
    }

    #[test]
    fn rules_without_a_local_proxy_drop() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![rule(json!({"proxy_hostid": "unknown-proxy", "dchecks": []}))],
        )
        .unwrap();
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn server_direct_rules_survive_via_sentinel() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![rule(json!({
                "proxy_hostid": crate::identity::SERVER_DIRECT,
                "dchecks": [],
            }))],
        )
        .unwrap();
        assert_eq!(outcome.records[0].payload["proxy_hostid"], json!("0"));
    }

    #[test]
    fn old_snapshot_renames_proxy_field_at_7_0() {
        let mut fixture = Fixture::new(Release::R7_0, Release::R6_2, Direction::Worker);
        fixture.seed(EntityKind::Proxy, &[("12", "edge-proxy")]);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![rule(json!({"proxy_hostid": "edge-proxy", "dchecks": []}))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("proxy_hostid").is_none());
        assert_eq!(data["proxyid"], json!("12"));
    }

    #[test]
    fn checks_keep_only_type_relevant_fields() {
        let fixture = Fixture::new(Release::R7_0, Release::R7_0, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![rule(json!({
                "proxyid": crate::identity::SERVER_DIRECT,
                "nextcheck": "123",
                "error": "x",
                "dchecks": [
                    {
                        "type": "12",
                        "dcheckid": "1",
                        "key_": "icmpping",
                        "snmp_community": "public",
                        "allow_redirect": "1",
                        "port": "0",
                    },
                    {
                        "type": "11",
                        "snmp_community": "public",
                        "key_": ".1.3.6.1.2.1.1.1.0",
                        "snmpv3_securityname": "x",
                        "port": "161",
                    },
                ],
            }))],
        )
        .unwrap();
        let data = &outcome.records[0].payload;
        assert!(data.get("nextcheck").is_none());
        assert!(data.get("error").is_none());
        let icmp = &data["dchecks"][0];
        assert!(icmp.get("key_").is_none());
        assert!(icmp.get("snmp_community").is_none());
        assert!(icmp.get("port").is_none());
        assert_eq!(icmp["allow_redirect"], json!("1"));
        let snmp = &data["dchecks"][1];
        assert_eq!(snmp["snmp_community"], json!("public"));
        assert_eq!(snmp["key_"], json!(".1.3.6.1.2.1.1.1.0"));
        assert!(snmp.get("snmpv3_securityname").is_none());
        assert!(snmp.get("allow_redirect").is_none());
        assert_eq!(snmp["port"], json!("161"));
    }
}
