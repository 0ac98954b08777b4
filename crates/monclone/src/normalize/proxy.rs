//! Proxy and proxy-group processors.
//!
//! A worker adopts only the proxies whose description carries exactly its
//! own marker (`MC_WORKER:<node>;`). PSK material never travels in a
//! snapshot; it is resolved from configuration and, when absent or
//! malformed, the proxy is downgraded to unencrypted with an annotation
//! in its description. At 7.0 the pre-7.0 proxy shape translates into the
//! `operating_mode`/`allowed_addresses`/`name` form.

use super::{ExtendOp, Normalizer, Outcome};
use crate::error::NormalizeError;
use crate::kind::EntityKind;
use crate::names;
use crate::release::Release;
use crate::snapshot::Record;
use crate::value::{as_str_like, int_field};
use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value};

pub fn process(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    if n.is_master() {
        return process_master(n, records);
    }
    process_worker(n, records)
}

fn process_master(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut kept = Vec::new();
    for mut record in records {
        if n.release() >= Release::R7_0 {
            let data = record.payload.as_object_mut().ok_or_else(|| {
                NormalizeError::new(EntityKind::Proxy, "record is not an object")
            })?;
            let id_field = n.profile.id_field(EntityKind::ProxyGroup).unwrap_or("proxy_groupid");
            if let Some(target) = data.get(id_field).and_then(as_str_like) {
                if let Some(name) = n.translate(EntityKind::ProxyGroup, &target) {
                    data.insert(id_field.to_string(), Value::String(name));
                }
            }
        }
        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

fn process_worker(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    #[allow(clippy::unwrap_used)] // literal pattern
    let marker_any = Regex::new(&format!("{}:[0-9a-zA-Z-_.]*", names::WORKER_TAG)).unwrap();
    #[allow(clippy::unwrap_used)] // node names are word-safe
    let marker_mine = Regex::new(&format!(
        "^{}:{};",
        names::WORKER_TAG,
        regex::escape(&n.settings.node)
    ))
    .unwrap();

    let mut kept = Vec::new();
    let mut delete_ids = Vec::new();
    for mut record in records {
        let data = record
            .payload
            .as_object_mut()
            .ok_or_else(|| NormalizeError::new(EntityKind::Proxy, "record is not an object"))?;

        for field in n.profile.discard_fields(EntityKind::Proxy) {
            data.remove(*field);
        }
        // Per-check timeouts only mean something with the override flag.
        let custom_timeouts = int_field(data, "custom_timeouts", 0) != 0;
        let timeout_keys: Vec<String> = data
            .keys()
            .filter(|key| key.starts_with("timeout_"))
            .cloned()
            .collect();
        for key in timeout_keys {
            let empty = data.get(&key).map(crate::value::is_emptyish).unwrap_or(true);
            if !custom_timeouts || empty {
                data.remove(&key);
            }
        }

        // Pre-7.0 the status field encodes the mode; 5 is passive.
        let mut mode = if int_field(data, "status", 5) == 5 { 1 } else { 0 };
        if n.release() >= Release::R7_0 {
            let group_field = n.profile.id_field(EntityKind::ProxyGroup).unwrap_or("proxy_groupid");
            if n.master_release >= Release::R7_0 {
                if let Some(target) = data.get(group_field).and_then(as_str_like) {
                    if let Some(id) = n.translate(EntityKind::ProxyGroup, &target) {
                        data.insert(group_field.to_string(), Value::String(id));
                    }
                }
                mode = int_field(data, "operating_mode", 0);
            } else {
                // Translate the old shape into the 7.0 proxy object.
                data.insert(group_field.to_string(), Value::String("0".into()));
                if let Some(host) = data.remove("host") {
                    data.insert("name".into(), host);
                }
                if let Some(address) = data.remove("proxy_address") {
                    data.insert("allowed_addresses".into(), address);
                }
                data.insert("operating_mode".into(), Value::String(mode.to_string()));
                data.remove("status");
            }
        }

        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        // Zero or multiple markers means the proxy is not addressable.
        if marker_any.find_iter(&description).count() != 1 {
            continue;
        }
        if !marker_mine.is_match(&description) {
            // Assigned to another worker now; drop it locally if present.
            if let Some(local) = n.local.get(EntityKind::Proxy, &record.name) {
                delete_ids.push(local.id.clone());
            }
            continue;
        }

        apply_psk(n, &record.name, data, mode);
        kept.push(record);
    }

    let mut outcome = Outcome::records(kept);
    if !delete_ids.is_empty() {
        outcome
            .extend
            .push((EntityKind::Proxy, vec![ExtendOp::Delete { ids: delete_ids }]));
    }
    Ok(outcome)
}

/// Resolve PSK material from configuration, or downgrade to unencrypted
/// with an annotation.
fn apply_psk(n: &Normalizer<'_>, name: &str, data: &mut Map<String, Value>, mode: i64) {
    let passive = mode == 1;
    let use_psk = if passive {
        int_field(data, "tls_connect", 1) == 2
    } else {
        // tls_accept is a bitmap: 1 none, 2 PSK, 4 certificate.
        !matches!(int_field(data, "tls_accept", 1), 1 | 4 | 5)
    };
    if !use_psk {
        return;
    }

    let material = n.settings.proxy_psk.get(name).filter(|(_, psk)| {
        (64..=1024).contains(&psk.len()) && psk.chars().all(|c| c.is_ascii_hexdigit())
    });

    match material {
        Some((identity, psk)) => {
            data.insert("tls_psk_identity".into(), Value::String(identity.clone()));
            data.insert("tls_psk".into(), Value::String(psk.clone()));
        }
        None => {
            // Keep the proxy so its hosts stay attachable, but without
            // encryption, and say so in the description.
            if passive {
                data.insert("tls_connect".into(), Value::String("1".into()));
            } else {
                let accept = int_field(data, "tls_accept", 1);
                let downgraded = if accept > 2 { accept - 2 } else { 1 };
                data.insert("tls_accept".into(), Value::String(downgraded.to_string()));
            }
            let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let note = format!("[{stamp} PSK DISABLED]");
            let description = data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            let annotated = if description.is_empty() {
                note
            } else {
                format!("{note}\r\n\r\n{description}")
            };
            data.insert("description".into(), Value::String(annotated));
        }
    }
}

/// Proxy groups replicate as-is; the worker only computes deletions for
/// groups it no longer appears in.
pub fn process_group(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut outcome = Outcome::records(records);
    let ids = n.deletions_against(EntityKind::ProxyGroup, &outcome.records, &[]);
    if !ids.is_empty() {
        outcome
            .extend
            .push((EntityKind::ProxyGroup, vec![ExtendOp::Delete { ids }]));
    }
    Ok(outcome)
}
