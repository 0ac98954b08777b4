//! Bulk host reconciliation.
//!
//! Hosts are the one kind applied host-by-host instead of through the
//! configuration bundle: the fan-out runs `worker_concurrency` parallel
//! create/update calls, interfaces reconcile separately afterwards, and
//! the stable carry-tag UUID keeps a host's identity across renames on
//! either side. A single host failing is counted, never fatal.

use crate::api::MonitorClient;
use crate::config::{Role, Settings};
use crate::error::Error;
use crate::identity::IdentityMap;
use crate::kind::EntityKind;
use crate::local::LocalInventory;
use crate::names;
use crate::presenter::Presenter;
use crate::profile::Profile;
use crate::release::Release;
use crate::snapshot::Record;
use crate::value::{as_int, as_str_like, is_emptyish};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::ToSocketAddrs;

/// Fallback SNMP community macro for interfaces exported without one.
const DEFAULT_SNMP_COMMUNITY: &str = "{$SNMP_COMMUNITY}";

/// What happened across one reconciliation run.
#[derive(Debug, Default)]
pub struct HostReport {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub failed_hosts: Vec<(String, String)>,
    pub interfaces_updated: usize,
    pub interfaces_deleted: usize,
    pub hosts_deleted: usize,
}

/// The action the decision matrix chose for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    Create,
    /// Update in place under an existing local id.
    Update { host_id: String },
    Skip,
}

/// One host ready for the fan-out.
#[derive(Debug)]
struct HostPlan {
    name: String,
    payload: Value,
    action: HostAction,
    /// Interfaces split out of an update payload; they reconcile
    /// separately.
    interfaces: Option<(String, Vec<Value>)>,
}

pub struct HostReconciler<'a> {
    pub client: &'a MonitorClient,
    pub profile: &'a Profile,
    pub identity: &'a IdentityMap,
    pub settings: &'a Settings,
    pub presenter: &'a dyn Presenter,
    /// Release of the snapshot being applied.
    pub master_release: Release,
}

impl HostReconciler<'_> {
    /// Apply the snapshot's hosts to the local instance.
    pub async fn run(
        &self,
        records: Vec<Record>,
        local: &LocalInventory,
    ) -> Result<HostReport, Error> {
        let mut report = HostReport::default();

        // Local carry-tag UUID -> host id, the rename-proof identity.
        let local_tags = local_carry_tags(local);

        let mut plans = Vec::new();
        for record in records {
            let Some(mut plan) = self.plan_host(record, local, &local_tags) else {
                continue;
            };
            if plan.action == HostAction::Skip {
                continue;
            }
            if let HostAction::Update { host_id } = &plan.action {
                // Interface updates go through their own API surface.
                if let Some(Value::Array(items)) = plan
                    .payload
                    .as_object_mut()
                    .and_then(|map| map.remove("interfaces"))
                {
                    plan.interfaces = Some((host_id.clone(), items));
                }
            }
            plans.push(plan);
        }

        if plans.is_empty() {
            return Ok(report);
        }
        let processed: Vec<String> = plans.iter().map(|plan| plan.name.clone()).collect();

        // Bounded parallel create/update.
        let concurrency = self.settings.worker_concurrency.max(1);
        let results: Vec<(String, HostAction, Result<(), String>)> =
            stream::iter(plans.iter().map(|plan| {
                let name = plan.name.clone();
                let action = plan.action.clone();
                let payload = plan.payload.clone();
                async move {
                    let result = match &action {
                        HostAction::Create => self
                            .client
                            .create(EntityKind::Host, payload)
                            .await
                            .map(|_| ())
                            .map_err(|e| e.to_string()),
                        HostAction::Update { .. } => self
                            .client
                            .update(EntityKind::Host, payload)
                            .await
                            .map(|_| ())
                            .map_err(|e| e.to_string()),
                        HostAction::Skip => Ok(()),
                    };
                    (name, action, result)
                }
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (name, action, result) in results {
            match result {
                Ok(()) => match action {
                    HostAction::Create => {
                        report.created += 1;
                        self.presenter.tick('C');
                    }
                    HostAction::Update { .. } => {
                        report.updated += 1;
                        self.presenter.tick('U');
                    }
                    HostAction::Skip => {}
                },
                Err(error) => {
                    report.failed += 1;
                    self.presenter.tick('X');
                    report.failed_hosts.push((name, error));
                }
            }
        }
        self.presenter.end_ticks();

        // Interfaces and deletions run serially after the bulk phase.
        for plan in &plans {
            if let Some((host_id, interfaces)) = &plan.interfaces {
                self.reconcile_interfaces(&plan.name, host_id, interfaces, &mut report)
                    .await;
            }
        }

        if !self.settings.no_delete {
            let leavers: Vec<String> = local
                .entities(EntityKind::Host)
                .filter(|entity| !processed.contains(&entity.name))
                .map(|entity| entity.id.clone())
                .collect();
            if !leavers.is_empty() {
                match self.client.delete(EntityKind::Host, leavers.clone()).await {
                    Ok(_) => report.hosts_deleted = leavers.len(),
                    Err(error) => {
                        report
                            .failed_hosts
                            .push(("<delete>".to_string(), error.to_string()));
                    }
                }
            }
        }

        Ok(report)
    }

    /// Normalize one snapshot host and run the decision matrix. Returns
    /// `None` when the host is not eligible for this node.
    fn plan_host(
        &self,
        mut record: Record,
        local: &LocalInventory,
        local_tags: &BTreeMap<String, String>,
    ) -> Option<HostPlan> {
        let data = record.payload.as_object_mut()?;

        let tag_values = |wanted: &str| -> Vec<String> {
            data.get("tags")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter(|tag| tag.get("tag").and_then(Value::as_str) == Some(wanted))
                .filter_map(|tag| tag.get("value").and_then(as_str_like))
                .collect()
        };
        let monitor_nodes = tag_values(names::WORKER_TAG);
        let carry_tag = tag_values(names::CARRY_TAG).into_iter().next();

        if self.settings.role == Role::Worker {
            if !monitor_nodes.iter().any(|node| node == &self.settings.node) {
                return None;
            }
            data.insert("status".into(), json!("0"));
        } else if self.settings.role == Role::Replica {
            // Replicas take every host with whatever status the master
            // exported.
        } else {
            return None;
        }

        self.normalize_host(data, local);

        let action = decide(
            &record.name,
            carry_tag.as_deref(),
            local,
            local_tags,
            self.settings.host_update,
            self.settings.force_host_update,
        );
        if let HostAction::Update { host_id } = &action {
            // Updating a host the remote side renamed: the local name is
            // authoritative, so the snapshot's display names come out.
            if !local.contains(EntityKind::Host, &record.name) {
                drop_display_names(data);
            }
            let id_field = self.profile.id_field(EntityKind::Host).unwrap_or("hostid");
            data.insert(id_field.to_string(), json!(host_id));
        }

        Some(HostPlan {
            name: record.name,
            payload: record.payload,
            action,
            interfaces: None,
        })
    }

    /// Translate a bundle-shaped host into the create/update shape of
    /// this release.
    fn normalize_host(&self, data: &mut Map<String, Value>, local: &LocalInventory) {
        for field in self.profile.discard_fields(EntityKind::Host) {
            data.remove(*field);
        }
        data.retain(|key, value| key == "status" || !is_emptyish(value) || key == "tags");

        // Bundle inventory mode is symbolic; manual when absent.
        let inventory = match data.get("inventory_mode").and_then(Value::as_str) {
            Some("DISABLED") => -1,
            Some("AUTOMATIC") => 1,
            _ => 0,
        };
        data.insert("inventory_mode".into(), json!(inventory.to_string()));

        if let Some(Value::Array(interfaces)) = data.get_mut("interfaces") {
            let single = interfaces.len() == 1;
            for interface in interfaces.iter_mut() {
                let Some(map) = interface.as_object_mut() else {
                    continue;
                };
                if single {
                    map.insert("default".into(), json!("YES"));
                }
                self.normalize_interface(map);
            }
        }

        self.attach_proxy(data);

        // Templates and groups resolve by name; references to things
        // absent locally drop rather than fail the host.
        for (kind, key) in [
            (EntityKind::Template, "templates"),
            (EntityKind::HostGroup, "groups"),
        ] {
            let Some(id_field) = self.profile.id_field(kind) else {
                continue;
            };
            let resolved: Vec<Value> = data
                .get(key)
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|item| item.get("name").and_then(as_str_like))
                .filter(|name| local.contains(kind, name))
                .filter_map(|name| self.identity.to_id(kind, &name))
                .map(|id| json!({id_field: id}))
                .collect();
            data.insert(key.to_string(), Value::Array(resolved));
        }
    }

    fn normalize_interface(&self, map: &mut Map<String, Value>) {
        map.remove("interface_ref");
        let if_type = map
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("AGENT")
            .to_string();
        let type_number = match if_type.as_str() {
            "SNMP" => 2,
            "IPMI" => 3,
            "JMX" => 4,
            _ => 1,
        };
        let main = match map.remove("default") {
            Some(Value::String(flag)) if flag == "YES" => 1,
            _ => 0,
        };
        let use_ip = match map.get("useip").and_then(Value::as_str) {
            Some("NO") => 0,
            _ => 1,
        };
        let mut interface = json!({
            "ip": map.get("ip").cloned().unwrap_or(json!("127.0.0.1")),
            "dns": map.get("dns").cloned().unwrap_or(json!("")),
            "port": map.get("port").cloned().unwrap_or(json!("10050")),
            "type": type_number.to_string(),
            "main": main.to_string(),
            "useip": use_ip.to_string(),
        });
        #[allow(clippy::unwrap_used)] // literal object
        let interface = interface.as_object_mut().unwrap();
        for (key, value) in interface.iter() {
            map.insert(key.clone(), value.clone());
        }

        if use_ip == 0 && self.settings.force_useip {
            let dns = map.get("dns").and_then(Value::as_str).unwrap_or("");
            if let Some(ip) = resolve_dns(dns) {
                map.insert("ip".into(), json!(ip));
                map.insert("useip".into(), json!("1"));
                map.remove("dns");
            }
        }

        if self.profile.release >= Release::R5_0 {
            map.remove("bulk");
            if if_type == "SNMP" {
                let details = map.get("details").and_then(Value::as_object).cloned();
                let version = details
                    .as_ref()
                    .and_then(|d| d.get("version"))
                    .and_then(Value::as_str)
                    .map(str::to_uppercase)
                    .unwrap_or_else(|| "SNMPV2".to_string());
                let version_number = match version.as_str() {
                    "SNMPV1" => 1,
                    "SNMPV3" => 3,
                    _ => 2,
                };
                let community = details
                    .as_ref()
                    .and_then(|d| d.get("community"))
                    .cloned()
                    .unwrap_or(json!(DEFAULT_SNMP_COMMUNITY));
                map.insert(
                    "details".into(),
                    json!({
                        "version": version_number.to_string(),
                        "community": community,
                    }),
                );
            }
        } else {
            let bulk = match map.get("bulk").and_then(Value::as_str) {
                Some("NO") => 0,
                _ => 1,
            };
            map.insert("bulk".into(), json!(bulk.to_string()));
        }
    }

    /// Attach the proxy (or proxy group) reference in the shape of this
    /// release.
    fn attach_proxy(&self, data: &mut Map<String, Value>) {
        if self.profile.release >= Release::R7_0 {
            let monitored_by = if self.master_release >= Release::R7_0 {
                data.remove("monitored_by")
                    .as_ref()
                    .and_then(as_str_like)
                    .unwrap_or_else(|| "direct".to_string())
                    .to_lowercase()
            } else {
                "proxy".to_string()
            };
            let (mode, source_key, kind, id_key) = match monitored_by.as_str() {
                "proxy_group" => (
                    2,
                    "proxy_group",
                    EntityKind::ProxyGroup,
                    "proxy_groupid",
                ),
                "proxy" => (1, "proxy", EntityKind::Proxy, "proxyid"),
                _ => (0, "", EntityKind::Proxy, ""),
            };
            if mode == 0 {
                return;
            }
            let Some(reference) = data.remove(source_key) else {
                return;
            };
            let Some(name) = reference.get("name").and_then(as_str_like) else {
                return;
            };
            if let Some(id) = self.identity.to_id(kind, &name) {
                data.insert("monitored_by".into(), json!(mode.to_string()));
                data.insert(id_key.to_string(), json!(id));
            }
        } else if let Some(proxy) = data.remove("proxy") {
            if let Some(name) = proxy.get("name").and_then(as_str_like) {
                if let Some(id) = self.identity.to_id(EntityKind::Proxy, &name) {
                    data.insert("proxy_hostid".into(), json!(id));
                }
            }
        }
    }

    /// Pair the wanted interfaces with the host's current ones by
    /// `(type, main)`, update the changed ones, and delete leftovers.
    async fn reconcile_interfaces(
        &self,
        host_name: &str,
        host_id: &str,
        wanted: &[Value],
        report: &mut HostReport,
    ) {
        let current = match self
            .client
            .call(
                "hostinterface.get",
                json!({"output": "extend", "hostids": host_id}),
            )
            .await
        {
            Ok(Value::Array(items)) => items,
            Ok(_) | Err(_) => {
                self.presenter
                    .warn(&format!("{host_name}: cannot read current interfaces"));
                return;
            }
        };

        let Some(pairing) = pair_interfaces(wanted, &current) else {
            self.presenter.warn(&format!(
                "{host_name}: ambiguous interface layout, update skipped"
            ));
            return;
        };

        for (mut update, target) in pairing.updates {
            if !interface_differs(&update, &target) {
                self.presenter.tick('.');
                continue;
            }
            if let (Some(map), Some(id)) = (update.as_object_mut(), target.get("interfaceid")) {
                map.insert("interfaceid".into(), id.clone());
            }
            match self.client.call("hostinterface.update", update).await {
                Ok(_) => {
                    report.interfaces_updated += 1;
                    self.presenter.tick('U');
                }
                Err(error) => {
                    self.presenter
                        .warn(&format!("{host_name}: interface update failed: {error}"));
                }
            }
        }
        for leftover in pairing.leftovers {
            let Some(id) = leftover.get("interfaceid").and_then(as_str_like) else {
                continue;
            };
            match self
                .client
                .call("hostinterface.delete", json!([id]))
                .await
            {
                Ok(_) => report.interfaces_deleted += 1,
                Err(error) => {
                    self.presenter
                        .warn(&format!("{host_name}: interface delete failed: {error}"));
                }
            }
        }
        self.presenter.end_ticks();
    }
}

/// The create/update/skip decision. The display name and the carry-tag
/// are matched independently; renames on either side are only touched
/// under their respective opt-in flags.
pub fn decide(
    name: &str,
    carry_tag: Option<&str>,
    local: &LocalInventory,
    local_tags: &BTreeMap<String, String>,
    host_update: bool,
    force_host_update: bool,
) -> HostAction {
    let local_host = local.get(EntityKind::Host, name);
    let tagged_id = carry_tag.and_then(|tag| local_tags.get(tag));

    match (local_host, tagged_id) {
        // Same name, same identity: plain update.
        (Some(local_host), Some(id)) if *id == local_host.id => HostAction::Update {
            host_id: local_host.id.clone(),
        },
        // Same name, different (or no) identity: a different host took
        // this name locally; overwrite only when asked to.
        (Some(local_host), _) => {
            if host_update {
                HostAction::Update {
                    host_id: local_host.id.clone(),
                }
            } else {
                HostAction::Skip
            }
        }
        // Renamed locally: the identity exists under another name.
        (None, Some(id)) => {
            if force_host_update {
                HostAction::Update {
                    host_id: id.clone(),
                }
            } else {
                HostAction::Skip
            }
        }
        (None, None) => HostAction::Create,
    }
}

/// Strip the display-name fields from a payload updating a renamed host;
/// the spec-of-record for the name is then the local side.
pub fn drop_display_names(data: &mut Map<String, Value>) {
    data.remove("host");
    data.remove("name");
}

/// Carry-tag UUID → local host id.
fn local_carry_tags(local: &LocalInventory) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for entity in local.entities(EntityKind::Host) {
        let values = entity
            .data
            .get("tags")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|tag| tag.get("tag").and_then(Value::as_str) == Some(names::CARRY_TAG))
            .filter_map(|tag| tag.get("value").and_then(as_str_like));
        for value in values {
            tags.insert(value, entity.id.clone());
        }
    }
    tags
}

/// Result of pairing wanted interfaces with current ones.
pub struct InterfacePairing {
    /// `(wanted, matching current)` pairs.
    pub updates: Vec<(Value, Value)>,
    /// Current interfaces nothing paired with; they get deleted.
    pub leftovers: Vec<Value>,
}

/// Pair by `(type, main)`. Returns `None` when the current layout is
/// ambiguous: more than two interfaces with a duplicated type cannot be
/// paired reliably.
pub fn pair_interfaces(wanted: &[Value], current: &[Value]) -> Option<InterfacePairing> {
    let types: Vec<i64> = current
        .iter()
        .filter_map(|item| item.get("type").and_then(as_int))
        .collect();
    let mut unique = types.clone();
    unique.sort_unstable();
    unique.dedup();
    if unique.len() != types.len() && current.len() > 2 {
        return None;
    }

    let mut remaining: Vec<Value> = current.to_vec();
    let mut updates = Vec::new();
    for want in wanted {
        let want_type = want.get("type").and_then(as_int);
        let want_main = want.get("main").and_then(as_int);
        let position = remaining.iter().position(|have| {
            have.get("type").and_then(as_int) == want_type
                && have.get("main").and_then(as_int) == want_main
        });
        if let Some(position) = position {
            let mut have = remaining.remove(position);
            // An empty details block comes back as a list; drop it so
            // the comparison sees the same shape on both sides.
            if let Some(map) = have.as_object_mut() {
                if map.get("details").map(is_emptyish).unwrap_or(false) {
                    map.remove("details");
                }
            }
            updates.push((want.clone(), have));
        }
    }
    Some(InterfacePairing {
        updates,
        leftovers: remaining,
    })
}

/// Field-by-field comparison including nested `details`; everything is
/// compared as strings because the API stringifies on read.
pub fn interface_differs(wanted: &Value, current: &Value) -> bool {
    let Some(wanted) = wanted.as_object() else {
        return false;
    };
    for (key, value) in wanted {
        if key == "details" {
            let Some(details) = value.as_object() else {
                continue;
            };
            let current_details = current.get("details").and_then(Value::as_object);
            for (field, detail) in details {
                let have = current_details
                    .and_then(|d| d.get(field))
                    .and_then(as_str_like);
                if have.as_deref() != as_str_like(detail).as_deref() {
                    return true;
                }
            }
        } else {
            let have = current.get(key).and_then(as_str_like);
            if have.as_deref() != as_str_like(value).as_deref() {
                return true;
            }
        }
    }
    false
}

fn resolve_dns(dns: &str) -> Option<String> {
    if dns.is_empty() {
        return None;
    }
    (dns, 0)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalEntity;

    fn local_with_host(name: &str, id: &str, carry: Option<&str>) -> LocalInventory {
        let mut local = LocalInventory::new();
        let tags = match carry {
            Some(value) => json!([{"tag": names::CARRY_TAG, "value": value}]),
            None => json!([]),
        };
        local.replace(
            EntityKind::Host,
            vec![LocalEntity {
                id: id.to_string(),
                name: name.to_string(),
                data: json!({"tags": tags}),
            }],
        );
        local
    }

    fn tags_of(local: &LocalInventory) -> BTreeMap<String, String> {
        local_carry_tags(local)
    }

    #[test]
    fn matrix_same_name_same_tag_updates() {
        let local = local_with_host("web1", "101", Some("T"));
        let action = decide(
            "web1",
            Some("T"),
            &local,
            &tags_of(&local),
            false,
            false,
        );
        assert_eq!(action, HostAction::Update { host_id: "101".into() });
    }

    #[test]
    fn matrix_same_name_different_tag_needs_host_update() {
        let local = local_with_host("web1", "101", Some("OTHER"));
        let tags = tags_of(&local);
        let skip = decide("web1", Some("T"), &local, &tags, false, false);
        assert_eq!(skip, HostAction::Skip);
        let update = decide("web1", Some("T"), &local, &tags, true, false);
        assert_eq!(update, HostAction::Update { host_id: "101".into() });
    }

    #[test]
    fn matrix_renamed_locally_needs_force() {
        // Snapshot has "db", local host "database" carries the same tag.
        let local = local_with_host("database", "55", Some("T"));
        let tags = tags_of(&local);
        let skip = decide("db", Some("T"), &local, &tags, false, false);
        assert_eq!(skip, HostAction::Skip);
        let update = decide("db", Some("T"), &local, &tags, false, true);
        assert_eq!(update, HostAction::Update { host_id: "55".into() });
    }

    #[test]
    fn matrix_unknown_host_creates() {
        let local = LocalInventory::new();
        let action = decide(
            "fresh",
            Some("T"),
            &local,
            &BTreeMap::new(),
            false,
            false,
        );
        assert_eq!(action, HostAction::Create);
    }

    #[test]
    fn pairing_matches_on_type_and_main() {
        let wanted = vec![json!({"type": "1", "main": "1", "ip": "10.0.0.1"})];
        let current = vec![
            json!({"interfaceid": "7", "type": "1", "main": "1", "ip": "10.0.0.2"}),
            json!({"interfaceid": "8", "type": "2", "main": "1", "ip": "10.0.0.2"}),
        ];
        let pairing = pair_interfaces(&wanted, &current).unwrap();
        assert_eq!(pairing.updates.len(), 1);
        assert_eq!(pairing.updates[0].1["interfaceid"], json!("7"));
        assert_eq!(pairing.leftovers.len(), 1);
        assert_eq!(pairing.leftovers[0]["interfaceid"], json!("8"));
    }

    #[test]
    fn pairing_refuses_ambiguous_layouts() {
        let current = vec![
            json!({"type": "1", "main": "1"}),
            json!({"type": "1", "main": "0"}),
            json!({"type": "2", "main": "1"}),
        ];
        assert!(pair_interfaces(&[], &current).is_none());
        // Exactly two of one type stays decidable.
        let current = vec![
            json!({"type": "1", "main": "1"}),
            json!({"type": "1", "main": "0"}),
        ];
        assert!(pair_interfaces(&[], &current).is_some());
    }

    #[test]
    fn unchanged_interfaces_are_detected() {
        let wanted = json!({
            "type": "2", "main": "1", "ip": "10.0.0.1",
            "details": {"version": "2", "community": "public"},
        });
        let same = json!({
            "interfaceid": "3", "type": "2", "main": "1", "ip": "10.0.0.1",
            "details": {"version": "2", "community": "public", "bulk": "1"},
        });
        assert!(!interface_differs(&wanted, &same));
        let different = json!({
            "interfaceid": "3", "type": "2", "main": "1", "ip": "10.0.0.1",
            "details": {"version": "3", "community": "public"},
        });
        assert!(interface_differs(&wanted, &different));
    }

    #[test]
    fn carry_tags_index_by_uuid() {
        let local = local_with_host("web1", "101", Some("tag-uuid"));
        let tags = local_carry_tags(&local);
        assert_eq!(tags.get("tag-uuid"), Some(&"101".to_string()));
    }
}
