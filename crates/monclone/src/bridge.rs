//! Bulk configuration export/import.
//!
//! Templates, items, triggers, LLD rules and value maps only move safely
//! together, through the Monitor's bundled `configuration.export` /
//! `configuration.import` path. The bridge wraps that path: it exports in
//! bounded chunks, partitions templates into dependency-safe order, and
//! imports template bundles one at a time so a single broken template
//! cannot take the rest down.

use crate::api::MonitorClient;
use crate::error::{ApiError, Error};
use crate::kind::EntityKind;
use crate::local::{LocalEntity, LocalInventory};
use crate::presenter::Presenter;
use crate::profile::Profile;
use crate::release::Release;
use crate::snapshot::RecordSet;
use crate::value::as_str_like;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Result of one bundled import run. Template failures are counted, not
/// fatal; anything else aborts.
#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub template_success: usize,
    pub template_failed: usize,
    pub template_errors: Vec<(String, String)>,
}

pub struct ConfigBridge<'a> {
    pub client: &'a MonitorClient,
    pub profile: &'a Profile,
    pub presenter: &'a dyn Presenter,
}

impl ConfigBridge<'_> {
    /// Master side: pull the bundled kinds out of the Monitor and merge
    /// them into the local inventory, replacing the thin `get` payloads
    /// with the full bundle objects.
    pub async fn export_into(
        &self,
        local: &mut LocalInventory,
        template_skip: bool,
        template_separate: usize,
    ) -> Result<(), Error> {
        let mut base_ids: Map<String, Value> = Map::new();
        let mut template_ids = Vec::new();
        for (kind, section) in self.profile.config_export() {
            if *kind == EntityKind::Trigger {
                // Triggers ride along with their templates.
                continue;
            }
            let ids: Vec<Value> = local
                .ids(*kind)
                .into_iter()
                .map(Value::String)
                .collect();
            if *kind == EntityKind::Template {
                if template_skip {
                    continue;
                }
                template_ids = ids;
            } else {
                base_ids.insert((*section).to_string(), Value::Array(ids));
            }
        }

        let mut requests = vec![Value::Object(base_ids)];
        // Keep template exports bounded so a large library cannot blow
        // past request limits.
        for chunk in template_ids.chunks(template_separate.max(1)) {
            requests.push(json!({"templates": chunk}));
        }

        for request in requests {
            let text = self.client.configuration_export(request).await?;
            // The export spells the media-type section differently from
            // the import rules; unify before parsing.
            let text = text.replace("media_types", "mediaTypes");
            let bundle: Value = serde_json::from_str(&text)
                .map_err(|e| ApiError::Malformed(format!("unparsable export bundle: {e}")))?;
            let Some(sections) = bundle.get("zabbix_export").and_then(Value::as_object) else {
                return Err(ApiError::Malformed("export bundle has no payload".into()).into());
            };
            self.merge_bundle(local, sections);
        }
        Ok(())
    }

    fn merge_bundle(&self, local: &mut LocalInventory, sections: &Map<String, Value>) {
        let section_kinds: BTreeMap<&str, EntityKind> = self
            .profile
            .config_export()
            .iter()
            .map(|(kind, section)| (*section, *kind))
            .collect();
        for (section, items) in sections {
            // Envelope fields (version, date) carry no entities.
            let Some(kind) = section_kinds.get(section.as_str()).copied() else {
                continue;
            };
            let Some(items) = items.as_array() else {
                continue;
            };
            let name_field = match kind {
                EntityKind::Trigger => None,
                _ => self.profile.name_field(kind),
            };
            let mut merged: BTreeMap<String, LocalEntity> = local
                .entities(kind)
                .map(|entity| (entity.name.clone(), entity.clone()))
                .collect();
            let mut synthetic = merged.len();
            for item in items {
                let name = name_field
                    .and_then(|field| item.get(field).and_then(as_str_like))
                    .or_else(|| item.get("uuid").and_then(as_str_like))
                    .unwrap_or_else(|| {
                        synthetic += 1;
                        format!("{kind}{synthetic}")
                    });
                let id = merged
                    .get(&name)
                    .map(|existing| existing.id.clone())
                    .unwrap_or_default();
                merged.insert(
                    name.clone(),
                    LocalEntity {
                        id,
                        name,
                        data: item.clone(),
                    },
                );
            }
            local.replace(kind, merged.into_values().collect());
        }
    }

    /// Worker side: build the import bundles from the snapshot and apply
    /// them. Non-template content goes first in one bundle; templates
    /// follow one bundle each, in dependency-safe order.
    pub async fn import(
        &self,
        snapshot: &mut RecordSet,
        master_release: Release,
        local: &LocalInventory,
        template_skip: bool,
    ) -> Result<ImportOutcome, Error> {
        let release = self.profile.release;
        let sections = self.profile.import_sections_for(master_release);

        let mut base: Map<String, Value> = Map::new();
        let mut templates: Vec<Value> = Vec::new();
        let mut triggers: Vec<Value> = Vec::new();
        for (kind, section) in &sections {
            let records = snapshot.get(*kind);
            if records.is_empty() {
                continue;
            }
            match kind {
                EntityKind::Trigger => {
                    triggers = records.iter().map(|r| r.payload.clone()).collect();
                }
                EntityKind::Host => {
                    // Hosts go through the reconciler, not the bundle.
                    base.insert((*section).to_string(), json!([]));
                }
                EntityKind::Template => {
                    templates = records
                        .iter()
                        .map(|r| {
                            let mut template = r.payload.clone();
                            if release >= Release::R6_4 {
                                strip_request_method(&mut template);
                            }
                            template
                        })
                        .collect();
                    templates.sort_by(|a, b| template_name(a).cmp(&template_name(b)));
                }
                EntityKind::MediaType => {
                    let fixed: Vec<Value> = records
                        .iter()
                        .map(|r| {
                            let mut media = r.payload.clone();
                            fix_media_type(&mut media, release);
                            media
                        })
                        .collect();
                    // The import bundle spells this section in
                    // snake_case even though the rules table does not.
                    base.insert("media_types".to_string(), Value::Array(fixed));
                }
                _ => {
                    let payloads: Vec<Value> =
                        records.iter().map(|r| r.payload.clone()).collect();
                    base.insert((*section).to_string(), Value::Array(payloads));
                }
            }
        }

        // Groups that exist only to hold templates must become template
        // groups when a pre-6.2 snapshot lands on a split-groups release.
        if master_release < Release::R6_2 && release >= Release::R6_2 {
            self.convert_template_groups(&mut base, &templates, local).await?;
        }

        let mut rules: BTreeMap<&str, crate::profile::ImportRule> =
            self.profile.import_rules().clone();
        let ordered = partition_templates(templates);
        let mut bundles: Vec<(Option<String>, Map<String, Value>)> =
            vec![(None, base.clone())];
        for template in ordered {
            let name = template_name(&template).unwrap_or_default();
            let mut bundle = Map::new();
            if release == Release::R6_0 || release == Release::R7_0 {
                bundle.insert("templates".into(), json!([template]));
                bundle.insert("triggers".into(), json!(triggers.clone()));
                if master_release < Release::R6_0 {
                    if let Some(maps) = base.get("value_maps") {
                        bundle.insert("value_maps".into(), maps.clone());
                    }
                }
            } else if release == Release::R5_4 {
                if let Some(rule) = rules.get_mut("triggers") {
                    rule.create_missing = Some(false);
                }
                bundle.insert("templates".into(), json!([template]));
                if let Some(maps) = base.get("value_maps") {
                    bundle.insert("value_maps".into(), maps.clone());
                }
            } else {
                if let Some(rule) = rules.get_mut("triggers") {
                    rule.create_missing = Some(false);
                }
                bundle.insert("templates".into(), json!([template]));
            }
            bundles.push((Some(name), bundle));
        }

        let rules_value = serde_json::to_value(&rules)
            .map_err(|e| ApiError::Malformed(format!("unserializable import rules: {e}")))?;

        let mut outcome = ImportOutcome::default();
        for (index, (template, mut bundle)) in bundles.into_iter().enumerate() {
            if index > 0 && template_skip {
                continue;
            }
            if bundle.is_empty() {
                continue;
            }
            bundle.insert("version".into(), json!(master_release.to_string()));
            if master_release < Release::R7_0 {
                bundle.insert(
                    "date".into(),
                    json!(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
                );
            }
            let source = serde_json::to_string(&json!({"zabbix_export": bundle}))
                .map_err(|e| ApiError::Malformed(format!("unserializable bundle: {e}")))?;

            match self
                .client
                .configuration_import(rules_value.clone(), source)
                .await
            {
                Ok(_) => {
                    if template.is_some() {
                        outcome.template_success += 1;
                        self.presenter.tick('.');
                    }
                }
                Err(error) => match template {
                    Some(name) => {
                        outcome.template_failed += 1;
                        outcome.template_errors.push((name, error.to_string()));
                        self.presenter.tick('X');
                    }
                    // The base bundle failing orphans everything else.
                    None => return Err(error.into()),
                },
            }
        }
        self.presenter.end_ticks();
        Ok(outcome)
    }

    async fn convert_template_groups(
        &self,
        base: &mut Map<String, Value>,
        templates: &[Value],
        local: &LocalInventory,
    ) -> Result<(), Error> {
        let mut template_groups: Vec<String> = templates
            .iter()
            .flat_map(|template| {
                template
                    .get("groups")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|group| group.get("name").and_then(as_str_like))
            })
            .collect();
        template_groups.sort();
        template_groups.dedup();
        if template_groups.is_empty() {
            return Ok(());
        }

        // Pre-6.2 masters file template groups under the plain groups
        // section.
        if let Some(Value::Array(groups)) = base.get_mut("groups") {
            groups.retain(|group| {
                group
                    .get("name")
                    .and_then(Value::as_str)
                    .map(|name| !template_groups.iter().any(|t| t == name))
                    .unwrap_or(true)
            });
        }
        for name in template_groups {
            if local.contains(EntityKind::TemplateGroup, &name) {
                continue;
            }
            self.client
                .create(EntityKind::TemplateGroup, json!({"name": name}))
                .await?;
        }
        Ok(())
    }
}

fn template_name(template: &Value) -> Option<String> {
    template.get("name").and_then(as_str_like)
}

/// Order templates so every template appears after everything it links:
/// group 0 holds templates with no linked templates and no host-prototype
/// template references, group k holds templates whose references all sit
/// in earlier groups. Ties break alphabetically. The flattened order is
/// returned.
pub fn partition_templates(mut templates: Vec<Value>) -> Vec<Value> {
    let mut ordered = Vec::new();
    let mut processed: Vec<String> = Vec::new();
    while !templates.is_empty() {
        let mut group: Vec<Value> = Vec::new();
        let mut remaining = Vec::new();
        for template in templates {
            let references = template_references(&template);
            if references.iter().all(|name| processed.contains(name)) {
                group.push(template);
            } else {
                remaining.push(template);
            }
        }
        if group.is_empty() {
            // A reference cycle or a link to an unexported template;
            // flush the rest in name order rather than spin.
            remaining.sort_by(|a, b| template_name(a).cmp(&template_name(b)));
            ordered.extend(remaining);
            break;
        }
        group.sort_by(|a, b| template_name(a).cmp(&template_name(b)));
        processed.extend(group.iter().filter_map(template_name));
        ordered.extend(group);
        templates = remaining;
    }
    ordered
}

/// Everything a template needs imported before itself: linked templates
/// plus templates referenced by LLD host prototypes.
fn template_references(template: &Value) -> Vec<String> {
    let mut references: Vec<String> = template
        .get("templates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|link| link.get("name").and_then(as_str_like))
        .collect();
    for rule in template
        .get("discovery_rules")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        for prototype in rule
            .get("host_prototypes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            references.extend(
                prototype
                    .get("templates")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|link| link.get("name").and_then(as_str_like)),
            );
        }
    }
    references
}

/// 6.4 rejects `request_method` on anything that is not an HTTP agent;
/// it leaks into exports of other item types.
fn strip_request_method(template: &mut Value) {
    fn strip_items(items: Option<&mut Value>) {
        let Some(Value::Array(items)) = items else {
            return;
        };
        for item in items {
            if item.get("type").and_then(Value::as_str) != Some("HTTP_AGENT") {
                if let Some(map) = item.as_object_mut() {
                    map.remove("request_method");
                }
            }
        }
    }
    strip_items(template.get_mut("items"));
    if let Some(Value::Array(rules)) = template.get_mut("discovery_rules") {
        for rule in rules {
            if rule.get("type").and_then(Value::as_str) != Some("HTTP_AGENT") {
                if let Some(map) = rule.as_object_mut() {
                    map.remove("request_method");
                }
            }
            strip_items(rule.get_mut("item_prototypes"));
        }
    }
}

/// Media types accumulated three incompatible drifts: script parameters
/// became ordered objects at 6.4, `content_type` died at 7.0 after
/// already being rejected for script types at 6.0, and relayless email
/// requires credentials.
fn fix_media_type(media: &mut Value, release: Release) {
    let Some(map) = media.as_object_mut() else {
        return;
    };
    let is_script = map.get("type").and_then(Value::as_str) == Some("SCRIPT");
    if release >= Release::R6_0 && is_script {
        map.remove("content_type");
    }
    if release >= Release::R6_4 && is_script {
        if let Some(Value::Array(parameters)) = map.get_mut("parameters") {
            let mut ordered = Vec::new();
            for (index, parameter) in parameters.iter().enumerate() {
                match parameter {
                    Value::String(value) => ordered.push(json!({
                        "sortorder": index.to_string(),
                        "value": value,
                    })),
                    Value::Object(existing) => {
                        if existing.contains_key("sortorder") && existing.contains_key("value") {
                            ordered.push(parameter.clone());
                        }
                    }
                    _ => {}
                }
            }
            *parameters = ordered;
        }
    }
    if release >= Release::R7_0 {
        map.remove("content_type");
    }
    // Authenticated SMTP needs credentials the export cannot carry; an
    // import with the flag but no username/password is rejected outright,
    // so the media falls back to unauthenticated relay.
    if map.get("type").and_then(Value::as_str) == Some("EMAIL") {
        let has_user = map
            .get("username")
            .and_then(Value::as_str)
            .map(|u| !u.is_empty())
            .unwrap_or(false);
        let has_password = map
            .get("passwd")
            .and_then(Value::as_str)
            .map(|p| !p.is_empty())
            .unwrap_or(false);
        let authenticated = map
            .get("smtp_authentication")
            .and_then(Value::as_str)
            .map(|a| a != "0" && a != "SMTP_AUTHENTICATION_NONE")
            .unwrap_or(false);
        if authenticated && (!has_user || !has_password) {
            map.insert("smtp_authentication".into(), json!("0"));
            map.remove("username");
            map.remove("passwd");
        }
    }
}
