// Copyright 2026 MonClone Contributors

//! Run orchestration.
//!
//! One orchestrator drives one node through a full run. The worker path
//! walks the section pipeline (initialize/soft-reset, global settings,
//! PRE, configuration import, alert stop, MID, hosts, check-now, POST,
//! ACCOUNT, EXTEND, authentication, alert media) and finally records the
//! applied version in the reserved global macro - the resumption anchor
//! that makes re-runs idempotent. The master path is much shorter: ensure
//! carry-tags, export, normalize, upload, mark.
//!
//! The orchestrator owns a `Profile` value and a `Store` handle; every
//! component it calls gets borrowed views, never shared state.

use crate::api::MonitorClient;
use crate::bridge::{ConfigBridge, ImportOutcome};
use crate::config::{Role, Settings};
use crate::error::{Error, PreconditionError};
use crate::hosts::{HostReconciler, HostReport};
use crate::identity::IdentityMap;
use crate::kind::EntityKind;
use crate::local::{LocalEntity, LocalInventory};
use crate::names;
use crate::normalize::{Direction, ExtendOp, Normalizer};
use crate::presenter::Presenter;
use crate::profile::{Profile, Section};
use crate::release::Release;
use crate::snapshot::{Record, RecordSet, VersionMeta};
use crate::store::StoreDriver;
use crate::value::{as_int, as_str_like, int_field};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Fallback admin password tried when a password change is requested and
/// nothing else authenticates.
const DEFAULT_PASSWORD: &str = "zabbix";

/// Length of the alert-stop maintenance window, seconds.
const ALERT_STOP_PERIOD: i64 = 600;

/// Floor for per-check timeouts that can take the server down when they
/// expire mid-check.
const TIMEOUT_FLOORS: &[(&str, i64)] = &[("external_check", 15)];

/// Kinds reset on every run even without an initialize.
const SOFT_RESET_KINDS: &[EntityKind] = &[
    EntityKind::Correlation,
    EntityKind::DiscoveryRule,
    EntityKind::Action,
    EntityKind::Script,
    EntityKind::Maintenance,
];

/// What a finished run did.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Version applied (worker) or created (master).
    pub version_id: Option<String>,
    pub hosts: Option<HostReport>,
    pub templates: Option<ImportOutcome>,
    /// Per-record apply failures, `(kind/name, error)`. These never abort
    /// the run; they are the caller's summary.
    pub record_failures: Vec<(String, String)>,
}

pub struct Orchestrator {
    client: MonitorClient,
    store: Arc<dyn StoreDriver>,
    settings: Settings,
    profile: Profile,
    release: Release,
    identity: IdentityMap,
    local: LocalInventory,
    versions: Vec<VersionMeta>,
    snapshot: RecordSet,
    extend_plan: Vec<(EntityKind, Vec<ExtendOp>)>,
    presenter: Arc<dyn Presenter>,
    cancel: Arc<AtomicBool>,
    needs_password_change: bool,
    fallback_password: Option<String>,
    report: RunReport,
}

impl Orchestrator {
    /// Connect, authenticate and verify the fatal preconditions. Nothing
    /// is mutated on the Monitor yet.
    pub async fn connect(
        settings: Settings,
        store: Arc<dyn StoreDriver>,
        presenter: Arc<dyn Presenter>,
    ) -> Result<Self, Error> {
        let basic_auth = settings
            .http_auth
            .then(|| (settings.user.clone(), settings.password.clone().unwrap_or_default()));
        let client = MonitorClient::new(&settings.endpoint, settings.self_cert, basic_auth)?;

        // The endpoint must be the node the configuration says it is.
        client.check_server_name(&settings.node).await?;

        let release = client.api_version().await?;
        if !release.is_supported() {
            return Err(PreconditionError::UnsupportedRelease(release.to_string()).into());
        }
        client.set_release(release);
        let profile = Profile::for_release(release)?;

        let (needs_password_change, fallback_password) =
            Self::authenticate(&client, &settings).await?;

        let orchestrator = Orchestrator {
            client,
            store,
            settings,
            profile,
            release,
            identity: IdentityMap::new(),
            local: LocalInventory::new(),
            versions: Vec::new(),
            snapshot: RecordSet::new(),
            extend_plan: Vec::new(),
            presenter,
            cancel: Arc::new(AtomicBool::new(false)),
            needs_password_change,
            fallback_password,
            report: RunReport::default(),
        };
        orchestrator.check_permission().await?;
        Ok(orchestrator)
    }

    /// Token first, configured password next, platform/default password
    /// last (only when a password change was requested). Returns whether
    /// the admin password still needs changing and which password
    /// authenticated the fallback session.
    async fn authenticate(
        client: &MonitorClient,
        settings: &Settings,
    ) -> Result<(bool, Option<String>), Error> {
        if settings.token.is_none() && settings.password.is_none() {
            return Err(PreconditionError::MissingCredentials.into());
        }

        if let Some(token) = &settings.token {
            if client.login_token(token).await.is_ok() {
                if !settings.update_password {
                    return Ok((false, None));
                }
            } else {
                tracing::warn!("configured token rejected, falling back to password");
            }
        }

        let Some(password) = &settings.password else {
            if client.is_authenticated() {
                return Ok((false, None));
            }
            return Err(PreconditionError::MissingCredentials.into());
        };
        match client.login_password(&settings.user, password).await {
            Ok(()) => Ok((false, None)),
            Err(error) if settings.update_password => {
                // The configured password is the one to change *to*; try
                // the platform or factory default to get a session.
                let fallback = settings
                    .platform_password
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PASSWORD.to_string());
                client
                    .login_password(&settings.user, &fallback)
                    .await
                    .map_err(|e| {
                        Error::Api(crate::error::ApiError::Auth(format!(
                            "neither configured ({error}) nor default ({e}) password authenticates"
                        )))
                    })?;
                Ok((true, Some(fallback)))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Runs need super-administrator permission. Token sessions are
    /// assumed to carry it; password sessions are checked.
    async fn check_permission(&self) -> Result<(), Error> {
        if self.settings.token.is_some() && self.client.is_authenticated() {
            return Ok(());
        }
        let name_field = self.profile.name_field(EntityKind::User).unwrap_or("username");
        let permit_field = if self.release >= Release::R5_2 {
            "roleid"
        } else {
            "type"
        };
        let result = self
            .client
            .get(
                EntityKind::User,
                json!({
                    "output": "extend",
                    "filter": {name_field: self.settings.user},
                }),
            )
            .await?;
        let user = result
            .get(0)
            .ok_or_else(|| PreconditionError::MissingReservedUser(self.settings.user.clone()))?;
        let permit = user.get(permit_field).and_then(as_int).unwrap_or(-1);
        if permit.to_string() != names::SUPER_ROLE_ID {
            return Err(PreconditionError::NotSuperAdministrator(self.settings.user.clone()).into());
        }
        Ok(())
    }

    /// A handle callers can trip to stop the run at the next section
    /// boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn step(&self, name: &str) {
        self.presenter.step(&format!(
            "{}({}).{name}",
            self.settings.role.as_str(),
            self.settings.node
        ));
    }

    /// Run to completion and hand back the report.
    pub async fn run(mut self) -> Result<RunReport, Error> {
        match self.settings.role {
            Role::Master => self.run_master().await?,
            Role::Worker | Role::Replica => self.run_worker().await?,
        }
        Ok(self.report)
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    /// Pull every profile kind from the node and rebuild the identity
    /// map. Called after every section that may have created ids.
    async fn refresh_local(&mut self) -> Result<(), Error> {
        let kinds: Vec<EntityKind> = self.profile.kinds().collect();
        for kind in kinds {
            let options = self
                .profile
                .method(kind)
                .map(|m| m.get_options.clone())
                .unwrap_or_else(|| json!({}));
            let result = self.client.get(kind, options).await?;
            let mut entities = Vec::new();
            if kind.is_singleton() {
                // Property bags: one synthetic entity per property.
                if let Some(map) = result.as_object() {
                    for (key, value) in map {
                        entities.push(LocalEntity {
                            id: "0".to_string(),
                            name: key.clone(),
                            data: json!({key.clone(): value.clone()}),
                        });
                    }
                }
            } else if let Some(items) = result.as_array() {
                let id_field = self.profile.id_field(kind).unwrap_or_default();
                let name_field = self.profile.name_field(kind).unwrap_or_default();
                for item in items {
                    let mut data = item.clone();
                    // The id is local noise inside a payload; it lives
                    // beside the record instead.
                    let id = data
                        .as_object_mut()
                        .and_then(|map| map.remove(id_field))
                        .as_ref()
                        .and_then(as_str_like)
                        .unwrap_or_default();
                    let Some(name) = item.get(name_field).and_then(as_str_like) else {
                        continue;
                    };
                    entities.push(LocalEntity { id, name, data });
                }
            }
            let pairs: Vec<(String, String)> = entities
                .iter()
                .filter(|entity| !entity.id.is_empty() && entity.id != "0")
                .map(|entity| (entity.id.clone(), entity.name.clone()))
                .collect();
            self.identity.load(kind, pairs);
            self.local.replace(kind, entities);
        }
        Ok(())
    }

    fn normalizer(&self, master_release: Release, direction: Direction) -> Normalizer<'_> {
        Normalizer {
            profile: &self.profile,
            identity: &self.identity,
            local: &self.local,
            settings: &self.settings,
            master_release,
            direction,
        }
    }

    /// The snapshot a worker run applies (first entry of `versions`).
    fn selected_version(&self) -> Result<VersionMeta, Error> {
        self.versions
            .first()
            .cloned()
            .ok_or_else(|| PreconditionError::NoVersions.into())
    }

    /// Write the applied-version macro. The last write of a run, so a
    /// crash before it leaves the worker re-runnable.
    async fn mark_version(&mut self, value: &str) -> Result<(), Error> {
        self.step("markVersion");
        let id_field = self
            .profile
            .id_field(EntityKind::UserMacroGlobal)
            .unwrap_or("globalmacroid");
        let mut payload = match self.local.get(EntityKind::UserMacroGlobal, names::APPLIED_VERSION_MACRO)
        {
            Some(existing) => json!({id_field: existing.id, "value": value}),
            None => json!({"macro": names::APPLIED_VERSION_MACRO, "value": value}),
        };
        if self.settings.store.store_type == "direct" {
            let node = self.settings.store.access.clone().unwrap_or_default();
            let endpoint = self.settings.store.endpoint.clone().unwrap_or_default();
            payload["description"] = json!(format!("Master-Node: {node} ({endpoint})"));
        }
        let existing = self
            .local
            .contains(EntityKind::UserMacroGlobal, names::APPLIED_VERSION_MACRO);
        if existing {
            self.client.update(EntityKind::UserMacroGlobal, payload).await?;
        } else {
            self.client.create(EntityKind::UserMacroGlobal, payload).await?;
        }
        self.report.version_id = Some(value.to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Master path
    // ------------------------------------------------------------------

    async fn run_master(&mut self) -> Result<(), Error> {
        self.step("firstProcess");
        self.versions = self.store.list_versions(None).await.unwrap_or_default();
        self.refresh_local().await?;
        self.check_reserved_user()?;
        self.ensure_carry_tags().await?;
        self.refresh_local().await?;

        self.check_cancelled()?;
        self.step("createNewData");
        self.create_new_data().await?;

        self.check_cancelled()?;
        self.step("uploadVersion");
        let meta = self.upload().await?;
        let version_id = meta.version_id.clone();
        self.mark_version(&version_id).await?;
        Ok(())
    }

    /// Every master host carries a stable UUID tag; renames on either
    /// side correlate through it. Only missing tags are assigned - an
    /// existing tag is never rewritten.
    async fn ensure_carry_tags(&mut self) -> Result<(), Error> {
        let id_field = self.profile.id_field(EntityKind::Host).unwrap_or("hostid");
        let hosts: Vec<(String, Value)> = self
            .local
            .entities(EntityKind::Host)
            .map(|entity| (entity.id.clone(), entity.data.clone()))
            .collect();
        let mut assigned = 0usize;
        for (host_id, data) in hosts {
            let mut tags = data
                .get("tags")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let already_tagged = tags
                .iter()
                .any(|tag| tag.get("tag").and_then(Value::as_str) == Some(names::CARRY_TAG));
            if already_tagged {
                continue;
            }
            tags.push(json!({
                "tag": names::CARRY_TAG,
                "value": Uuid::new_v4().to_string(),
            }));
            match self
                .client
                .update(EntityKind::Host, json!({id_field: host_id, "tags": tags}))
                .await
            {
                Ok(_) => {
                    assigned += 1;
                    self.presenter.tick('S');
                }
                Err(error) => {
                    self.presenter.tick('X');
                    return Err(Error::Section {
                        section: "FIRST_PROCESS".into(),
                        reason: format!("cannot tag host {host_id}: {error}"),
                    });
                }
            }
        }
        self.presenter.end_ticks();
        if assigned == 0 {
            self.presenter.detail("all hosts already tagged");
        }
        Ok(())
    }

    /// Export the bundled kinds, copy the inventory into a record set and
    /// run the master-direction processors.
    async fn create_new_data(&mut self) -> Result<(), Error> {
        {
            let bridge = ConfigBridge {
                client: &self.client,
                profile: &self.profile,
                presenter: &*self.presenter,
            };
            bridge
                .export_into(
                    &mut self.local,
                    self.settings.template_skip,
                    self.settings.template_separate,
                )
                .await?;
        }

        self.snapshot = RecordSet::new();
        let mut kinds: Vec<EntityKind> = self.profile.kinds().collect();
        kinds.push(EntityKind::Trigger);
        for kind in kinds {
            for entity in self.local.entities(kind) {
                // The reserved accounts and this engine's own macro never
                // leave the master.
                if kind == EntityKind::User && entity.name == names::SUPER_USER {
                    continue;
                }
                if kind == EntityKind::UserGroup && entity.name == names::SUPER_GROUP {
                    continue;
                }
                if kind == EntityKind::Role && entity.id == names::SUPER_ROLE_ID {
                    continue;
                }
                if kind == EntityKind::UserMacroGlobal
                    && entity.name == names::APPLIED_VERSION_MACRO
                {
                    continue;
                }
                self.snapshot
                    .push(Record::new(kind, entity.name.clone(), entity.data.clone()))
                    .map_err(Error::Store)?;
            }
        }

        for section in [Section::Pre, Section::Mid, Section::Post, Section::Account] {
            let kinds = self.profile.section_kinds(section).to_vec();
            for kind in kinds {
                let records = self.snapshot.take(kind);
                if records.is_empty() {
                    continue;
                }
                let outcome = {
                    let normalizer = self.normalizer(self.release, Direction::Master);
                    normalizer.process(kind, records)?
                };
                self.snapshot.replace(kind, outcome.records);
            }
        }
        // Authentication is the one GLOBAL kind that needs master-side
        // identity flattening.
        let records = self.snapshot.take(EntityKind::Authentication);
        if !records.is_empty() {
            let outcome = {
                let normalizer = self.normalizer(self.release, Direction::Master);
                normalizer.process(EntityKind::Authentication, records)?
            };
            self.snapshot.replace(EntityKind::Authentication, outcome.records);
        }
        Ok(())
    }

    /// Records first, version after; a half-written version is never
    /// listed.
    async fn upload(&mut self) -> Result<VersionMeta, Error> {
        let mut description = format!(
            "MasterNode: {} ({}), CreateDate: {}",
            self.settings.node,
            self.settings.endpoint,
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        );
        if let Some(extra) = &self.settings.description {
            description = format!("{description} : {extra}");
        }
        let mut meta = VersionMeta::create(self.release, description);
        if self.settings.store.store_type == "direct" {
            meta.version_id = format!(
                "{}{}__",
                names::DIRECT_MASTER_PREFIX,
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
            );
        }
        let records = self.snapshot.to_stored();
        self.store.put_records(&meta, &records).await?;
        self.store.put_version(&meta).await?;
        Ok(meta)
    }

    // ------------------------------------------------------------------
    // Worker path
    // ------------------------------------------------------------------

    async fn run_worker(&mut self) -> Result<(), Error> {
        self.step("firstProcess");
        self.first_process().await?;
        let selected = self.selected_version()?;

        if self.needs_password_change {
            self.check_cancelled()?;
            self.step("changePassword");
            self.change_password().await;
        }

        self.check_cancelled()?;
        self.step("readSnapshot");
        let stored = self.store.get_records(&selected).await?;
        self.snapshot = RecordSet::from_stored(stored).map_err(Error::Store)?;

        self.check_cancelled()?;
        self.step("globalSettings");
        self.apply_global_settings().await?;

        self.check_cancelled()?;
        self.apply_section(Section::Pre, selected.master_release).await?;

        self.check_cancelled()?;
        self.step("configurationImport");
        self.import_configuration(selected.master_release).await?;

        self.check_cancelled()?;
        self.step("alertStop");
        self.alert_stop().await?;

        self.check_cancelled()?;
        self.apply_section(Section::Mid, selected.master_release).await?;

        self.check_cancelled()?;
        self.step("hostImport");
        self.apply_hosts(selected.master_release).await?;

        self.check_cancelled()?;
        if self.settings.checknow_execute {
            self.step("checkNow");
            self.check_now().await;
        }

        self.check_cancelled()?;
        self.apply_section(Section::Post, selected.master_release).await?;
        self.check_cancelled()?;
        self.apply_section(Section::Account, selected.master_release).await?;
        self.check_cancelled()?;
        self.step("extendApply");
        self.apply_extend(selected.master_release).await?;

        self.check_cancelled()?;
        self.step("authentication");
        self.apply_authentication(selected.master_release).await?;

        self.check_cancelled()?;
        self.step("alertMedia");
        self.apply_alert_media().await?;

        self.mark_version(&selected.version_id).await?;
        Ok(())
    }

    /// Obtain versions, verify the release skew, read the applied-version
    /// macro and take the initialize or soft-reset branch.
    async fn first_process(&mut self) -> Result<(), Error> {
        self.versions = self.store.list_versions(None).await?;
        if self.versions.is_empty() {
            return Err(PreconditionError::NoVersions.into());
        }

        // Move the requested version to the front; fall back to latest.
        if let Some(requested) = self.settings.target_version.clone() {
            match self
                .versions
                .iter()
                .position(|meta| meta.version_id == requested)
            {
                Some(index) => {
                    let meta = self.versions.remove(index);
                    self.versions.insert(0, meta);
                }
                None => {
                    self.presenter.warn(&format!(
                        "version {requested} is not in the store, applying latest"
                    ));
                }
            }
        }
        let selected = self.selected_version()?;
        self.presenter
            .detail(&format!("cloning version {}", selected.version_id));

        if self.release < selected.master_release {
            return Err(PreconditionError::ReleaseSkew {
                worker: self.release.to_string(),
                master: selected.master_release.to_string(),
            }
            .into());
        }
        // A 4.0 master cannot carry usable carry-tags, so same-name
        // collisions always update in place.
        if selected.master_release == Release::R4_0 {
            self.settings.host_update = true;
        }

        self.refresh_local().await?;
        self.check_reserved_user()?;

        let applied = self.applied_version_value();
        let valid = applied
            .as_deref()
            .map(applied_version_is_valid)
            .unwrap_or(false)
            && !self.settings.force_initialize;

        if valid {
            if !self.settings.no_delete {
                self.soft_reset().await?;
            }
        } else {
            self.settings.template_skip = false;
            self.initialize().await?;
            // The wipe took the macro with it; refetch before writing
            // the not-yet-cloned marker.
            self.refresh_local().await?;
            self.mark_version(names::NOT_YET_CLONED).await?;
        }
        self.refresh_local().await?;
        Ok(())
    }

    fn applied_version_value(&self) -> Option<String> {
        self.local
            .get(EntityKind::UserMacroGlobal, names::APPLIED_VERSION_MACRO)
            .and_then(|entity| entity.data.get("value").and_then(as_str_like))
    }

    /// The reserved notification user must exist, be enabled and hold the
    /// super-administrator role.
    fn check_reserved_user(&self) -> Result<(), Error> {
        let user = self
            .local
            .get(EntityKind::User, names::SUPER_USER)
            .ok_or_else(|| PreconditionError::MissingReservedUser(names::SUPER_USER.into()))?;
        let data = user.data.as_object();
        let enabled = data
            .map(|map| int_field(map, "users_status", 1) == 0)
            .unwrap_or(false);
        if !enabled {
            return Err(PreconditionError::ReservedUserDisabled(names::SUPER_USER.into()).into());
        }
        let permit_field = if self.release >= Release::R5_2 {
            "roleid"
        } else {
            "type"
        };
        let permit = data
            .map(|map| int_field(map, permit_field, -1))
            .unwrap_or(-1);
        if permit.to_string() != names::SUPER_ROLE_ID {
            return Err(PreconditionError::NotSuperAdministrator(names::SUPER_USER.into()).into());
        }
        Ok(())
    }

    /// Kinds that accumulate local drift are cleared on every run.
    async fn soft_reset(&mut self) -> Result<(), Error> {
        self.presenter.detail("soft reset of always-reset kinds");
        for kind in SOFT_RESET_KINDS {
            if !self.profile.has_kind(*kind) {
                continue;
            }
            let ids = self.local.ids(*kind);
            if ids.is_empty() {
                continue;
            }
            self.client.delete(*kind, ids).await.map_err(|error| Error::Section {
                section: "SOFT_RESET".into(),
                reason: format!("cannot clear {kind}: {error}"),
            })?;
        }
        Ok(())
    }

    /// Full wipe of every deletable kind, in an order that respects
    /// reference constraints. The system-reserved discovery group and
    /// hosted-variant undeletables survive.
    async fn initialize(&mut self) -> Result<(), Error> {
        self.presenter.detail("initializing node");
        let mut kinds: Vec<EntityKind> = Vec::new();
        if self.release >= Release::R6_0 {
            kinds.extend([EntityKind::Service, EntityKind::Sla, EntityKind::Regexp]);
        }
        kinds.extend([
            EntityKind::UserMacroGlobal,
            EntityKind::Correlation,
            EntityKind::DiscoveryRule,
            EntityKind::MediaType,
            EntityKind::Action,
            EntityKind::Script,
            EntityKind::Maintenance,
            EntityKind::Host,
            EntityKind::Proxy,
            EntityKind::Template,
            EntityKind::HostGroup,
        ]);
        if self.release >= Release::R6_2 {
            kinds.push(EntityKind::TemplateGroup);
        }
        if self.release >= Release::R7_0 {
            kinds.push(EntityKind::ProxyGroup);
        }

        let system_group = self.system_group_id();
        for kind in kinds {
            if !self.profile.has_kind(kind) {
                continue;
            }
            let undeletable = self
                .profile
                .cloud_overrides()
                .undeletable
                .get(&kind)
                .cloned()
                .unwrap_or_default();
            let ids: Vec<String> = self
                .local
                .entities(kind)
                .filter(|entity| {
                    !(kind == EntityKind::HostGroup
                        && Some(entity.id.as_str()) == system_group.as_deref())
                })
                .filter(|entity| {
                    !(self.settings.hosted && undeletable.contains(&entity.name.as_str()))
                })
                .map(|entity| entity.id.clone())
                .collect();
            if ids.is_empty() {
                continue;
            }
            self.client.delete(kind, ids).await.map_err(|error| Error::Section {
                section: "INITIALIZE".into(),
                reason: format!("cannot delete {kind}: {error}"),
            })?;
        }
        Ok(())
    }

    /// The host group the server reserves for discovered hosts; it cannot
    /// be deleted.
    fn system_group_id(&self) -> Option<String> {
        if self.release >= Release::R6_2 {
            self.local
                .get(EntityKind::Settings, "discovery_groupid")
                .and_then(|entity| entity.data.get("discovery_groupid").and_then(as_str_like))
        } else {
            self.local
                .entities(EntityKind::HostGroup)
                .find(|entity| {
                    entity
                        .data
                        .get("internal")
                        .and_then(as_int)
                        .unwrap_or(0)
                        != 0
                })
                .map(|entity| entity.id.clone())
        }
    }

    /// Change the admin password to the configured one and re-login.
    /// Best-effort: a failure is reported, never fatal, because the
    /// session that got us here keeps working.
    async fn change_password(&mut self) {
        let Some(new_password) = self.settings.password.clone() else {
            return;
        };
        let id_field = self.profile.id_field(EntityKind::User).unwrap_or("userid");
        let Some(admin) = self.local.get(EntityKind::User, &self.settings.user) else {
            self.presenter
                .warn(&format!("no local user {} to update", self.settings.user));
            return;
        };
        let mut payload = json!({id_field: admin.id, "passwd": new_password});
        if self.release >= Release::R6_4 {
            let current = self
                .fallback_password
                .clone()
                .unwrap_or_else(|| DEFAULT_PASSWORD.to_string());
            payload["current_passwd"] = json!(current);
        }
        match self.client.update(EntityKind::User, payload).await {
            Ok(_) => {
                if let Err(error) = self
                    .client
                    .login_password(&self.settings.user, &new_password)
                    .await
                {
                    self.presenter
                        .warn(&format!("re-login after password change failed: {error}"));
                } else {
                    self.needs_password_change = false;
                }
            }
            Err(error) => {
                self.presenter
                    .warn(&format!("password change failed: {error}"));
            }
        }
    }

    /// Apply the settings singleton plus configured overrides, then the
    /// secret global macros.
    async fn apply_global_settings(&mut self) -> Result<(), Error> {
        if self.release < Release::R6_0 {
            return Ok(());
        }

        let discard = self.profile.discard_fields(EntityKind::Settings);
        let mut merged = Map::new();
        for record in self.snapshot.get(EntityKind::Settings) {
            if discard.contains(&record.name.as_str()) {
                continue;
            }
            if let Some(map) = record.payload.as_object() {
                for (key, value) in map {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }

        for (level, severity) in &self.settings.settings_overrides.severity {
            if let Some(name) = &severity.name {
                merged.insert(format!("severity_name_{level}"), json!(name));
            }
            if let Some(color) = &severity.color {
                if i64::from_str_radix(color.trim_start_matches('#'), 16).is_ok() {
                    merged.insert(format!("severity_color_{level}"), json!(color));
                }
            }
        }
        if self.release >= Release::R7_0 {
            for (target, value) in &self.settings.settings_overrides.timeout {
                let target = target.trim_start_matches("timeout_");
                if !self.profile.timeout_targets().contains(&target) {
                    continue;
                }
                let Some(seconds) = parse_timeout_seconds(value) else {
                    continue;
                };
                let floor = TIMEOUT_FLOORS
                    .iter()
                    .find(|(name, _)| *name == target)
                    .map(|(_, floor)| *floor)
                    .unwrap_or(1);
                let clamped = seconds.clamp(1, 600).max(floor);
                merged.insert(format!("timeout_{target}"), json!(format!("{clamped}s")));
            }
        }

        if !merged.is_empty() {
            self.client
                .call("settings.update", Value::Object(merged))
                .await
                .map_err(|error| Error::Section {
                    section: "GLOBAL".into(),
                    reason: format!("settings update failed: {error}"),
                })?;
        }

        for secret in &self.settings.secret_global_macros {
            let payload = json!({
                "macro": secret.name,
                "value": secret.value,
                "type": "1",
            });
            if let Err(error) = self.client.create(EntityKind::UserMacroGlobal, payload).await {
                self.report
                    .record_failures
                    .push((format!("usermacro/{}", secret.name), error.to_string()));
            }
        }
        Ok(())
    }

    /// Normalize and apply one section's kinds through the plain API
    /// surface. Per-record failures are counted and never abort.
    async fn apply_section(
        &mut self,
        section: Section,
        master_release: Release,
    ) -> Result<(), Error> {
        self.step(&format!("applySection[{section}]"));
        let kinds = self.profile.section_kinds(section).to_vec();
        for kind in kinds {
            if kind.is_singleton() {
                continue;
            }
            let records = self.snapshot.take(kind);
            let outcome = {
                let normalizer = self.normalizer(master_release, Direction::Worker);
                normalizer.process(kind, records)?
            };
            self.extend_plan.extend(outcome.extend);

            for record in outcome.records {
                let mut payload = record.payload.clone();
                let is_update = self.local.contains(kind, &record.name);
                let result = if is_update {
                    if let (Some(map), Some(local)) =
                        (payload.as_object_mut(), self.local.get(kind, &record.name))
                    {
                        // The server refuses a changed event source on an
                        // existing action; creates still need it.
                        if kind == EntityKind::Action {
                            map.remove("eventsource");
                        }
                        let id_field = self.profile.id_field(kind).unwrap_or_default();
                        map.insert(id_field.to_string(), json!(local.id));
                    }
                    self.client.update(kind, payload).await
                } else {
                    self.client.create(kind, payload).await
                };
                match result {
                    Ok(_) => self.presenter.tick(if is_update { 'U' } else { 'C' }),
                    Err(error) => {
                        self.presenter.tick('X');
                        self.report
                            .record_failures
                            .push((format!("{kind}/{}", record.name), error.to_string()));
                    }
                }
            }
        }
        self.presenter.end_ticks();
        self.refresh_local().await?;
        Ok(())
    }

    async fn import_configuration(&mut self, master_release: Release) -> Result<(), Error> {
        let outcome = {
            let bridge = ConfigBridge {
                client: &self.client,
                profile: &self.profile,
                presenter: &*self.presenter,
            };
            bridge
                .import(
                    &mut self.snapshot,
                    master_release,
                    &self.local,
                    self.settings.template_skip,
                )
                .await?
        };
        for (name, error) in &outcome.template_errors {
            self.report
                .record_failures
                .push((format!("template/{name}"), error.clone()));
        }
        self.report.templates = Some(outcome);
        self.refresh_local().await?;
        Ok(())
    }

    /// A ten-minute maintenance window over every host group keeps the
    /// churn of the host phase from alerting anyone.
    async fn alert_stop(&mut self) -> Result<(), Error> {
        let stale: Vec<String> = self
            .local
            .entities(EntityKind::Maintenance)
            .filter(|entity| entity.name == names::UPDATE_MAINTENANCE)
            .map(|entity| entity.id.clone())
            .collect();
        if !stale.is_empty() {
            self.client
                .delete(EntityKind::Maintenance, stale)
                .await
                .map_err(|error| Error::Section {
                    section: "ALERT_STOP".into(),
                    reason: format!("cannot delete stale window: {error}"),
                })?;
        }

        let now = Utc::now().timestamp();
        let group_ids = self.local.ids(EntityKind::HostGroup);
        let id_field = self.profile.id_field(EntityKind::HostGroup).unwrap_or("groupid");
        let groups_value = if self.release >= Release::R6_0 {
            json!(group_ids
                .iter()
                .map(|id| json!({id_field: id}))
                .collect::<Vec<_>>())
        } else {
            json!(group_ids)
        };
        let groups_key = if self.release >= Release::R6_0 {
            "groups"
        } else {
            "groupids"
        };
        let window = json!({
            "name": names::UPDATE_MAINTENANCE,
            "active_since": now,
            "active_till": now + ALERT_STOP_PERIOD,
            "maintenance_type": 0,
            "timeperiods": [{
                "timeperiod_type": 0,
                "start_date": now,
                "period": ALERT_STOP_PERIOD,
            }],
            groups_key: groups_value,
        });
        self.client
            .create(EntityKind::Maintenance, window)
            .await
            .map_err(|error| Error::Section {
                section: "ALERT_STOP".into(),
                reason: format!("cannot create window: {error}"),
            })?;
        self.refresh_local().await?;
        Ok(())
    }

    async fn apply_hosts(&mut self, master_release: Release) -> Result<(), Error> {
        let records = self.snapshot.take(EntityKind::Host);
        let report = {
            let reconciler = HostReconciler {
                client: &self.client,
                profile: &self.profile,
                identity: &self.identity,
                settings: &self.settings,
                presenter: &*self.presenter,
                master_release,
            };
            reconciler.run(records, &self.local).await?
        };
        for (name, error) in &report.failed_hosts {
            self.report
                .record_failures
                .push((format!("host/{name}"), error.clone()));
        }
        self.report.hosts = Some(report);
        self.refresh_local().await?;
        Ok(())
    }

    /// First-run the discovery rules and the slow-interval items so the
    /// new hosts produce data without waiting a full cycle.
    async fn check_now(&mut self) {
        tokio::time::sleep(Duration::from_secs(self.settings.checknow_wait)).await;

        let host_ids = self.local.ids(EntityKind::Host);
        let mut output = vec!["itemid"];
        if self.release > Release::R4_0 {
            output.push("master_itemid");
        }

        let lld_targets = match self
            .client
            .call(
                "discoveryrule.get",
                json!({"output": output, "hostids": host_ids}),
            )
            .await
        {
            Ok(result) => collect_item_targets(&result),
            Err(_) => Vec::new(),
        };
        if !lld_targets.is_empty() {
            if let Err(error) = self.send_check_now(&lld_targets).await {
                self.presenter.warn(&format!("discovery check-now failed: {error}"));
            }
        }

        let intervals = normalize_intervals(&self.settings.checknow_interval);
        if intervals.is_empty() {
            return;
        }
        let item_targets = match self
            .client
            .call(
                "item.get",
                json!({
                    "output": output,
                    "hostids": self.local.ids(EntityKind::Host),
                    "filter": {"delay": intervals},
                }),
            )
            .await
        {
            Ok(result) => collect_item_targets(&result),
            Err(_) => Vec::new(),
        };
        if !item_targets.is_empty() {
            if let Err(error) = self.send_check_now(&item_targets).await {
                self.presenter.warn(&format!("item check-now failed: {error}"));
            }
        }
    }

    async fn send_check_now(&self, targets: &[String]) -> Result<(), Error> {
        let params = if self.release >= Release::R5_2 {
            json!(targets
                .iter()
                .map(|id| json!({"type": "6", "request": {"itemid": id}}))
                .collect::<Vec<_>>())
        } else {
            json!({"type": "6", "itemids": targets})
        };
        self.client.task_create(params).await?;
        Ok(())
    }

    /// Apply the EXTEND plan. Entries registered parent-first are walked
    /// in reverse so deletions run child-before-parent; the service link
    /// updates resolve against the now-complete identity map.
    async fn apply_extend(&mut self, master_release: Release) -> Result<(), Error> {
        let plan: Vec<(EntityKind, Vec<ExtendOp>)> =
            self.extend_plan.drain(..).rev().collect();
        for (kind, ops) in plan {
            for op in ops {
                match op {
                    ExtendOp::Update { name, mut payload } => {
                        let resolved_id = {
                            let normalizer = self.normalizer(master_release, Direction::Worker);
                            if kind == EntityKind::Service {
                                normalizer.resolve_service_links(&mut payload);
                            }
                            self.identity.to_id(kind, &name)
                        };
                        let Some(id) = resolved_id else {
                            continue;
                        };
                        let id_field = self.profile.id_field(kind).unwrap_or_default();
                        if let Some(map) = payload.as_object_mut() {
                            map.insert(id_field.to_string(), json!(id));
                        }
                        match self.client.update(kind, payload).await {
                            Ok(_) => self.presenter.tick('U'),
                            Err(error) => {
                                self.presenter.tick('X');
                                self.report
                                    .record_failures
                                    .push((format!("{kind}/{name}"), error.to_string()));
                            }
                        }
                    }
                    ExtendOp::Delete { ids } => {
                        if self.settings.no_delete {
                            continue;
                        }
                        for id in ids {
                            match self.client.delete(kind, vec![id.clone()]).await {
                                Ok(_) => self.presenter.tick('D'),
                                Err(error) => {
                                    self.presenter.tick('X');
                                    self.report
                                        .record_failures
                                        .push((format!("{kind}/{id}"), error.to_string()));
                                }
                            }
                        }
                    }
                }
            }
        }
        self.presenter.end_ticks();
        self.refresh_local().await?;
        Ok(())
    }

    /// Merge and apply the authentication singleton, creating converted
    /// user directories first when the snapshot predates the split.
    async fn apply_authentication(&mut self, master_release: Release) -> Result<(), Error> {
        let records: Vec<Record> = self
            .snapshot
            .take(EntityKind::Authentication)
            .into_iter()
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        let plan = {
            let normalizer = self.normalizer(master_release, Direction::Worker);
            normalizer.authentication_plan(&records)?
        };
        let Some(mut plan) = plan else {
            return Ok(());
        };

        if let Some(directory) = plan.ldap_directory.take() {
            match self.client.create(EntityKind::UserDirectory, directory).await {
                Ok(result) => {
                    let id = result
                        .get("userdirectoryids")
                        .and_then(|ids| ids.get(0))
                        .and_then(as_str_like);
                    if let Some(id) = id {
                        plan.update.insert("ldap_auth_enabled".into(), json!("1"));
                        plan.update.insert("ldap_userdirectoryid".into(), json!(id));
                    }
                }
                Err(error) => {
                    self.presenter
                        .warn(&format!("LDAP directory conversion failed: {error}"));
                }
            }
        }
        if let Some(directory) = plan.saml_directory.take() {
            if let Err(error) = self.client.create(EntityKind::UserDirectory, directory).await {
                self.presenter
                    .warn(&format!("SAML directory conversion failed: {error}"));
                plan.update.insert("saml_auth_enabled".into(), json!("0"));
            }
        }

        if plan.update.is_empty() {
            return Ok(());
        }
        self.client
            .call("authentication.update", Value::Object(plan.update))
            .await
            .map_err(|error| Error::Section {
                section: "AUTH".into(),
                reason: format!("authentication update failed: {error}"),
            })?;
        Ok(())
    }

    /// Assign the configured alert medias to users.
    async fn apply_alert_media(&mut self) -> Result<(), Error> {
        if self.settings.role == Role::Replica {
            return Ok(());
        }
        if self.settings.media_settings.is_empty()
            || self.local.is_empty(EntityKind::MediaType)
        {
            return Ok(());
        }

        let media_key = if self.release >= Release::R6_2 {
            "medias"
        } else {
            "user_medias"
        };
        let user_id_field = self.profile.id_field(EntityKind::User).unwrap_or("userid");

        // media type -> user -> assignment flips into user -> medias.
        let mut per_user: Map<String, Value> = Map::new();
        for (media_name, users) in &self.settings.media_settings {
            let Some(media_id) = self.identity.to_id(EntityKind::MediaType, media_name) else {
                continue;
            };
            for (user_name, target) in users {
                let Some(user_id) = self.identity.to_id(EntityKind::User, user_name) else {
                    continue;
                };
                let Some(media) = build_media_entry(&media_id, target) else {
                    continue;
                };
                let entry = per_user
                    .entry(user_id.clone())
                    .or_insert_with(|| json!({user_id_field: user_id, media_key: []}));
                if let Some(Value::Array(items)) = entry.get_mut(media_key) {
                    items.push(media);
                }
            }
        }

        for (user_id, payload) in per_user {
            if let Err(error) = self.client.update(EntityKind::User, payload).await {
                self.report
                    .record_failures
                    .push((format!("user-media/{user_id}"), error.to_string()));
            }
        }
        Ok(())
    }
}

/// A valid applied-version value is a UUID or a direct-master stamp.
fn applied_version_is_valid(value: &str) -> bool {
    if Uuid::parse_str(value).is_ok() {
        return true;
    }
    value.starts_with(names::DIRECT_MASTER_PREFIX) && value.ends_with("__")
}

/// `30s` / `2m` / bare seconds into seconds.
fn parse_timeout_seconds(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Some(seconds) = value.strip_suffix('s') {
        return seconds.parse().ok();
    }
    if let Some(minutes) = value.strip_suffix('m') {
        return minutes.parse::<i64>().ok().map(|m| m * 60);
    }
    value.parse().ok()
}

/// `5m`/`1h`/`1d`/bare seconds into second strings for the item filter.
fn normalize_intervals(intervals: &[String]) -> Vec<String> {
    let mut seconds: Vec<String> = intervals
        .iter()
        .filter_map(|interval| {
            let interval = interval.trim();
            let (number, factor) = match interval.chars().last() {
                Some('m') => (&interval[..interval.len() - 1], 60),
                Some('h') => (&interval[..interval.len() - 1], 3600),
                Some('d') => (&interval[..interval.len() - 1], 86_400),
                _ => (interval, 1),
            };
            number.parse::<i64>().ok().map(|n| (n * factor).to_string())
        })
        .collect();
    seconds.sort();
    seconds.dedup();
    seconds
}

/// Items chain to a master item; the check-now must target the root.
fn collect_item_targets(result: &Value) -> Vec<String> {
    result
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|item| {
            let master = item.get("master_itemid").and_then(as_int).unwrap_or(0);
            if master != 0 {
                Some(master.to_string())
            } else {
                item.get("itemid").and_then(as_str_like)
            }
        })
        .collect()
}

/// One user-media entry from a configured assignment; `None` when the
/// assignment is incomplete.
fn build_media_entry(media_id: &str, target: &crate::config::MediaTarget) -> Option<Value> {
    let send_to: Vec<String> = match &target.to {
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Array(items) => items.iter().filter_map(as_str_like).collect(),
        _ => Vec::new(),
    };
    if send_to.is_empty() || target.severity.is_empty() || target.work_time.is_empty() {
        return None;
    }

    // Severity is a bitmap over levels 0..=5.
    let mut severity = 0i64;
    for level in 0..6 {
        if target
            .severity
            .get(&level.to_string())
            .map(|flag| flag == "YES")
            .unwrap_or(false)
        {
            severity += 1 << level;
        }
    }

    let weekday = |name: &str| -> Option<u8> {
        match name.to_uppercase().as_str() {
            "MON" => Some(1),
            "TUE" => Some(2),
            "WED" => Some(3),
            "THU" => Some(4),
            "FRI" => Some(5),
            "SAT" => Some(6),
            "SUN" => Some(7),
            _ => None,
        }
    };
    #[allow(clippy::unwrap_used)] // literal pattern
    let window = regex::Regex::new(r"^\d{2}:\d{2}-\d{2}:\d{2}$").unwrap();
    let mut periods: Vec<String> = Vec::new();
    for (day, time) in &target.work_time {
        let Some(day_number) = weekday(day) else {
            continue;
        };
        if !window.is_match(time) {
            continue;
        }
        periods.push(format!("{day_number},{time}"));
    }
    periods.sort();
    if periods.is_empty() {
        return None;
    }

    Some(json!({
        "mediatypeid": media_id,
        "sendto": send_to,
        "active": "0",
        "severity": severity.to_string(),
        "period": periods.join(";"),
    }))
}
