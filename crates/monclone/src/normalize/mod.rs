//! Per-kind snapshot processors.
//!
//! Each processor takes the records of one kind and returns records the
//! other side can safely accept. Master direction runs before upload and
//! flattens local ids to stable names; worker direction runs inside each
//! section and resolves names back to local ids while fixing up shapes
//! for the target release. Processors may additionally emit deletion
//! sidecars that the orchestrator appends to its EXTEND plan.
//!
//! Kinds without a processor pass through untouched.

mod account;
mod action;
mod authentication;
mod correlation;
mod drule;
mod maintenance;
mod proxy;
mod script;
mod service;

pub use authentication::AuthPlan;

use crate::config::Settings;
use crate::error::NormalizeError;
use crate::identity::IdentityMap;
use crate::kind::EntityKind;
use crate::local::LocalInventory;
use crate::profile::Profile;
use crate::release::Release;
use crate::snapshot::Record;
use crate::value::{translate, IdDirection};
use serde_json::Value;

/// Which side of the pipeline a processor runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Before upload: local ids become stable names.
    Master,
    /// Before apply: stable names become local ids, shapes adapt to the
    /// target release.
    Worker,
}

/// One entry of the orchestrator's EXTEND plan.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtendOp {
    /// A follow-up update once the section's creations exist (service
    /// parent/child links).
    Update { name: String, payload: Value },
    /// Local ids to delete because the snapshot no longer names them.
    Delete { ids: Vec<String> },
}

/// Processor output: the surviving records plus EXTEND sidecars.
#[derive(Debug, Default)]
pub struct Outcome {
    pub records: Vec<Record>,
    pub extend: Vec<(EntityKind, Vec<ExtendOp>)>,
}

impl Outcome {
    pub fn records(records: Vec<Record>) -> Self {
        Outcome {
            records,
            extend: Vec::new(),
        }
    }
}

/// Everything a processor may consult.
pub struct Normalizer<'a> {
    pub profile: &'a Profile,
    pub identity: &'a IdentityMap,
    pub local: &'a LocalInventory,
    pub settings: &'a Settings,
    /// Release of the master that produced the snapshot.
    pub master_release: Release,
    pub direction: Direction,
}

impl<'a> Normalizer<'a> {
    pub fn is_master(&self) -> bool {
        self.direction == Direction::Master
    }

    /// Release of the node being written to (the worker's own release on
    /// the worker path, the master's on the master path).
    pub fn release(&self) -> Release {
        self.profile.release
    }

    fn id_direction(&self) -> IdDirection {
        match self.direction {
            Direction::Master => IdDirection::IdToName,
            Direction::Worker => IdDirection::NameToId,
        }
    }

    /// Translate one id-or-name through the identity map in the direction
    /// of this run.
    pub fn translate(&self, kind: EntityKind, target: &str) -> Option<String> {
        translate(self.identity, kind, target, self.id_direction())
    }

    /// Run the processor for a kind. Unprocessed kinds pass through.
    pub fn process(
        &self,
        kind: EntityKind,
        records: Vec<Record>,
    ) -> Result<Outcome, NormalizeError> {
        match kind {
            EntityKind::Action => action::process(self, records),
            EntityKind::Maintenance => maintenance::process(self, records),
            EntityKind::Proxy => proxy::process(self, records),
            EntityKind::ProxyGroup => proxy::process_group(self, records),
            EntityKind::DiscoveryRule => drule::process(self, records),
            EntityKind::Script => script::process(self, records),
            EntityKind::Correlation => correlation::process(self, records),
            EntityKind::Regexp => correlation::process_regexp(self, records),
            EntityKind::Sla => service::process_sla(self, records),
            EntityKind::Service => service::process_service(self, records),
            EntityKind::Connector => service::process_connector(self, records),
            EntityKind::User => account::process_user(self, records),
            EntityKind::UserGroup => account::process_usergroup(self, records),
            EntityKind::Role => account::process_role(self, records),
            EntityKind::UserDirectory => account::process_userdirectory(self, records),
            EntityKind::Mfa => account::process_mfa(self, records),
            EntityKind::Authentication => authentication::process_master(self, records),
            _ => Ok(Outcome::records(records)),
        }
    }

    /// Build the worker-side authentication update plan. Separate from
    /// [`process`](Self::process) because applying it needs API calls
    /// (user directory creation) that belong to the orchestrator.
    pub fn authentication_plan(
        &self,
        records: &[Record],
    ) -> Result<Option<AuthPlan>, NormalizeError> {
        authentication::prepare_worker(self, records)
    }

    /// Resolve service parent/child name lists into id references. Runs
    /// at EXTEND time, after the services themselves exist.
    pub fn resolve_service_links(&self, payload: &mut Value) {
        service::resolve_links(self, payload);
    }

    /// Sidecar deletions: local ids whose names the snapshot no longer
    /// carries. The master never deletes.
    pub(crate) fn deletions_against(
        &self,
        kind: EntityKind,
        records: &[Record],
        skip_names: &[&str],
    ) -> Vec<String> {
        if self.is_master() {
            return Vec::new();
        }
        let kept: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        self.local
            .entities(kind)
            .filter(|entity| !skip_names.contains(&entity.name.as_str()))
            .filter(|entity| !kept.contains(&entity.name.as_str()))
            .map(|entity| entity.id.clone())
            .collect()
    }
}
