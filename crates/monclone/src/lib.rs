// Copyright 2026 MonClone Contributors

//! Version-aware configuration replication for a Monitor server.
//!
//! MonClone snapshots the cloneable configuration of a designated *master*
//! Monitor instance (hosts, templates, groups, actions, maintenance windows,
//! users, media types, proxies, global settings, authentication) into a
//! pluggable versioned store, and replays named snapshots onto *worker*
//! instances - across Monitor API releases 4.0 through 7.0.
//!
//! The moving parts:
//!
//! - [`Profile`] - a declarative per-release descriptor of API methods,
//!   field names, processing sections and import rules. A single 4.0 base
//!   plus an ordered sequence of release diffs.
//! - [`IdentityMap`] - bidirectional local-id <-> stable-name index per
//!   entity kind, with sentinel handling for semantic zeros.
//! - [`StoreDriver`] - uniform async interface over the version store;
//!   file and in-memory drivers ship here, DynamoDB and Redis drivers in
//!   their own crates.
//! - [`Normalizer`] - per-kind payload processors that rewrite snapshot
//!   records into a shape the other side accepts.
//! - [`ConfigBridge`] - wrapper for the Monitor's bundled configuration
//!   export/import, with dependency-safe template partitioning.
//! - [`HostReconciler`] - parallel host create/update/delete keyed by a
//!   stable carry-tag UUID that survives renames.
//! - [`Orchestrator`] - drives a full master or worker run.
//!
//! # Example
//!
//! ```rust,ignore
//! use monclone::{Orchestrator, Settings, store::FileStore, ConsolePresenter};
//! use std::sync::Arc;
//!
//! # async fn example() -> monclone::Result<()> {
//! let settings = Settings::load(Default::default())?;
//! let store = Arc::new(FileStore::new(FileStore::default_dir()));
//! let presenter = Arc::new(ConsolePresenter::new(settings.quiet));
//! let mut run = Orchestrator::connect(settings, store, presenter).await?;
//! run.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod hosts;
pub mod identity;
pub mod kind;
pub mod local;
pub mod normalize;
pub mod orchestrator;
pub mod presenter;
pub mod profile;
pub mod release;
pub mod snapshot;
pub mod store;
pub mod value;

pub use api::MonitorClient;
pub use bridge::ConfigBridge;
pub use config::{Role, Settings, StoreSettings};
pub use error::{
    ApiError, ConfigError, Error, NormalizeError, PreconditionError, Result, StoreError,
};
pub use hosts::HostReconciler;
pub use identity::IdentityMap;
pub use kind::EntityKind;
pub use local::LocalInventory;
pub use normalize::Normalizer;
pub use orchestrator::{Orchestrator, RunReport};
pub use presenter::{ConsolePresenter, Presenter, SilentPresenter};
pub use profile::Profile;
pub use release::Release;
pub use snapshot::{Record, RecordSet, StoredRecord, VersionMeta};
pub use store::{ClearScope, MemoryStore, StoreDriver, StoreRegistry};

/// Reserved names shared by every node in a clone topology.
pub mod names {
    /// Namespace prefix for store tables and environment variables.
    pub const PREFIX: &str = "MC_";

    /// Host tag carrying the stable per-host UUID. The master assigns it;
    /// workers must never create or change it.
    pub const CARRY_TAG: &str = "MC_UUID";

    /// Host tag whose values name the worker nodes monitoring the host.
    /// The same word prefixes proxy markers in descriptions
    /// (`MC_WORKER:<node>;`).
    pub const WORKER_TAG: &str = "MC_WORKER";

    /// Global macro on the worker holding the currently-applied version id.
    pub const APPLIED_VERSION_MACRO: &str = "{$MC_VERSION}";

    /// Name of the one-off maintenance window created while a run applies.
    pub const UPDATE_MAINTENANCE: &str = "__MC_UPDATE__";

    /// Applied-version value meaning "initialized, nothing applied yet".
    pub const NOT_YET_CLONED: &str = "__NOT_YET_CLONE__";

    /// Applied-version prefix for direct (store-less) master reads.
    pub const DIRECT_MASTER_PREFIX: &str = "__DIRECT_MASTER_";

    /// Placeholder version id used by a master before its first upload.
    pub const FIRST_CREATE: &str = "__FIRST_CREATE__";

    /// Reserved super-administrator account. Never cloned, never deleted.
    pub const SUPER_USER: &str = "Admin";

    /// Reserved administrator user group. Never cloned.
    pub const SUPER_GROUP: &str = "Zabbix administrators";

    /// Role id (and pre-5.2 user type) marking a super administrator.
    pub const SUPER_ROLE_ID: &str = "3";
}
