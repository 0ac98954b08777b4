//! Error taxonomy for the replication engine.
//!
//! Errors are grouped the way the orchestrator reacts to them: precondition
//! failures abort before any mutation, store failures abort runs that need
//! the store, normalization failures are fatal for their record kind, and
//! per-record apply failures are *not* errors at all - they are counted in
//! the run report and never abort the pipeline.

use crate::kind::EntityKind;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for a replication run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A check that must hold before any mutation failed.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// The version store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A snapshot record could not be normalized for the target release.
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    /// The Monitor API failed in a way that is fatal for the section.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Configuration could not be loaded or merged.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A pipeline section reported failure.
    #[error("section {section} failed: {reason}")]
    Section { section: String, reason: String },

    /// A cancellation request arrived between sections.
    #[error("run cancelled")]
    Cancelled,
}

/// Fatal checks performed before any write.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PreconditionError {
    #[error("unsupported Monitor release {0}; supported range is 4.0 through 7.0")]
    UnsupportedRelease(String),

    #[error("worker release {worker} is older than snapshot master release {master}")]
    ReleaseSkew { worker: String, master: String },

    #[error("no credentials: neither a token nor a password is configured")]
    MissingCredentials,

    #[error("account {0} lacks super-administrator permission")]
    NotSuperAdministrator(String),

    #[error("reserved notification user {0} is missing")]
    MissingReservedUser(String),

    #[error("reserved notification user {0} is disabled")]
    ReservedUserDisabled(String),

    #[error("endpoint serves node {found}, expected {expected}")]
    NodeMismatch { expected: String, found: String },

    #[error("store holds no versions to apply")]
    NoVersions,
}

/// Failures of the version store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("{backend} store connection failed: {reason}")]
    Connection { backend: String, reason: String },

    #[error("{backend} store rejected a write: {reason}")]
    Write { backend: String, reason: String },

    #[error("version {0} does not exist in the store")]
    MissingVersion(String),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("payload codec failed: {0}")]
    Codec(String),

    #[error("record {name} is {size} bytes compressed, above the {limit}-byte store limit")]
    RecordTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("unknown store type {tag}; known types: {known}")]
    UnknownDriver { tag: String, known: String },

    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A snapshot record that cannot be reshaped for the target release.
#[derive(Debug, Error)]
#[error("cannot normalize {kind} records: {reason}")]
pub struct NormalizeError {
    pub kind: EntityKind,
    pub reason: String,
}

impl NormalizeError {
    pub fn new(kind: EntityKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Monitor API client failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("HTTP transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid endpoint URL: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("API error {code}: {message} ({data})")]
    Rpc {
        code: i64,
        message: String,
        data: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed API response: {0}")]
    Malformed(String),
}

/// Configuration loading and merging failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Error {
    /// Process exit code for this error, per the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Precondition(_) | Error::Api(_) | Error::Config(_) => 2,
            Error::Store(_) => 3,
            Error::Normalize(_) | Error::Section { .. } | Error::Cancelled => 255,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        let precondition: Error = PreconditionError::MissingCredentials.into();
        assert_eq!(precondition.exit_code(), 2);

        let store: Error = StoreError::MissingVersion("x".into()).into();
        assert_eq!(store.exit_code(), 3);

        let section = Error::Section {
            section: "PRE".into(),
            reason: "boom".into(),
        };
        assert_eq!(section.exit_code(), 255);
    }
}
