//! Snapshot model: version metadata and the records inside a version.
//!
//! A snapshot is immutable once written. Its metadata row and its record
//! set live in separate store tables so versions can be listed without
//! pulling payload bodies.

use crate::error::StoreError;
use crate::kind::EntityKind;
use crate::release::Release;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata of one stored version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMeta {
    /// UUID of the version (or a reserved sentinel before first upload).
    pub version_id: String,
    /// Creation time, Unix seconds UTC.
    pub created_at: i64,
    /// Release of the master that produced the snapshot.
    pub master_release: Release,
    /// Free-text provenance: producing node, endpoint, creation date.
    pub description: String,
}

impl VersionMeta {
    /// Mint a fresh version for a master at `release`.
    pub fn create(release: Release, description: String) -> Self {
        VersionMeta {
            version_id: Uuid::new_v4().to_string(),
            created_at: Utc::now().timestamp(),
            master_release: release,
            description,
        }
    }
}

/// One release-independent snapshot record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: EntityKind,
    /// Stable name within the kind; for singleton kinds this is the
    /// property sub-key.
    pub name: String,
    pub payload: Value,
}

impl Record {
    pub fn new(kind: EntityKind, name: impl Into<String>, payload: Value) -> Self {
        Record {
            kind,
            name: name.into(),
            payload,
        }
    }
}

/// A record as persisted: the snapshot record plus its store-level id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub data_id: String,
    pub kind: EntityKind,
    pub name: String,
    pub payload: Value,
}

impl StoredRecord {
    pub fn into_record(self) -> Record {
        Record {
            kind: self.kind,
            name: self.name,
            payload: self.payload,
        }
    }
}

/// The working record set of one snapshot, grouped by kind with snapshot
/// order preserved inside each kind.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    records: BTreeMap<EntityKind, Vec<Record>>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group stored records by kind, enforcing the `(kind, name)`
    /// uniqueness invariant.
    pub fn from_stored(stored: Vec<StoredRecord>) -> Result<Self, StoreError> {
        let mut set = RecordSet::new();
        for record in stored {
            set.push(record.into_record())?;
        }
        Ok(set)
    }

    /// Append a record, rejecting duplicate `(kind, name)` pairs.
    pub fn push(&mut self, record: Record) -> Result<(), StoreError> {
        let bucket = self.records.entry(record.kind).or_default();
        if bucket.iter().any(|existing| existing.name == record.name) {
            return Err(StoreError::Corrupt(format!(
                "duplicate record {}/{}",
                record.kind, record.name
            )));
        }
        bucket.push(record);
        Ok(())
    }

    /// Replace the records of one kind wholesale (normalizer output).
    pub fn replace(&mut self, kind: EntityKind, records: Vec<Record>) {
        if records.is_empty() {
            self.records.remove(&kind);
        } else {
            self.records.insert(kind, records);
        }
    }

    pub fn get(&self, kind: EntityKind) -> &[Record] {
        self.records.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove and return the records of one kind.
    pub fn take(&mut self, kind: EntityKind) -> Vec<Record> {
        self.records.remove(&kind).unwrap_or_default()
    }

    pub fn contains(&self, kind: EntityKind) -> bool {
        self.records.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.records.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    /// Flatten into stored records, minting a fresh data id per record.
    pub fn to_stored(&self) -> Vec<StoredRecord> {
        self.records
            .values()
            .flatten()
            .map(|record| StoredRecord {
                data_id: Uuid::new_v4().to_string(),
                kind: record.kind,
                name: record.name.clone(),
                payload: record.payload.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_kind_name_is_rejected() {
        let mut set = RecordSet::new();
        set.push(Record::new(EntityKind::Host, "web1", json!({})))
            .unwrap();
        set.push(Record::new(EntityKind::Template, "web1", json!({})))
            .unwrap();
        let duplicate = set.push(Record::new(EntityKind::Host, "web1", json!({})));
        assert!(duplicate.is_err());
    }

    #[test]
    fn stored_round_trip_preserves_order_and_mints_ids() {
        let mut set = RecordSet::new();
        set.push(Record::new(EntityKind::Host, "a", json!({"n": 1})))
            .unwrap();
        set.push(Record::new(EntityKind::Host, "b", json!({"n": 2})))
            .unwrap();

        let stored = set.to_stored();
        assert_eq!(stored.len(), 2);
        assert_ne!(stored[0].data_id, stored[1].data_id);

        let back = RecordSet::from_stored(stored).unwrap();
        let names: Vec<_> = back.get(EntityKind::Host).iter().map(|r| &r.name).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn replace_with_empty_removes_the_kind() {
        let mut set = RecordSet::new();
        set.push(Record::new(EntityKind::Sla, "gold", json!({})))
            .unwrap();
        set.replace(EntityKind::Sla, Vec::new());
        assert!(!set.contains(EntityKind::Sla));
    }
}
