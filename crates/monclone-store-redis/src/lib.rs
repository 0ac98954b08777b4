//! Redis version store for MonClone
//!
//! Persists snapshots in two logical databases:
//!
//! - db 0 (`VERSION`) - one hash per version id with fields `UNIXTIME`,
//!   `MASTER_VERSION` and `DESCRIPTION`.
//! - db 1 (`DATA`) - one hash per version id; fields are data ids, values
//!   are bzip2-compressed JSON bodies of `{METHOD, NAME, DATA}`.
//!
//! Everything on the wire is binary, so encode/decode happens at this
//! boundary and nowhere else. Deletion is immediate - Redis has no use
//! for tombstones.
//!
//! # See Also
//!
//! - [`StoreDriver`] - The trait this implements
//! - [`monclone-store-dynamodb`](https://docs.rs/monclone-store-dynamodb) - Alternative: DynamoDB-based store

use async_trait::async_trait;
use monclone::codec;
use monclone::release::Release;
use monclone::snapshot::{StoredRecord, VersionMeta};
use monclone::store::{sort_versions, ClearScope, DriverFuture, StoreDriver, StoreRegistry};
use monclone::{EntityKind, StoreError, StoreSettings};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const BACKEND: &str = "redis";
const VERSION_DB: u8 = 0;
const DATA_DB: u8 = 1;

fn store_err(reason: impl std::fmt::Display) -> StoreError {
    StoreError::Connection {
        backend: BACKEND.to_string(),
        reason: reason.to_string(),
    }
}

fn connection_url(host: &str, port: u16, auth: &str, db: u8) -> String {
    format!("redis://{auth}{host}:{port}/{db}")
}

/// Wrap one record into the stored `{METHOD, NAME, DATA}` envelope,
/// compressed and size-checked.
fn encode_record(record: &StoredRecord) -> Result<Vec<u8>, StoreError> {
    let envelope = json!({
        "METHOD": record.kind,
        "NAME": record.name,
        "DATA": record.payload,
    });
    let body = codec::encode(&envelope)?;
    codec::check_record_size(&format!("{}/{}", record.kind, record.name), &body)?;
    Ok(body)
}

/// Reverse of [`encode_record`].
fn decode_record(data_id: String, body: &[u8]) -> Result<StoredRecord, StoreError> {
    let envelope: serde_json::Value = codec::decode(body)?;
    let kind_text = envelope
        .get("METHOD")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| StoreError::Corrupt(format!("record {data_id} without METHOD")))?;
    let kind = EntityKind::from_api_method(kind_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown kind {kind_text}")))?;
    let name = envelope
        .get("NAME")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| StoreError::Corrupt(format!("record {data_id} without NAME")))?
        .to_string();
    let payload = envelope
        .get("DATA")
        .cloned()
        .ok_or_else(|| StoreError::Corrupt(format!("record {data_id} without DATA")))?;
    Ok(StoredRecord {
        data_id,
        kind,
        name,
        payload,
    })
}

/// Turn a version's hash entries into records. An empty hash means the
/// version was never written (or already expired).
fn records_from_entries(
    version_id: &str,
    entries: HashMap<String, Vec<u8>>,
) -> Result<Vec<StoredRecord>, StoreError> {
    if entries.is_empty() {
        return Err(StoreError::MissingVersion(version_id.to_string()));
    }
    let mut records = Vec::with_capacity(entries.len());
    for (data_id, body) in entries {
        records.push(decode_record(data_id, &body)?);
    }
    Ok(records)
}

fn write_err(reason: impl std::fmt::Display) -> StoreError {
    StoreError::Write {
        backend: BACKEND.to_string(),
        reason: reason.to_string(),
    }
}

/// Redis-backed version store.
pub struct RedisStore {
    version: ConnectionManager,
    data: ConnectionManager,
}

impl RedisStore {
    /// Connect both logical databases and verify the server responds.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let host = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        let port = settings.port.unwrap_or(6379);
        let auth = settings
            .credential
            .as_ref()
            .map(|password| format!(":{password}@"))
            .unwrap_or_default();

        let version = Self::manager(&host, port, &auth, VERSION_DB).await?;
        let data = Self::manager(&host, port, &auth, DATA_DB).await?;

        let store = RedisStore { version, data };
        // Cheap liveness probe before anything relies on the store.
        let mut conn = store.version.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(store)
    }

    async fn manager(
        host: &str,
        port: u16,
        auth: &str,
        db: u8,
    ) -> Result<ConnectionManager, StoreError> {
        let client = redis::Client::open(connection_url(host, port, auth, db)).map_err(store_err)?;
        ConnectionManager::new(client).await.map_err(store_err)
    }

    /// Register this driver under its `redis` tag.
    pub fn register(registry: &mut StoreRegistry) {
        registry.register("redis", |settings: StoreSettings| {
            Box::pin(async move {
                let store = RedisStore::connect(&settings).await?;
                Ok(Arc::new(store) as Arc<dyn StoreDriver>)
            }) as DriverFuture
        });
    }

    async fn version_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.version.clone();
        let mut ids = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            ids.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl StoreDriver for RedisStore {
    fn tag(&self) -> &'static str {
        BACKEND
    }

    async fn list_versions(
        &self,
        version_id: Option<&str>,
    ) -> Result<Vec<VersionMeta>, StoreError> {
        let mut ids = self.version_ids().await?;
        if let Some(wanted) = version_id {
            ids.retain(|id| id == wanted);
        }
        let mut conn = self.version.clone();
        let mut versions = Vec::new();
        for id in ids {
            let fields: HashMap<String, String> =
                conn.hgetall(&id).await.map_err(store_err)?;
            let Some(created_at) = fields.get("UNIXTIME").and_then(|v| v.parse().ok()) else {
                continue;
            };
            let Some(master_release) = fields
                .get("MASTER_VERSION")
                .and_then(|v| Release::parse(v).ok())
            else {
                continue;
            };
            versions.push(VersionMeta {
                version_id: id,
                created_at,
                master_release,
                description: fields.get("DESCRIPTION").cloned().unwrap_or_default(),
            });
        }
        sort_versions(&mut versions);
        debug!(count = versions.len(), "listed versions");
        Ok(versions)
    }

    async fn put_version(&self, meta: &VersionMeta) -> Result<(), StoreError> {
        let mut conn = self.version.clone();
        let fields = [
            ("UNIXTIME", meta.created_at.to_string()),
            ("MASTER_VERSION", meta.master_release.to_string()),
            ("DESCRIPTION", meta.description.clone()),
        ];
        conn.hset_multiple::<_, _, _, ()>(&meta.version_id, &fields)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn get_records(&self, meta: &VersionMeta) -> Result<Vec<StoredRecord>, StoreError> {
        let mut conn = self.data.clone();
        let entries: HashMap<String, Vec<u8>> = conn
            .hgetall(&meta.version_id)
            .await
            .map_err(store_err)?;
        records_from_entries(&meta.version_id, entries)
    }

    async fn put_records(
        &self,
        meta: &VersionMeta,
        records: &[StoredRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut entries: Vec<(String, Vec<u8>)> = Vec::with_capacity(records.len());
        for record in records {
            entries.push((record.data_id.clone(), encode_record(record)?));
        }
        let mut conn = self.data.clone();
        conn.hset_multiple::<_, _, _, ()>(&meta.version_id, &entries)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn delete_version(&self, version_id: &str) -> Result<(), StoreError> {
        let mut version = self.version.clone();
        let mut data = self.data.clone();
        version
            .del::<_, ()>(version_id)
            .await
            .map_err(write_err)?;
        data.del::<_, ()>(version_id).await.map_err(write_err)?;
        Ok(())
    }

    async fn delete_record(&self, version_id: &str, data_id: &str) -> Result<(), StoreError> {
        let mut conn = self.data.clone();
        conn.hdel::<_, _, ()>(version_id, data_id)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn clear(&self, scope: ClearScope) -> Result<(), StoreError> {
        if matches!(scope, ClearScope::All | ClearScope::Versions) {
            let mut conn = self.version.clone();
            redis::cmd("FLUSHDB")
                .query_async::<()>(&mut conn)
                .await
                .map_err(write_err)?;
        }
        if matches!(scope, ClearScope::All | ClearScope::Data) {
            let mut conn = self.data.clone();
            redis::cmd("FLUSHDB")
                .query_async::<()>(&mut conn)
                .await
                .map_err(write_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> StoredRecord {
        StoredRecord {
            data_id: "d1".into(),
            kind: EntityKind::Host,
            name: "web1".into(),
            payload: json!({
                "host": "web1",
                "tags": [{"tag": "env", "value": "prod"}],
            }),
        }
    }

    #[test]
    fn connection_urls_cover_auth_and_db_index() {
        assert_eq!(
            connection_url("localhost", 6379, "", VERSION_DB),
            "redis://localhost:6379/0"
        );
        assert_eq!(
            connection_url("cache.internal", 6380, ":s3cret@", DATA_DB),
            "redis://:s3cret@cache.internal:6380/1"
        );
    }

    #[test]
    fn envelope_round_trips_a_record() {
        let record = sample_record();
        let body = encode_record(&record).unwrap();
        let back = decode_record("d1".into(), &body).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn envelope_round_trips_unicode_payloads() {
        let mut record = sample_record();
        record.name = "ホスト".into();
        record.payload = json!({"description": "日本語テキスト"});
        let body = encode_record(&record).unwrap();
        let back = decode_record("d1".into(), &body).unwrap();
        assert_eq!(back.name, "ホスト");
        assert_eq!(back.payload["description"], json!("日本語テキスト"));
    }

    #[test]
    fn garbage_bodies_are_codec_errors() {
        let err = decode_record("d1".into(), b"not bzip2").unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)), "got {err}");
    }

    #[test]
    fn incomplete_envelopes_are_corrupt() {
        for envelope in [
            json!({"NAME": "web1", "DATA": {}}),
            json!({"METHOD": "host", "DATA": {}}),
            json!({"METHOD": "host", "NAME": "web1"}),
            json!({"METHOD": "floppy", "NAME": "web1", "DATA": {}}),
        ] {
            let body = codec::encode(&envelope).unwrap();
            let err = decode_record("d1".into(), &body).unwrap_err();
            assert!(matches!(err, StoreError::Corrupt(_)), "got {err}");
        }
    }

    #[test]
    fn oversize_records_are_rejected_before_write() {
        let mut record = sample_record();
        // High-entropy hex so compression cannot pull the body back
        // under the cap.
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut blob = String::with_capacity(1_200_000);
        while blob.len() < 1_200_000 {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            blob.push_str(&format!("{state:016x}"));
        }
        record.payload = json!({"blob": blob});
        let err = encode_record(&record).unwrap_err();
        assert!(matches!(err, StoreError::RecordTooLarge { .. }), "got {err}");
    }

    #[test]
    fn empty_hashes_mean_a_missing_version() {
        let err = records_from_entries("v1", HashMap::new()).unwrap_err();
        match err {
            StoreError::MissingVersion(id) => assert_eq!(id, "v1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn entries_decode_into_records() {
        let record = sample_record();
        let mut entries = HashMap::new();
        entries.insert("d1".to_string(), encode_record(&record).unwrap());
        let records = records_from_entries("v1", entries).unwrap();
        assert_eq!(records, vec![record]);
    }

    #[test]
    fn singleton_records_keep_their_property_key() {
        let record = StoredRecord {
            data_id: "d2".into(),
            kind: EntityKind::Settings,
            name: "discovery_groupid".into(),
            payload: json!({"discovery_groupid": "5"}),
        };
        let body = encode_record(&record).unwrap();
        let back = decode_record("d2".into(), &body).unwrap();
        assert_eq!(back.kind, EntityKind::Settings);
        assert_eq!(back.name, "discovery_groupid");
        assert_eq!(back.payload, record.payload);
    }
}
