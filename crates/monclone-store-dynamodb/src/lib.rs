//! DynamoDB version store for MonClone
//!
//! Persists snapshots in two tables:
//!
//! - `MC_VERSION` - partition key `VERSION_ID` (S), sort key `UNIXTIME`
//!   (N), attributes `MASTER_VERSION` (S), `DESCRIPTION` (S), `EXPIRE`
//!   (N, optional).
//! - `MC_DATA` - partition key `VERSION_ID` (S), sort key `DATA_ID` (S),
//!   attributes `METHOD` (S), `NAME` (S), `DATA` (B, bzip2-compressed
//!   JSON), `EXPIRE` (N, optional).
//!
//! Payload bodies are compressed and capped at 400 KiB per item. Writes
//! go out in batches with a cooperative sleep between bursts to stay
//! inside provisioned throughput; deletion is lazy - items get an
//! `EXPIRE` stamp one hour ahead and the table's TTL collects them.
//!
//! # Table creation
//!
//! ```bash
//! aws dynamodb create-table \
//!   --table-name MC_VERSION \
//!   --attribute-definitions \
//!     AttributeName=VERSION_ID,AttributeType=S \
//!     AttributeName=UNIXTIME,AttributeType=N \
//!   --key-schema \
//!     AttributeName=VERSION_ID,KeyType=HASH \
//!     AttributeName=UNIXTIME,KeyType=RANGE \
//!   --billing-mode PAY_PER_REQUEST
//! ```
//!
//! # See Also
//!
//! - [`StoreDriver`] - The trait this implements
//! - [`monclone-store-redis`](https://docs.rs/monclone-store-redis) - Alternative: Redis-based store

use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, PutRequest, WriteRequest};
use aws_sdk_dynamodb::Client as DynamoDbClient;
use monclone::codec;
use monclone::release::Release;
use monclone::snapshot::{StoredRecord, VersionMeta};
use monclone::store::{sort_versions, ClearScope, DriverFuture, StoreDriver, StoreRegistry};
use monclone::{StoreError, StoreSettings};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const BACKEND: &str = "dydb";
const VERSION_TABLE: &str = "MC_VERSION";
const DATA_TABLE: &str = "MC_DATA";
/// Lazy deletes expire one hour after the request.
const EXPIRE_GRACE_SECS: i64 = 3600;
/// DynamoDB batch-write hard limit.
const BATCH_WRITE_MAX: usize = 25;

fn store_err(reason: impl std::fmt::Display) -> StoreError {
    StoreError::Connection {
        backend: BACKEND.to_string(),
        reason: reason.to_string(),
    }
}

fn write_err(reason: impl std::fmt::Display) -> StoreError {
    StoreError::Write {
        backend: BACKEND.to_string(),
        reason: reason.to_string(),
    }
}

/// DynamoDB-backed version store.
pub struct DynamoDbStore {
    client: DynamoDbClient,
    batch_limit: usize,
    batch_wait: u64,
}

impl DynamoDbStore {
    /// Build a store from resolved settings. Explicit credentials take
    /// precedence; otherwise the ambient AWS environment (profile, IMDS,
    /// env vars) applies.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = settings.endpoint.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let (Some(access), Some(secret)) = (&settings.access, &settings.credential) {
            loader = loader.credentials_provider(aws_sdk_dynamodb::config::Credentials::new(
                access.clone(),
                secret.clone(),
                None,
                None,
                "monclone-config",
            ));
        }
        let config = loader.load().await;
        let client = DynamoDbClient::new(&config);

        let store = DynamoDbStore {
            client,
            batch_limit: settings.batch_limit.max(1),
            batch_wait: settings.batch_wait,
        };
        store.check_table(VERSION_TABLE).await?;
        store.check_table(DATA_TABLE).await?;
        Ok(store)
    }

    /// Register this driver under its `dydb` tag.
    pub fn register(registry: &mut StoreRegistry) {
        registry.register("dydb", |settings: StoreSettings| {
            Box::pin(async move {
                let store = DynamoDbStore::connect(&settings).await?;
                Ok(Arc::new(store) as Arc<dyn StoreDriver>)
            }) as DriverFuture
        });
    }

    async fn check_table(&self, table: &str) -> Result<(), StoreError> {
        let described = self
            .client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| store_err(format!("table {table}: {e}")))?;
        let status = described
            .table()
            .and_then(|t| t.table_status())
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        if status != "ACTIVE" {
            return Err(store_err(format!("table {table} is not active ({status})")));
        }
        Ok(())
    }

    /// Paged scan of a whole table.
    async fn scan_all(
        &self,
        table: &str,
        projection: Option<&str>,
    ) -> Result<Vec<HashMap<String, AttributeValue>>, StoreError> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let mut request = self.client.scan().table_name(table);
            if let Some(projection) = projection {
                request = request.projection_expression(projection);
            }
            if let Some(key) = start_key {
                request = request.set_exclusive_start_key(Some(key));
            }
            let page = request
                .send()
                .await
                .map_err(|e| store_err(format!("scan {table}: {e}")))?;
            items.extend(page.items().to_vec());
            match page.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Paged query of one partition.
    async fn query_version(
        &self,
        table: &str,
        version_id: &str,
    ) -> Result<Vec<HashMap<String, AttributeValue>>, StoreError> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let mut request = self
                .client
                .query()
                .table_name(table)
                .key_condition_expression("VERSION_ID = :version")
                .expression_attribute_values(
                    ":version",
                    AttributeValue::S(version_id.to_string()),
                );
            if let Some(key) = start_key {
                request = request.set_exclusive_start_key(Some(key));
            }
            let page = request
                .send()
                .await
                .map_err(|e| store_err(format!("query {table}: {e}")))?;
            items.extend(page.items().to_vec());
            match page.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Batch-write with throughput pacing: after every `batch_limit`
    /// items the writer sleeps `batch_wait` seconds.
    async fn write_paced(&self, table: &str, requests: Vec<WriteRequest>) -> Result<(), StoreError> {
        let mut since_pause = 0usize;
        for chunk in requests.chunks(BATCH_WRITE_MAX.min(self.batch_limit)) {
            self.client
                .batch_write_item()
                .request_items(table, chunk.to_vec())
                .send()
                .await
                .map_err(|e| write_err(format!("batch write {table}: {e}")))?;
            since_pause += chunk.len();
            if since_pause >= self.batch_limit {
                tokio::time::sleep(Duration::from_secs(self.batch_wait)).await;
                since_pause = 0;
            }
        }
        Ok(())
    }

    fn attr_s(item: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
        item.get(key).and_then(|v| v.as_s().ok()).cloned()
    }

    fn attr_n(item: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
        item.get(key)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse().ok())
    }

    fn parse_version(item: &HashMap<String, AttributeValue>) -> Option<VersionMeta> {
        Some(VersionMeta {
            version_id: Self::attr_s(item, "VERSION_ID")?,
            created_at: Self::attr_n(item, "UNIXTIME")?,
            master_release: Release::parse(&Self::attr_s(item, "MASTER_VERSION")?).ok()?,
            description: Self::attr_s(item, "DESCRIPTION").unwrap_or_default(),
        })
    }

    /// Stamp items of one version with an EXPIRE attribute; the table
    /// TTL does the actual deletion.
    async fn expire_items(
        &self,
        table: &str,
        sort_key: &str,
        version_id: &str,
        only_data_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let expire = chrono_now() + EXPIRE_GRACE_SECS;
        let items = self.query_version(table, version_id).await?;
        for item in items {
            let Some(sort_value) = item.get(sort_key) else {
                continue;
            };
            if let Some(data_id) = only_data_id {
                if Self::attr_s(&item, sort_key).as_deref() != Some(data_id) {
                    continue;
                }
            }
            self.client
                .update_item()
                .table_name(table)
                .key("VERSION_ID", AttributeValue::S(version_id.to_string()))
                .key(sort_key, sort_value.clone())
                .update_expression("SET #expire = :expire")
                .expression_attribute_names("#expire", "EXPIRE")
                .expression_attribute_values(":expire", AttributeValue::N(expire.to_string()))
                .send()
                .await
                .map_err(|e| write_err(format!("expire {table}: {e}")))?;
        }
        Ok(())
    }
}

fn chrono_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl StoreDriver for DynamoDbStore {
    fn tag(&self) -> &'static str {
        BACKEND
    }

    async fn list_versions(
        &self,
        version_id: Option<&str>,
    ) -> Result<Vec<VersionMeta>, StoreError> {
        let items = self.scan_all(VERSION_TABLE, None).await?;
        let mut versions: Vec<VersionMeta> = items
            .iter()
            .filter(|item| Self::attr_n(item, "EXPIRE").is_none())
            .filter_map(Self::parse_version)
            .filter(|meta| version_id.map_or(true, |id| meta.version_id == id))
            .collect();
        sort_versions(&mut versions);
        debug!(count = versions.len(), "listed versions");
        Ok(versions)
    }

    async fn put_version(&self, meta: &VersionMeta) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(VERSION_TABLE)
            .item("VERSION_ID", AttributeValue::S(meta.version_id.clone()))
            .item("UNIXTIME", AttributeValue::N(meta.created_at.to_string()))
            .item(
                "MASTER_VERSION",
                AttributeValue::S(meta.master_release.to_string()),
            )
            .item("DESCRIPTION", AttributeValue::S(meta.description.clone()))
            .send()
            .await
            .map_err(|e| write_err(format!("put version: {e}")))?;
        Ok(())
    }

    async fn get_records(&self, meta: &VersionMeta) -> Result<Vec<StoredRecord>, StoreError> {
        let items = self.query_version(DATA_TABLE, &meta.version_id).await?;
        if items.is_empty() {
            return Err(StoreError::MissingVersion(meta.version_id.clone()));
        }
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let data_id = Self::attr_s(&item, "DATA_ID")
                .ok_or_else(|| StoreError::Corrupt("record without DATA_ID".into()))?;
            let kind_text = Self::attr_s(&item, "METHOD")
                .ok_or_else(|| StoreError::Corrupt(format!("record {data_id} without METHOD")))?;
            let kind = monclone::EntityKind::from_api_method(&kind_text)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown kind {kind_text}")))?;
            let name = Self::attr_s(&item, "NAME")
                .ok_or_else(|| StoreError::Corrupt(format!("record {data_id} without NAME")))?;
            let body = item
                .get("DATA")
                .and_then(|v| v.as_b().ok())
                .ok_or_else(|| StoreError::Corrupt(format!("record {data_id} without DATA")))?;
            let payload = codec::decode(body.as_ref())?;
            records.push(StoredRecord {
                data_id,
                kind,
                name,
                payload,
            });
        }
        Ok(records)
    }

    async fn put_records(
        &self,
        meta: &VersionMeta,
        records: &[StoredRecord],
    ) -> Result<(), StoreError> {
        let mut requests = Vec::with_capacity(records.len());
        for record in records {
            let body = codec::encode(&record.payload)?;
            codec::check_record_size(&format!("{}/{}", record.kind, record.name), &body)?;
            let put = PutRequest::builder()
                .item("VERSION_ID", AttributeValue::S(meta.version_id.clone()))
                .item("DATA_ID", AttributeValue::S(record.data_id.clone()))
                .item("METHOD", AttributeValue::S(record.kind.to_string()))
                .item("NAME", AttributeValue::S(record.name.clone()))
                .item("DATA", AttributeValue::B(body.into()))
                .build()
                .map_err(|e| write_err(format!("build put request: {e}")))?;
            requests.push(WriteRequest::builder().put_request(put).build());
        }
        self.write_paced(DATA_TABLE, requests).await
    }

    async fn delete_version(&self, version_id: &str) -> Result<(), StoreError> {
        self.expire_items(VERSION_TABLE, "UNIXTIME", version_id, None)
            .await?;
        self.expire_items(DATA_TABLE, "DATA_ID", version_id, None)
            .await
    }

    async fn delete_record(&self, version_id: &str, data_id: &str) -> Result<(), StoreError> {
        self.expire_items(DATA_TABLE, "DATA_ID", version_id, Some(data_id))
            .await
    }

    async fn clear(&self, scope: ClearScope) -> Result<(), StoreError> {
        let tables: &[(&str, &str)] = match scope {
            ClearScope::All => &[(VERSION_TABLE, "UNIXTIME"), (DATA_TABLE, "DATA_ID")],
            ClearScope::Versions => &[(VERSION_TABLE, "UNIXTIME")],
            ClearScope::Data => &[(DATA_TABLE, "DATA_ID")],
        };
        for (table, sort_key) in tables {
            let projection = format!("VERSION_ID, {sort_key}");
            let items = self.scan_all(table, Some(&projection)).await?;
            let requests: Vec<WriteRequest> = items
                .into_iter()
                .filter_map(|item| {
                    let partition = item.get("VERSION_ID")?.clone();
                    let sort = item.get(*sort_key)?.clone();
                    let delete = DeleteRequest::builder()
                        .key("VERSION_ID", partition)
                        .key(*sort_key, sort)
                        .build()
                        .ok()?;
                    Some(WriteRequest::builder().delete_request(delete).build())
                })
                .collect();
            self.write_paced(table, requests).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_item(
        id: &str,
        unixtime: &str,
        release: &str,
        description: &str,
    ) -> HashMap<String, AttributeValue> {
        let mut item = HashMap::new();
        item.insert("VERSION_ID".to_string(), AttributeValue::S(id.to_string()));
        item.insert(
            "UNIXTIME".to_string(),
            AttributeValue::N(unixtime.to_string()),
        );
        item.insert(
            "MASTER_VERSION".to_string(),
            AttributeValue::S(release.to_string()),
        );
        item.insert(
            "DESCRIPTION".to_string(),
            AttributeValue::S(description.to_string()),
        );
        item
    }

    #[test]
    fn attr_s_reads_strings_only() {
        let item = version_item("v1", "1700000000", "6.4", "snap");
        assert_eq!(
            DynamoDbStore::attr_s(&item, "VERSION_ID").as_deref(),
            Some("v1")
        );
        // Number attributes are not strings.
        assert_eq!(DynamoDbStore::attr_s(&item, "UNIXTIME"), None);
        assert_eq!(DynamoDbStore::attr_s(&item, "NO_SUCH_KEY"), None);
    }

    #[test]
    fn attr_n_parses_numbers_and_rejects_garbage() {
        let mut item = version_item("v1", "1700000000", "6.4", "");
        assert_eq!(DynamoDbStore::attr_n(&item, "UNIXTIME"), Some(1_700_000_000));
        // String attributes are not numbers, and N bodies are free text
        // until parsed.
        assert_eq!(DynamoDbStore::attr_n(&item, "VERSION_ID"), None);
        item.insert(
            "UNIXTIME".to_string(),
            AttributeValue::N("not-a-number".to_string()),
        );
        assert_eq!(DynamoDbStore::attr_n(&item, "UNIXTIME"), None);
        assert_eq!(DynamoDbStore::attr_n(&item, "NO_SUCH_KEY"), None);
    }

    #[test]
    fn attr_n_handles_large_timestamps() {
        let item = version_item("v1", "253402300799", "6.4", "");
        assert_eq!(
            DynamoDbStore::attr_n(&item, "UNIXTIME"),
            Some(253_402_300_799)
        );
    }

    #[test]
    fn parse_version_round_trips_a_full_item() {
        let item = version_item(
            "6a9c1f34-0d6e-4a1f-9c89-0b1a2c3d4e5f",
            "1700000000",
            "6.4",
            "MasterNode: primary",
        );
        let meta = DynamoDbStore::parse_version(&item).unwrap();
        assert_eq!(meta.version_id, "6a9c1f34-0d6e-4a1f-9c89-0b1a2c3d4e5f");
        assert_eq!(meta.created_at, 1_700_000_000);
        assert_eq!(meta.master_release, Release::parse("6.4").unwrap());
        assert_eq!(meta.description, "MasterNode: primary");
    }

    #[test]
    fn parse_version_requires_id_time_and_release() {
        for missing in ["VERSION_ID", "UNIXTIME", "MASTER_VERSION"] {
            let mut item = version_item("v1", "1700000000", "6.4", "");
            item.remove(missing);
            assert!(
                DynamoDbStore::parse_version(&item).is_none(),
                "{missing} must be required"
            );
        }
        // An unparsable release is as bad as a missing one.
        let item = version_item("v1", "1700000000", "banana", "");
        assert!(DynamoDbStore::parse_version(&item).is_none());
    }

    #[test]
    fn parse_version_tolerates_a_missing_description() {
        let mut item = version_item("v1", "1700000000", "7.0", "");
        item.remove("DESCRIPTION");
        let meta = DynamoDbStore::parse_version(&item).unwrap();
        assert_eq!(meta.description, "");
    }

    #[test]
    fn parse_version_keeps_unicode_descriptions() {
        let item = version_item("v1", "1700000000", "6.0", "移行スナップショット");
        let meta = DynamoDbStore::parse_version(&item).unwrap();
        assert_eq!(meta.description, "移行スナップショット");
    }

    #[test]
    fn error_helpers_tag_the_backend() {
        match store_err("table gone") {
            StoreError::Connection { backend, reason } => {
                assert_eq!(backend, BACKEND);
                assert_eq!(reason, "table gone");
            }
            other => panic!("unexpected error: {other}"),
        }
        match write_err("throttled") {
            StoreError::Write { backend, .. } => assert_eq!(backend, BACKEND),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn chrono_now_is_a_sane_unix_time() {
        let now = chrono_now();
        // After 2020-01-01 and not in the far future.
        assert!(now > 1_577_836_800, "now = {now}");
        assert!(now < 4_102_444_800, "now = {now}");
    }
}
