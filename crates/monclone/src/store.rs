//! The pluggable version store.
//!
//! A store holds immutable versions: a metadata row per version and the
//! record set behind it. The engine only ever talks to [`StoreDriver`];
//! the file and in-memory drivers live here, the DynamoDB and Redis
//! drivers in their own crates, and anything else can be plugged in
//! through [`StoreRegistry`] under its own type tag.
//!
//! Write protocol: `put_records` first, `put_version` after. A version
//! whose record write failed is never listed, so readers cannot observe a
//! partial snapshot.

use crate::codec;
use crate::config::StoreSettings;
use crate::error::StoreError;
use crate::release::Release;
use crate::snapshot::{StoredRecord, VersionMeta};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// What [`StoreDriver::clear`] wipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    All,
    Versions,
    Data,
}

/// Uniform interface over the version store.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Short type tag of the driver (`file`, `dydb`, `redis`, …).
    fn tag(&self) -> &'static str;

    /// All versions, newest first; optionally filtered to one version id.
    async fn list_versions(&self, version_id: Option<&str>)
        -> Result<Vec<VersionMeta>, StoreError>;

    /// Record a version's metadata. Call only after `put_records`
    /// succeeded for the same version.
    async fn put_version(&self, meta: &VersionMeta) -> Result<(), StoreError>;

    /// The full record set of a version.
    async fn get_records(&self, meta: &VersionMeta) -> Result<Vec<StoredRecord>, StoreError>;

    /// Write a version's record set. Atomic at the record-set level: on
    /// failure the caller must not `put_version`.
    async fn put_records(
        &self,
        meta: &VersionMeta,
        records: &[StoredRecord],
    ) -> Result<(), StoreError>;

    /// Delete one version. May be lazy (tombstone + TTL) on backends that
    /// support expiry.
    async fn delete_version(&self, version_id: &str) -> Result<(), StoreError>;

    /// Delete one record of a version. May be lazy like `delete_version`.
    async fn delete_record(&self, version_id: &str, data_id: &str) -> Result<(), StoreError>;

    /// Wipe the store.
    async fn clear(&self, scope: ClearScope) -> Result<(), StoreError>;
}

impl std::fmt::Debug for dyn StoreDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn StoreDriver").field("tag", &self.tag()).finish()
    }
}

/// Sort newest-first, the order every driver must return.
pub fn sort_versions(versions: &mut [VersionMeta]) {
    versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

// ----------------------------------------------------------------------
// File store
// ----------------------------------------------------------------------

/// One compressed file per version:
/// `{versionId}_{createdAt}_{masterRelease}.bz`, body is the marshalled
/// record set. Listing the directory is listing versions, so there is no
/// separate metadata write.
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        FileStore {
            directory: directory.into(),
        }
    }

    /// Platform default directory.
    pub fn default_dir() -> PathBuf {
        if cfg!(windows) {
            let profile = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
            Path::new(&profile).join("Documents").join("monclone")
        } else {
            PathBuf::from("/var/lib/monclone")
        }
    }

    fn file_name(meta: &VersionMeta) -> String {
        format!(
            "{}_{}_{}.bz",
            meta.version_id, meta.created_at, meta.master_release
        )
    }

    fn parse_file_name(name: &str) -> Option<VersionMeta> {
        let stem = name.strip_suffix(".bz")?;
        let mut parts = stem.splitn(3, '_');
        let version_id = parts.next()?.to_string();
        let created_at = parts.next()?.parse::<i64>().ok()?;
        let master_release = Release::parse(parts.next()?).ok()?;
        Some(VersionMeta {
            version_id,
            created_at,
            master_release,
            description: format!("Import file {name}"),
        })
    }

    async fn scan(&self) -> Result<Vec<VersionMeta>, StoreError> {
        let mut versions = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(StoreError::Io(e)),
        };
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(meta) = entry
                .file_name()
                .to_str()
                .and_then(FileStore::parse_file_name)
            {
                versions.push(meta);
            }
        }
        Ok(versions)
    }

    async fn path_for(&self, version_id: &str) -> Result<Option<PathBuf>, StoreError> {
        for meta in self.scan().await? {
            if meta.version_id == version_id {
                return Ok(Some(self.directory.join(FileStore::file_name(&meta))));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl StoreDriver for FileStore {
    fn tag(&self) -> &'static str {
        "file"
    }

    async fn list_versions(
        &self,
        version_id: Option<&str>,
    ) -> Result<Vec<VersionMeta>, StoreError> {
        let mut versions = self.scan().await?;
        if let Some(id) = version_id {
            versions.retain(|meta| meta.version_id == id);
        }
        sort_versions(&mut versions);
        Ok(versions)
    }

    async fn put_version(&self, _meta: &VersionMeta) -> Result<(), StoreError> {
        // The file written by put_records already carries the metadata in
        // its name.
        Ok(())
    }

    async fn get_records(&self, meta: &VersionMeta) -> Result<Vec<StoredRecord>, StoreError> {
        let path = self.directory.join(FileStore::file_name(meta));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingVersion(meta.version_id.clone()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        codec::decode(&bytes)
    }

    async fn put_records(
        &self,
        meta: &VersionMeta,
        records: &[StoredRecord],
    ) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let bytes = codec::encode(&records)?;
        let path = self.directory.join(FileStore::file_name(meta));
        // Write to a temp name and rename so a crash never leaves a
        // half-written version visible to directory listings.
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn delete_version(&self, version_id: &str) -> Result<(), StoreError> {
        match self.path_for(version_id).await? {
            Some(path) => Ok(tokio::fs::remove_file(path).await?),
            None => Err(StoreError::MissingVersion(version_id.to_string())),
        }
    }

    async fn delete_record(&self, version_id: &str, data_id: &str) -> Result<(), StoreError> {
        let path = self
            .path_for(version_id)
            .await?
            .ok_or_else(|| StoreError::MissingVersion(version_id.to_string()))?;
        let bytes = tokio::fs::read(&path).await?;
        let mut records: Vec<StoredRecord> = codec::decode(&bytes)?;
        records.retain(|record| record.data_id != data_id);
        let bytes = codec::encode(&records)?;
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn clear(&self, _scope: ClearScope) -> Result<(), StoreError> {
        // Metadata and records share one file, so every scope clears the
        // whole directory.
        for meta in self.scan().await? {
            let path = self.directory.join(FileStore::file_name(&meta));
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// In-process store
// ----------------------------------------------------------------------

/// In-process store. Backs tests and the direct master path, where the
/// worker reads straight out of the master's export buffer.
#[derive(Default)]
pub struct MemoryStore {
    versions: Mutex<BTreeMap<String, VersionMeta>>,
    data: Mutex<BTreeMap<String, Vec<StoredRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreDriver for MemoryStore {
    fn tag(&self) -> &'static str {
        "memory"
    }

    async fn list_versions(
        &self,
        version_id: Option<&str>,
    ) -> Result<Vec<VersionMeta>, StoreError> {
        let versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        let mut listed: Vec<VersionMeta> = versions
            .values()
            .filter(|meta| version_id.map_or(true, |id| meta.version_id == id))
            .cloned()
            .collect();
        sort_versions(&mut listed);
        Ok(listed)
    }

    async fn put_version(&self, meta: &VersionMeta) -> Result<(), StoreError> {
        let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        versions.insert(meta.version_id.clone(), meta.clone());
        Ok(())
    }

    async fn get_records(&self, meta: &VersionMeta) -> Result<Vec<StoredRecord>, StoreError> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.get(&meta.version_id)
            .cloned()
            .ok_or_else(|| StoreError::MissingVersion(meta.version_id.clone()))
    }

    async fn put_records(
        &self,
        meta: &VersionMeta,
        records: &[StoredRecord],
    ) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.insert(meta.version_id.clone(), records.to_vec());
        Ok(())
    }

    async fn delete_version(&self, version_id: &str) -> Result<(), StoreError> {
        let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        versions.remove(version_id);
        data.remove(version_id);
        Ok(())
    }

    async fn delete_record(&self, version_id: &str, data_id: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(records) = data.get_mut(version_id) {
            records.retain(|record| record.data_id != data_id);
        }
        Ok(())
    }

    async fn clear(&self, scope: ClearScope) -> Result<(), StoreError> {
        if matches!(scope, ClearScope::All | ClearScope::Versions) {
            self.versions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
        if matches!(scope, ClearScope::All | ClearScope::Data) {
            self.data.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Driver registry
// ----------------------------------------------------------------------

/// Boxed future returned by a [`DriverFactory`].
pub type DriverFuture =
    Pin<Box<dyn Future<Output = Result<Arc<dyn StoreDriver>, StoreError>> + Send>>;

/// Async constructor for one driver tag.
pub type DriverFactory = Box<dyn Fn(StoreSettings) -> DriverFuture + Send + Sync>;

/// Maps a store type tag to its driver constructor.
///
/// `file` is built in; the bundled backend crates register `dydb` and
/// `redis`, and external crates can register their own tags the same way.
pub struct StoreRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreRegistry {
    pub fn new() -> Self {
        let mut registry = StoreRegistry {
            factories: BTreeMap::new(),
        };
        registry.register("file", |settings: StoreSettings| {
            Box::pin(async move {
                let directory = settings
                    .endpoint
                    .map(PathBuf::from)
                    .unwrap_or_else(FileStore::default_dir);
                Ok(Arc::new(FileStore::new(directory)) as Arc<dyn StoreDriver>)
            }) as DriverFuture
        });
        registry
    }

    /// Register (or replace) the constructor for a tag.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(StoreSettings) -> DriverFuture + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Box::new(factory));
    }

    /// Open a driver by tag.
    pub async fn open(
        &self,
        tag: &str,
        settings: StoreSettings,
    ) -> Result<Arc<dyn StoreDriver>, StoreError> {
        match self.factories.get(tag) {
            Some(factory) => factory(settings).await,
            None => Err(StoreError::UnknownDriver {
                tag: tag.to_string(),
                known: self
                    .factories
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}
