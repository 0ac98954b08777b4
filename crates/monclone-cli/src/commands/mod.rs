pub mod clone;
pub mod data;
pub mod versions;

use anyhow::Result;
use monclone::{Settings, StoreDriver, StoreRegistry};
use std::sync::Arc;

/// The registry with every bundled backend attached.
pub fn registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();
    monclone_store_dynamodb::DynamoDbStore::register(&mut registry);
    monclone_store_redis::RedisStore::register(&mut registry);
    registry
}

/// Open the store the settings select. `direct` has no store of its own;
/// callers handle it before getting here.
pub async fn open_store(settings: &Settings) -> Result<Arc<dyn StoreDriver>> {
    let store = registry()
        .open(&settings.store.store_type, settings.store.clone())
        .await
        .map_err(monclone::Error::from)?;
    Ok(store)
}
