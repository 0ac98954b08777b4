//! Store-level behavior through the public API: round trips, listing
//! order, the visibility contract between records and version metadata.

use monclone::release::Release;
use monclone::snapshot::{Record, RecordSet, VersionMeta};
use monclone::store::{ClearScope, FileStore, MemoryStore, StoreDriver};
use monclone::EntityKind;
use serde_json::json;

fn sample_set() -> RecordSet {
    let mut set = RecordSet::new();
    set.push(Record::new(
        EntityKind::Host,
        "web1",
        json!({
            "host": "web1",
            "interfaces": [{"type": "AGENT", "ip": "10.0.0.1", "useip": "YES", "port": "10050"}],
            "tags": [{"tag": "MC_UUID", "value": "6a9c1f34-0d6e-4a1f-9c89-0b1a2c3d4e5f"}],
        }),
    ))
    .unwrap();
    set.push(Record::new(
        EntityKind::HostGroup,
        "Linux servers",
        json!({"name": "Linux servers"}),
    ))
    .unwrap();
    set.push(Record::new(
        EntityKind::Settings,
        "discovery_groupid",
        json!({"discovery_groupid": "5"}),
    ))
    .unwrap();
    set
}

#[tokio::test]
async fn file_store_round_trips_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    let meta = VersionMeta::create(Release::R6_4, "integration".into());

    let stored = sample_set().to_stored();
    store.put_records(&meta, &stored).await.unwrap();
    store.put_version(&meta).await.unwrap();

    let listed = store.list_versions(None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].version_id, meta.version_id);
    assert_eq!(listed[0].master_release, Release::R6_4);

    let records = store.get_records(&listed[0]).await.unwrap();
    let set = RecordSet::from_stored(records).unwrap();
    assert_eq!(set.record_count(), 3);
    assert_eq!(set.get(EntityKind::Host)[0].name, "web1");
    // The singleton record is keyed by its property sub-key.
    assert_eq!(set.get(EntityKind::Settings)[0].name, "discovery_groupid");
}

#[tokio::test]
async fn kind_name_uniqueness_survives_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    let meta = VersionMeta::create(Release::R6_0, String::new());

    // Hand-build a corrupt record set with a duplicate (kind, name).
    let mut stored = sample_set().to_stored();
    let mut duplicate = stored[0].clone();
    duplicate.data_id = "other".into();
    stored.push(duplicate);
    store.put_records(&meta, &stored).await.unwrap();

    let records = store.get_records(&meta).await.unwrap();
    assert!(RecordSet::from_stored(records).is_err());
}

#[tokio::test]
async fn memory_store_honors_the_write_protocol() {
    let store = MemoryStore::new();
    let meta = VersionMeta::create(Release::R7_0, String::new());

    // Records written but version not yet marked: invisible.
    store
        .put_records(&meta, &sample_set().to_stored())
        .await
        .unwrap();
    assert!(store.list_versions(None).await.unwrap().is_empty());

    store.put_version(&meta).await.unwrap();
    assert_eq!(store.list_versions(None).await.unwrap().len(), 1);

    store.clear(ClearScope::Versions).await.unwrap();
    assert!(store.list_versions(None).await.unwrap().is_empty());
    // Data scope untouched by a versions-only clear.
    assert!(store.get_records(&meta).await.is_ok());
}

#[tokio::test]
async fn version_filter_narrows_the_listing() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    for _ in 0..3 {
        let meta = VersionMeta::create(Release::R6_2, String::new());
        store.put_records(&meta, &[]).await.unwrap();
    }
    let all = store.list_versions(None).await.unwrap();
    assert_eq!(all.len(), 3);
    let one = store
        .list_versions(Some(&all[1].version_id))
        .await
        .unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].version_id, all[1].version_id);
}
