//! The `showdata` subcommand.

use crate::output;
use anyhow::{bail, Result};
use monclone::Settings;
use serde_json::json;
use std::collections::BTreeMap;

pub async fn run(
    settings: Settings,
    kinds: Vec<String>,
    names: Vec<String>,
    id_only: bool,
) -> Result<i32> {
    if settings.store.store_type == "direct" {
        bail!("direct mode has no stored versions to show");
    }
    let Some(version) = settings.target_version.clone() else {
        bail!("showdata requires --version");
    };

    let store = super::open_store(&settings).await?;
    let meta = store
        .list_versions(Some(&version))
        .await
        .map_err(monclone::Error::from)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("version {version} is not in the store"))?;
    let records = store
        .get_records(&meta)
        .await
        .map_err(monclone::Error::from)?;

    let mut grouped: BTreeMap<String, Vec<monclone::StoredRecord>> = BTreeMap::new();
    for record in records {
        grouped
            .entry(record.kind.to_string())
            .or_default()
            .push(record);
    }

    for (kind, mut records) in grouped {
        if !kinds.is_empty() && !kinds.contains(&kind) {
            continue;
        }
        output::print_heading(&format!("{kind}:"));
        records.sort_by(|a, b| a.name.cmp(&b.name));
        for record in records {
            if !names.is_empty() && !names.contains(&record.name) {
                continue;
            }
            if id_only {
                println!("    {}: {}", record.data_id, record.name);
            } else {
                output::print_block(&json!({
                    "data_id": record.data_id,
                    "kind": record.kind,
                    "name": record.name,
                    "payload": record.payload,
                }));
            }
        }
    }
    Ok(0)
}
