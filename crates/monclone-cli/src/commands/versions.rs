//! The `showversions` subcommand.

use crate::output;
use anyhow::{bail, Result};
use monclone::Settings;
use serde_json::json;

pub async fn run(settings: Settings, id_only: bool) -> Result<i32> {
    if settings.store.store_type == "direct" {
        bail!("direct mode has no stored versions to show");
    }
    let store = super::open_store(&settings).await?;
    let versions = store
        .list_versions(None)
        .await
        .map_err(monclone::Error::from)?;

    output::print_heading("In-store versions:");
    for meta in versions {
        if id_only {
            println!("    {}: {}", meta.version_id, meta.created_at);
        } else {
            output::print_block(&json!({
                "version_id": meta.version_id,
                "created_at": meta.created_at,
                "master_release": meta.master_release,
                "description": meta.description,
            }));
        }
    }
    Ok(0)
}
