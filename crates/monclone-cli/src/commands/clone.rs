//! The `clone` subcommand: one full master or worker run.

use crate::output;
use anyhow::Result;
use monclone::{
    ConsolePresenter, MemoryStore, Orchestrator, Presenter, Role, Settings, StoreDriver,
};
use std::io::IsTerminal;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub async fn run(settings: Settings) -> Result<i32> {
    let presenter: Arc<dyn Presenter> = Arc::new(ConsolePresenter::new(settings.quiet));

    // A worker run rewrites the node; give an interactive operator one
    // chance to bail out.
    if settings.role != Role::Master && !settings.assume_yes && !settings.quiet && !confirm(&settings)
    {
        println!("aborted");
        return Ok(0);
    }

    let store: Arc<dyn StoreDriver> = if settings.store.store_type == "direct" {
        // Direct mode: run the master side first, snapshotting straight
        // into an in-process buffer the worker then reads.
        let buffer: Arc<dyn StoreDriver> = Arc::new(MemoryStore::new());
        let master_settings = settings
            .for_direct_master()
            .map_err(monclone::Error::from)?;
        let master =
            Orchestrator::connect(master_settings, Arc::clone(&buffer), Arc::clone(&presenter))
                .await?;
        master.run().await?;
        buffer
    } else {
        super::open_store(&settings).await?
    };

    let orchestrator = Orchestrator::connect(settings, store, presenter).await?;

    // A second interrupt kills the process; the first one stops the run
    // at the next section boundary.
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping at the next section boundary");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let report = orchestrator.run().await?;

    if let Some(version) = &report.version_id {
        println!("applied version: {version}");
    }
    if let Some(hosts) = &report.hosts {
        println!(
            "hosts: {} created / {} updated / {} failed / {} deleted",
            hosts.created, hosts.updated, hosts.failed, hosts.hosts_deleted
        );
    }
    if let Some(templates) = &report.templates {
        println!(
            "templates: {} imported / {} failed",
            templates.template_success, templates.template_failed
        );
    }
    output::print_failures(&report.record_failures);

    // Per-record failures are reported, not fatal.
    Ok(0)
}

fn confirm(settings: &Settings) -> bool {
    if !std::io::stdin().is_terminal() {
        return true;
    }
    println!(
        "About to clone onto {} ({}) as {}. Continue? [y/N]",
        settings.node,
        settings.endpoint,
        settings.role.as_str()
    );
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes" | "YES")
}
