//! Sync commands - manual and scheduled syncs, reminders, scheduler loop

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use uuid::Uuid;

use super::{get_context, open_context};
use crate::output;
use bankfeed_core::services::{EntryPoint, Scheduler, SourceSyncResult, SourceSyncStatus};
use bankfeed_core::OperationResult;

pub fn run(source: Option<&str>, json: bool) -> Result<()> {
    match source {
        Some(source) => sync_one(source, json),
        None => sync_all(json),
    }
}

fn sync_one(source: &str, json: bool) -> Result<()> {
    let ctx = get_context("sync")?;
    let result = ctx.sync_service.sync_source(source);

    if json {
        let envelope: OperationResult<SourceSyncResult> = result.into();
        return output::json(&envelope);
    }

    let result = result?;
    let name = ctx.source_service.get(&result.source_id.to_string())?.name;
    print_result(&result, &name);
    Ok(())
}

fn sync_all(json: bool) -> Result<()> {
    let ctx = get_context("sync --scheduled")?;
    let summary = ctx.sync_service.run_scheduled()?;

    if json {
        return output::json(&summary);
    }

    if summary.results.is_empty() {
        output::warning("No connected sources. Link one with 'bf connect'.");
        return Ok(());
    }

    let names: HashMap<Uuid, String> = ctx
        .repository
        .list_sources()?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();
    for result in &summary.results {
        let name = names.get(&result.source_id).map(String::as_str).unwrap_or("(deleted source)");
        print_result(result, name);
    }
    println!();
    println!(
        "Synced {}, skipped {}, reauth required {}, failed {} ({} new transactions)",
        summary.synced, summary.skipped, summary.reauth_required, summary.failed, summary.imported
    );
    Ok(())
}

fn print_result(result: &SourceSyncResult, label: &str) {
    match result.status {
        SourceSyncStatus::Synced => {
            println!("{} {} ({})", "Synced:".green(), label, result.provider);
            if let (Some(from), Some(to)) = (result.window_from, result.window_to) {
                println!("  Window: {} to {}", from, to);
            }
            println!("  New: {}", result.counts.imported);
            println!("  Skipped: {} (already stored)", result.counts.skipped);
            if result.counts.errored > 0 {
                println!("  {} {}", "Errors:".red(), result.counts.errored);
            }
        }
        SourceSyncStatus::SkippedRecent => {
            println!("{} {} (synced recently)", "Skipped:".dimmed(), label);
        }
        SourceSyncStatus::SkippedInFlight => {
            println!("{} {} (sync already running)", "Skipped:".dimmed(), label);
        }
        SourceSyncStatus::ReauthRequired => {
            println!("{} {} - reconnect with 'bf connect'", "Reauth required:".yellow(), label);
        }
        SourceSyncStatus::Failed => {
            println!(
                "{} {} - {}",
                "Error:".red(),
                label,
                result.error.as_deref().unwrap_or("unknown error")
            );
            if let Some(secs) = result.retry_after_secs {
                println!("  Provider asked to retry after {}s", secs);
            }
        }
    }
}

pub fn reminders(json: bool) -> Result<()> {
    let ctx = get_context("reminders")?;
    let summary = ctx.sync_service.run_reminders()?;

    if json {
        return output::json(&summary);
    }
    println!(
        "Checked {} connection(s), sent {} reminder(s)",
        summary.checked,
        summary.reminded.len()
    );
    Ok(())
}

pub fn schedule(every_minutes: u64) -> Result<()> {
    let ctx = open_context("schedule", EntryPoint::Scheduler)?;
    let scheduler = Scheduler::new(Arc::clone(&ctx.sync_service), Duration::from_secs(every_minutes * 60));

    output::info(&format!("Running scheduled sync every {} minute(s). Press Ctrl-C to stop.", every_minutes));
    let runtime = tokio::runtime::Runtime::new()?;
    let ticks = runtime.block_on(scheduler.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }));
    println!("Stopped after {} run(s).", ticks);
    Ok(())
}
