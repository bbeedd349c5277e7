//! Notifications command - show and acknowledge queued sync events

use std::collections::HashMap;

use anyhow::Result;
use colored::Colorize;
use uuid::Uuid;

use super::get_context;
use crate::output;
use bankfeed_core::EventKind;

fn kind_label(kind: EventKind) -> String {
    match kind {
        EventKind::NewTransactions => kind.as_str().green().to_string(),
        EventKind::SyncFailed => kind.as_str().red().to_string(),
        EventKind::ReauthRequired | EventKind::ReauthReminder => kind.as_str().yellow().to_string(),
    }
}

pub fn run(all: bool, ack: bool, limit: usize, json: bool) -> Result<()> {
    let ctx = get_context("notifications")?;
    let events = ctx.repository.list_notifications(!all, limit)?;

    if json {
        output::json(&events)?;
    } else if events.is_empty() {
        println!("No pending notifications.");
    } else {
        let names: HashMap<Uuid, String> = ctx
            .repository
            .list_sources()?
            .into_iter()
            .map(|s| (s.id, s.name))
            .collect();

        let mut table = output::create_table();
        table.set_header(vec!["Time", "Type", "Source", "Message", "Details"]);
        for event in &events {
            let details = match (event.imported, event.skipped, event.days_remaining) {
                (Some(imported), Some(skipped), _) => format!("{} new, {} skipped", imported, skipped),
                (_, _, Some(days)) => format!("{} days left", days),
                _ => String::new(),
            };
            table.add_row(vec![
                output::format_time(Some(event.created_at)),
                kind_label(event.kind),
                names.get(&event.source_id).cloned().unwrap_or_else(|| event.source_id.to_string()),
                event.message.clone(),
                details,
            ]);
        }
        println!("{}", table);
    }

    if ack {
        let marked = ctx.repository.mark_notifications_delivered()?;
        if !json {
            println!("Marked {} notification(s) as delivered.", marked);
        }
    }
    Ok(())
}
