//! Sources command - register and list sources

use anyhow::{anyhow, Result};
use clap::Subcommand;
use colored::Colorize;

use super::get_context;
use crate::output;
use bankfeed_core::SourceKind;

#[derive(Subcommand)]
pub enum SourcesCommands {
    /// List sources with their sync state
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Register a new source
    Add {
        /// Unique display name
        name: String,
        /// ISO 4217 currency code
        #[arg(long, default_value = "EUR")]
        currency: String,
        /// Account IBAN, used for deduplication
        #[arg(long)]
        iban: Option<String>,
        /// Source kind (csv, provider)
        #[arg(long, default_value = "csv")]
        kind: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget the CSV column mappings saved on a source
    ForgetMappings {
        /// Source name or id
        source: String,
    },
}

pub fn run(command: SourcesCommands) -> Result<()> {
    match command {
        SourcesCommands::List { json } => list(json),
        SourcesCommands::Add {
            name,
            currency,
            iban,
            kind,
            json,
        } => add(&name, &currency, iban.as_deref(), &kind, json),
        SourcesCommands::ForgetMappings { source } => forget_mappings(&source),
    }
}

fn list(json: bool) -> Result<()> {
    let ctx = get_context("sources list")?;
    let sources = ctx.source_service.list()?;

    if json {
        return output::json(&sources);
    }

    if sources.is_empty() {
        output::warning("No sources yet. Add one with 'bf sources add <name>'.");
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["Name", "Kind", "Currency", "Transactions", "Provider", "Status", "Last sync"]);
    for summary in &sources {
        table.add_row(vec![
            summary.source.name.clone(),
            summary.source.kind.to_string(),
            summary.source.currency.clone(),
            summary.transaction_count.to_string(),
            summary.provider.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            summary
                .connection_status
                .map(|s| output::connection_status(s).to_string())
                .unwrap_or_else(|| "-".to_string()),
            output::format_time(summary.last_sync_at),
        ]);
    }
    println!("{}", table);

    for summary in sources.iter().filter(|s| s.last_sync_error.is_some()) {
        println!(
            "{} {}: {}",
            "Last sync failed:".red(),
            summary.source.name,
            summary.last_sync_error.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

fn add(name: &str, currency: &str, iban: Option<&str>, kind: &str, json: bool) -> Result<()> {
    let kind: SourceKind = kind.parse().map_err(|e: String| anyhow!(e))?;
    let ctx = get_context("sources add")?;
    let source = ctx.source_service.create(name, kind, currency, iban)?;

    if json {
        return output::json(&source);
    }
    output::success(&format!("Created source '{}'", source.name));
    println!("  ID: {}", source.id);
    Ok(())
}

fn forget_mappings(source_ref: &str) -> Result<()> {
    let ctx = get_context("sources forget-mappings")?;
    let source = ctx.source_service.get(source_ref)?;
    if source.field_mappings.is_none() {
        println!("'{}' has no saved mappings.", source.name);
        return Ok(());
    }
    ctx.source_service.clear_field_mappings(source.id)?;
    output::success(&format!("Cleared saved mappings for '{}'", source.name));
    Ok(())
}

pub fn transactions(source_ref: &str, limit: usize, json: bool) -> Result<()> {
    let ctx = get_context("transactions")?;
    let source = ctx.source_service.get(source_ref)?;
    let transactions: Vec<_> = ctx
        .repository
        .get_transactions_by_source(source.id)?
        .into_iter()
        .take(limit)
        .collect();

    if json {
        return output::json(&transactions);
    }

    if transactions.is_empty() {
        println!("No transactions in '{}'.", source.name);
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["Date", "Amount", "Name", "Counterparty", "Reference"]);
    for tx in &transactions {
        let amount = output::money(tx.amount, &tx.currency);
        table.add_row(vec![
            tx.date.to_string(),
            if tx.amount < 0 { amount.red().to_string() } else { amount.green().to_string() },
            tx.name.clone(),
            tx.counterparty_name.clone().unwrap_or_default(),
            tx.reference.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", table);
    Ok(())
}
