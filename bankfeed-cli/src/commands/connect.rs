//! Connection commands - institutions, connect, callback, status, disconnect

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use dialoguer::Confirm;
use uuid::Uuid;

use super::{get_context, is_interactive};
use crate::output;
use bankfeed_core::domain::AccountKind;
use bankfeed_core::ports::CallbackParams;
use bankfeed_core::ProviderId;

pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:8765/callback";

pub fn institutions(country: &str, json: bool) -> Result<()> {
    let ctx = get_context("institutions")?;
    if ctx.registry.for_country(country).is_empty() {
        output::warning(&format!(
            "No configured provider covers '{}'. Add provider credentials to settings.json.",
            country.to_uppercase()
        ));
        return Ok(());
    }

    let institutions = ctx.registry.list_all_institutions(country);
    if json {
        return output::json(&institutions);
    }

    let mut table = output::create_table();
    table.set_header(vec!["ID", "Name", "Provider", "BIC", "History (days)"]);
    for inst in &institutions {
        table.add_row(vec![
            inst.id.clone(),
            inst.name.clone(),
            inst.provider.to_string(),
            inst.bic.clone().unwrap_or_default(),
            inst.max_history_days.map(|d| d.to_string()).unwrap_or_default(),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub fn connect(
    source: &str,
    provider: &str,
    institution: &str,
    redirect_url: &str,
    card: bool,
    json: bool,
) -> Result<()> {
    let provider: ProviderId = provider.parse().map_err(|e: String| anyhow!(e))?;
    let kind = if card { AccountKind::Card } else { AccountKind::Account };

    let ctx = get_context("connect")?;
    let started = ctx
        .connection_service
        .start_connection(source, provider, institution, redirect_url, kind)?;

    if json {
        return output::json(&started);
    }

    output::success(&format!("Connection started with {}", provider));
    println!("  Open this link to grant access:");
    println!("  {}", started.auth_url.bold());
    println!("  The link expires at {}.", output::format_time(Some(started.expires_at)));
    println!();
    println!(
        "  Then run: bf callback {} --code <code>",
        started.connection_id
    );
    Ok(())
}

pub fn callback(connection_id: &str, code: Option<String>, error: Option<String>, json: bool) -> Result<()> {
    let connection_id = Uuid::parse_str(connection_id).context("Invalid connection id")?;
    let ctx = get_context("callback")?;

    let params = CallbackParams { code, error };
    let completed = if params.code.is_none() && params.error.is_none() {
        // No redirect data: ask the provider where the authorization stands
        ctx.connection_service.refresh_pending(connection_id)?
    } else {
        ctx.connection_service.complete_connection(connection_id, &params)?
    };

    if json {
        return output::json(&completed);
    }

    println!("Status: {}", output::connection_status(completed.status));
    if completed.linked_sources.is_empty() {
        output::warning("No accounts were linked.");
        return Ok(());
    }
    output::success(&format!("Linked {} account(s):", completed.linked_sources.len()));
    for source in &completed.linked_sources {
        println!(
            "  {} {}",
            source.name,
            source.iban.as_deref().unwrap_or("(no IBAN)").dimmed()
        );
    }
    Ok(())
}

pub fn status(source: &str, json: bool) -> Result<()> {
    let ctx = get_context("status")?;
    let view = ctx.connection_service.connection_status(source)?;

    if json {
        return output::json(&view);
    }

    println!("{}", "Connection".bold());
    println!("  Provider: {}", view.provider);
    println!("  Status: {}", output::connection_status(view.status));
    match view.reauth.days_remaining {
        Some(days) if days >= 0 => println!("  Consent expires in {} days ({})", days, output::format_time(view.expires_at)),
        Some(days) => println!("  Consent expired {} days ago", -days),
        None => {}
    }
    if view.reauth.required {
        output::warning("  Reconnect required: run 'bf connect' again for this source.");
    }
    println!("  Last sync: {}", output::format_time(view.last_sync_at));
    if let Some(err) = &view.last_sync_error {
        println!("  {} {}", "Last error:".red(), err);
    }
    Ok(())
}

pub fn disconnect(source: &str, force: bool) -> Result<()> {
    if !force && is_interactive() {
        let confirmed = Confirm::new()
            .with_prompt(format!("Revoke bank access for '{}'?", source))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let ctx = get_context("disconnect")?;
    let connection = ctx.connection_service.disconnect(source)?;
    output::success(&format!("Disconnected {} connection {}", connection.provider(), connection.id));
    Ok(())
}
