//! CLI command implementations

pub mod connect;
pub mod import;
pub mod logs;
pub mod notifications;
pub mod sources;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use bankfeed_core::services::EntryPoint;
use bankfeed_core::BankfeedContext;

/// Data directory from `BANKFEED_DIR`, else `~/.bankfeed`
pub fn get_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("BANKFEED_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("Could not find home directory; set BANKFEED_DIR")?;
    Ok(home.join(".bankfeed"))
}

/// Open the context for a CLI command and record the command in the event log
pub fn get_context(command: &str) -> Result<BankfeedContext> {
    open_context(command, EntryPoint::Cli)
}

pub fn open_context(command: &str, entry_point: EntryPoint) -> Result<BankfeedContext> {
    let data_dir = get_data_dir()?;
    let ctx = BankfeedContext::new(&data_dir, entry_point)
        .with_context(|| format!("Failed to open bankfeed data in {}", data_dir.display()))?;
    if let Err(e) = ctx.logger.log_command(command) {
        tracing::debug!("failed to log command: {:#}", e);
    }
    Ok(ctx)
}

/// Whether interactive prompts and progress bars make sense
pub fn is_interactive() -> bool {
    atty::is(atty::Stream::Stdout)
}
