//! Output formatting utilities

use colored::{ColoredString, Colorize};
use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};

use bankfeed_core::parsing::format_amount;
use bankfeed_core::ConnectionStatus;

/// Print a success message
pub fn success(msg: &str) {
    println!("{}", msg.green());
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{}", msg.red());
}

/// Print a warning message
pub fn warning(msg: &str) {
    println!("{}", msg.yellow());
}

/// Print an info message
pub fn info(msg: &str) {
    println!("{}", msg.cyan());
}

/// Create a styled table
pub fn create_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Pretty-print any serializable value as JSON
pub fn json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Minor units rendered in English notation with the currency code
pub fn money(minor: i64, currency: &str) -> String {
    match format_amount(minor, "en") {
        Some(body) => format!("{} {}", body, currency),
        None => format!("{} {}", minor, currency),
    }
}

pub fn connection_status(status: ConnectionStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        ConnectionStatus::Linked => label.green(),
        ConnectionStatus::Pending | ConnectionStatus::Authorizing => label.yellow(),
        _ => label.red(),
    }
}

pub fn format_time(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}
