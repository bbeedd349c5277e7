//! bankfeed CLI - bank transactions into one local ledger

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{connect, import, logs, notifications, sources, sync};

/// bankfeed - sync bank accounts and import CSV exports
#[derive(Parser)]
#[command(name = "bf", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage sources (bank accounts and CSV origins)
    Sources {
        #[command(subcommand)]
        command: sources::SourcesCommands,
    },

    /// Show the most recent transactions of a source
    Transactions {
        /// Source name or id
        source: String,
        /// Number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List banks available in a country
    Institutions {
        /// ISO country code, e.g. DE or GB
        country: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start linking a source to a bank
    Connect {
        /// Source name or id
        source: String,
        /// Banking provider (gocardless, truelayer)
        #[arg(long)]
        provider: String,
        /// Institution id from `bf institutions`
        #[arg(long)]
        institution: String,
        /// Where the bank redirects after consent
        #[arg(long, default_value = connect::DEFAULT_REDIRECT_URL)]
        redirect_url: String,
        /// Link a card account instead of a bank account (TrueLayer)
        #[arg(long)]
        card: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Finish a connection with the redirect's code or error
    Callback {
        /// Connection id printed by `bf connect`
        connection_id: String,
        /// Authorization code from the redirect
        #[arg(long)]
        code: Option<String>,
        /// Error from the redirect
        #[arg(long)]
        error: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a source's connection state and consent expiry
    Status {
        /// Source name or id
        source: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Revoke a source's bank connection
    Disconnect {
        /// Source name or id
        source: String,
        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Sync one source now, or run the scheduled sync for all sources
    Sync {
        /// Source name or id (runs the scheduled sync if not specified)
        source: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send reminders for consents that expire soon
    Reminders {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run scheduled syncs and reminders on an interval until Ctrl-C
    Schedule {
        /// Minutes between runs
        #[arg(long, default_value = "60")]
        every: u64,
    },

    /// Import transactions from a CSV file
    Import {
        /// Path to CSV file
        file: PathBuf,
        /// Source name or id to import into
        #[arg(long)]
        source: String,
        /// Column mapping as `column=field[:format]`, or `column=-` to ignore
        #[arg(long = "map", value_name = "MAPPING")]
        mappings: Vec<String>,
        /// Parse and check duplicates without writing
        #[arg(long)]
        preview: bool,
        /// Do not remember the mappings on the source
        #[arg(long)]
        no_save_mappings: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the proposed column mappings for a CSV file
    Analyze {
        /// Path to CSV file
        file: PathBuf,
        /// Source name or id the file belongs to
        #[arg(long)]
        source: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-run an earlier import with different mappings
    Remap {
        /// Import id from `bf imports`
        import_id: String,
        /// Column mapping as `column=field[:format]`, or `column=-` to ignore
        #[arg(long = "map", value_name = "MAPPING", required = true)]
        mappings: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List past CSV imports
    Imports {
        /// Only imports into this source
        #[arg(long)]
        source: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show notifications waiting for delivery
    Notifications {
        /// Include already delivered notifications
        #[arg(long)]
        all: bool,
        /// Mark all pending notifications as delivered
        #[arg(long)]
        ack: bool,
        /// Number of notifications to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// View and manage the event log
    Logs {
        #[command(subcommand)]
        command: logs::LogsCommands,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BANKFEED_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Sources { command } => sources::run(command),
        Commands::Transactions { source, limit, json } => sources::transactions(&source, limit, json),
        Commands::Institutions { country, json } => connect::institutions(&country, json),
        Commands::Connect {
            source,
            provider,
            institution,
            redirect_url,
            card,
            json,
        } => connect::connect(&source, &provider, &institution, &redirect_url, card, json),
        Commands::Callback {
            connection_id,
            code,
            error,
            json,
        } => connect::callback(&connection_id, code, error, json),
        Commands::Status { source, json } => connect::status(&source, json),
        Commands::Disconnect { source, force } => connect::disconnect(&source, force),
        Commands::Sync { source, json } => sync::run(source.as_deref(), json),
        Commands::Reminders { json } => sync::reminders(json),
        Commands::Schedule { every } => sync::schedule(every),
        Commands::Import {
            file,
            source,
            mappings,
            preview,
            no_save_mappings,
            json,
        } => import::run(&file, &source, &mappings, preview, !no_save_mappings, json),
        Commands::Analyze { file, source, json } => import::analyze(&file, &source, json),
        Commands::Remap {
            import_id,
            mappings,
            json,
        } => import::remap(&import_id, &mappings, json),
        Commands::Imports { source, json } => import::list(source.as_deref(), json),
        Commands::Notifications { all, ack, limit, json } => notifications::run(all, ack, limit, json),
        Commands::Logs { command } => logs::run(command),
    }
}
