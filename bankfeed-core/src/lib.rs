//! Bankfeed Core - transaction ingestion from bank providers and CSV exports
//!
//! This crate implements the core domain logic following hexagonal architecture:
//!
//! - **domain**: Core entities (Source, Transaction, ProviderConnection, etc.)
//! - **parsing**: Locale-aware date and amount parsing
//! - **ports**: Trait definitions for external dependencies (BankingProvider, TransactionStore)
//! - **services**: Business logic orchestration (sync, import, connections)
//! - **adapters**: Concrete implementations (DuckDB, GoCardless, TrueLayer)

pub mod adapters;
pub mod config;
pub mod domain;
pub mod log_migrations;
pub mod migrations;
pub mod parsing;
pub mod ports;
pub mod services;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use adapters::duckdb::DuckDbRepository;
use config::Config;
use services::*;

// Re-export commonly used types at crate root
pub use domain::result::{Error, OperationResult};
pub use domain::{
    ConnectionStatus, EventKind, FieldMapping, IngestCounts, ProviderConnection, ProviderId, Source,
    SourceKind, SyncEvent, Transaction,
};

pub const DATABASE_FILE: &str = "bankfeed.duckdb";

/// Main context for bankfeed operations
///
/// Holds the database, configuration, provider registry and all services.
pub struct BankfeedContext {
    pub data_dir: PathBuf,
    pub config: Config,
    pub repository: Arc<DuckDbRepository>,
    pub registry: ProviderRegistry,
    pub logger: Arc<LoggingService>,
    pub source_service: SourceService,
    pub connection_service: ConnectionService,
    pub import_service: ImportService,
    pub sync_service: Arc<SyncService>,
}

impl BankfeedContext {
    /// Open the data directory, creating and migrating databases as needed
    pub fn new(data_dir: &Path, entry_point: EntryPoint) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let config = Config::load(data_dir)?;

        let repository = Arc::new(DuckDbRepository::new(&data_dir.join(DATABASE_FILE))?);
        repository.ensure_schema()?;

        let logger = Arc::new(LoggingService::new(data_dir, entry_point, env!("CARGO_PKG_VERSION"))?);
        let registry = ProviderRegistry::from_config(&config)?;

        let source_service = SourceService::new(Arc::clone(&repository));
        let connection_service =
            ConnectionService::new(Arc::clone(&repository), registry.clone()).with_logger(Arc::clone(&logger));
        let import_service = ImportService::new(Arc::clone(&repository), data_dir, config.import.region)
            .with_logger(Arc::clone(&logger));
        let sync_service = Arc::new(
            SyncService::new(Arc::clone(&repository), registry.clone(), config.sync.clone())
                .with_logger(Arc::clone(&logger)),
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            repository,
            registry,
            logger,
            source_service,
            connection_service,
            import_service,
            sync_service,
        })
    }
}
