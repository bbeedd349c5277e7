//! Service layer - business logic orchestration
//!
//! Services coordinate domain logic and port interactions. Each service
//! focuses on a specific use case or feature area.

pub mod column_matcher;
mod connection;
pub mod import;
pub mod ingest;
pub mod logging;
pub mod migration;
mod registry;
mod scheduler;
mod source;
mod sync;

pub use column_matcher::ColumnMatcher;
pub use connection::{CompletedConnection, ConnectionService, ConnectionStatusView, StartedConnection};
pub use import::{CsvAnalysis, ImportOptions, ImportResult, ImportService};
pub use ingest::{DuplicateChecker, IngestOutcome, IngestPipeline, IngestProgress};
pub use logging::{EntryPoint, EventCount, LogEntry, LogEvent, LoggingService};
pub use migration::{MigrationResult, MigrationService};
pub use registry::ProviderRegistry;
pub use scheduler::Scheduler;
pub use source::{SourceService, SourceSummary};
pub use sync::{ReminderSummary, SourceSyncResult, SourceSyncStatus, SyncRunSummary, SyncService};
