//! Core domain entities
//!
//! Pure data structures and the dedupe hash. No I/O here.

pub mod connection;
pub mod dedupe;
mod event;
mod institution;
mod job;
pub mod mapping;
pub mod result;
mod source;
mod transaction;

pub use connection::{
    AccountKind, ConnectionStatus, OAuthTokens, ProviderConnection, ProviderCredentials,
    ProviderId, ReauthCheck,
};
pub use dedupe::{dedupe_hash, normalize_iban, source_identifier};
pub use event::{EventKind, SyncEvent};
pub use institution::{Institution, ProviderAccount};
pub use job::{ImportRecord, IngestCounts, JobStatus, RowError, SyncJob, SyncTrigger};
pub use mapping::{CanonicalField, FieldMapping, MatchMethod};
pub use source::{Source, SourceKind};
pub use transaction::{IncomingTransaction, IngestOrigin, Transaction};
