//! Storage ports used by the ingest pipeline and the sync orchestrator

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::result::Result;
use crate::domain::{EventKind, SyncEvent, Transaction};

/// Upper bound on hash keys per duplicate-check query
pub const MAX_KEYS_PER_QUERY: usize = 30;

/// Transaction store as seen by ingestion
pub trait TransactionStore: Send + Sync {
    /// Largest key list one `existing_hashes` call accepts
    fn max_keys_per_query(&self) -> usize;

    /// Subset of `hashes` already stored, non-superseded, for `source_id`.
    ///
    /// Implementations may reject lists longer than `max_keys_per_query`.
    fn existing_hashes(&self, source_id: Uuid, hashes: &[String]) -> Result<HashSet<String>>;

    /// Insert a batch in one commit. Rows whose `(source_id, dedupe_hash)`
    /// already exists are left out; returns how many were written.
    fn insert_batch(&self, transactions: &[Transaction]) -> Result<usize>;
}

/// Outbox for the external notification collaborator
pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: &SyncEvent) -> Result<()>;

    /// When an event of `kind` was last emitted for `source_id`
    fn last_emitted(&self, source_id: Uuid, kind: EventKind) -> Result<Option<DateTime<Utc>>>;
}
