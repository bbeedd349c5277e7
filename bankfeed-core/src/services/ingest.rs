//! Ingest pipeline shared by CSV imports and provider syncs
//!
//! Candidates are materialized, hashed, checked against the store and written
//! in bounded batches. The duplicate check runs before every batch and also
//! consults the hashes this run already handled, so a run never re-inserts
//! its own rows.

use std::collections::HashSet;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::result::Result;
use crate::domain::{IncomingTransaction, IngestCounts, IngestOrigin, Source, Transaction};
use crate::ports::{TransactionStore, MAX_KEYS_PER_QUERY};

/// Rows per write commit
pub const WRITE_BATCH_SIZE: usize = 500;

/// Batched existence check against a [`TransactionStore`]
pub struct DuplicateChecker<'a> {
    store: &'a dyn TransactionStore,
    chunk_size: usize,
}

impl<'a> DuplicateChecker<'a> {
    pub fn new(store: &'a dyn TransactionStore) -> Self {
        let chunk_size = MAX_KEYS_PER_QUERY.min(store.max_keys_per_query()).max(1);
        Self { store, chunk_size }
    }

    /// Override the chunk size; still capped by what the store accepts
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.min(self.store.max_keys_per_query()).max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Subset of `hashes` already stored for `source_id`
    pub fn check(&self, source_id: Uuid, hashes: &[String]) -> Result<HashSet<String>> {
        let mut existing = HashSet::new();
        for chunk in hashes.chunks(self.chunk_size) {
            existing.extend(self.store.existing_hashes(source_id, chunk)?);
        }
        Ok(existing)
    }
}

/// Progress after each write batch
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestProgress {
    pub processed: usize,
    pub total: usize,
    pub counts: IngestCounts,
}

/// What one pipeline run did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub counts: IngestCounts,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Failed duplicate checks and writes; the affected rows are counted as errored
    pub batch_errors: Vec<String>,
}

pub struct IngestPipeline<'a> {
    store: &'a dyn TransactionStore,
    checker: DuplicateChecker<'a>,
    batch_size: usize,
    preview: bool,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(store: &'a dyn TransactionStore) -> Self {
        Self {
            store,
            checker: DuplicateChecker::new(store),
            batch_size: WRITE_BATCH_SIZE,
            preview: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, WRITE_BATCH_SIZE);
        self
    }

    /// Run parsing and duplicate checks without writing
    pub fn preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    /// Ingest `candidates` into `source`.
    ///
    /// Returned counts cover exactly the candidates passed in. Identical
    /// candidates within one run collapse into one row; the rest count as
    /// skipped.
    pub fn run(
        &self,
        source: &Source,
        origin: IngestOrigin,
        candidates: Vec<IncomingTransaction>,
        progress: Option<&dyn Fn(IngestProgress)>,
    ) -> Result<IngestOutcome> {
        let total = candidates.len();
        let mut outcome = IngestOutcome {
            counts: IngestCounts {
                total,
                ..Default::default()
            },
            date_from: candidates.iter().map(|c| c.date).min(),
            date_to: candidates.iter().map(|c| c.date).max(),
            batch_errors: Vec::new(),
        };

        let now = Utc::now();
        let mut seen: HashSet<String> = HashSet::new();
        let mut processed = 0;

        let mut pending = candidates.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<Transaction> = pending
                .by_ref()
                .take(self.batch_size)
                .map(|c| c.into_transaction(source, origin, now))
                .collect();
            processed += batch.len();

            let mut fresh = Vec::with_capacity(batch.len());
            for tx in batch {
                if seen.insert(tx.dedupe_hash.clone()) {
                    fresh.push(tx);
                } else {
                    outcome.counts.skipped += 1;
                }
            }

            let hashes: Vec<String> = fresh.iter().map(|t| t.dedupe_hash.clone()).collect();
            let existing = match self.checker.check(source.id, &hashes) {
                Ok(existing) => existing,
                Err(e) => {
                    tracing::warn!(
                        source_id = %source.id,
                        rows = fresh.len(),
                        "duplicate check failed: {}",
                        e
                    );
                    Self::fail_rows(&mut outcome, &mut seen, &fresh, e.to_string());
                    Self::report(progress, processed, total, &outcome);
                    continue;
                }
            };
            let (dupes, to_insert): (Vec<Transaction>, Vec<Transaction>) = fresh
                .into_iter()
                .partition(|t| existing.contains(&t.dedupe_hash));
            outcome.counts.skipped += dupes.len();

            if self.preview {
                outcome.counts.imported += to_insert.len();
            } else {
                match self.store.insert_batch(&to_insert) {
                    Ok(written) => {
                        outcome.counts.imported += written;
                        // Rows the storage guard rejected were stored concurrently
                        outcome.counts.skipped += to_insert.len().saturating_sub(written);
                    }
                    Err(e) => {
                        tracing::warn!(
                            source_id = %source.id,
                            rows = to_insert.len(),
                            "write batch failed: {}",
                            e
                        );
                        Self::fail_rows(&mut outcome, &mut seen, &to_insert, e.to_string());
                    }
                }
            }

            Self::report(progress, processed, total, &outcome);
        }

        debug_assert!(outcome.counts.is_balanced());
        Ok(outcome)
    }

    /// Count `rows` as errored and let a later identical candidate retry them
    fn fail_rows(outcome: &mut IngestOutcome, seen: &mut HashSet<String>, rows: &[Transaction], error: String) {
        outcome.counts.errored += rows.len();
        outcome.batch_errors.push(error);
        for tx in rows {
            seen.remove(&tx.dedupe_hash);
        }
    }

    fn report(progress: Option<&dyn Fn(IngestProgress)>, processed: usize, total: usize, outcome: &IngestOutcome) {
        if let Some(report) = progress {
            report(IngestProgress {
                processed,
                total,
                counts: outcome.counts,
            });
        }
    }
}
