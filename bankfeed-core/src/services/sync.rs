//! Sync service - scheduled and manual provider syncs
//!
//! Each source syncs as one sequential pipeline: reauth gate, token refresh,
//! fetch, normalize, dedupe, write. Sources are independent of each other;
//! a failing source is recorded on its connection and the run moves on.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::adapters::duckdb::DuckDbRepository;
use crate::config::SyncSettings;
use crate::domain::result::{Error, Result};
use crate::domain::{
    ConnectionStatus, EventKind, IngestCounts, IngestOrigin, JobStatus, ProviderConnection, ProviderId,
    SyncEvent, SyncJob, SyncTrigger,
};
use crate::ports::{BankingProvider, NotificationSink, RefreshOutcome};
use crate::services::ingest::IngestPipeline;
use crate::services::logging::{events, LogEvent, LoggingService};
use crate::services::registry::ProviderRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSyncStatus {
    Synced,
    /// Synced within the minimum re-sync interval
    SkippedRecent,
    /// Another sync of this source is running in this process
    SkippedInFlight,
    ReauthRequired,
    Failed,
}

/// Outcome for one source
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSyncResult {
    pub source_id: Uuid,
    pub connection_id: Uuid,
    pub provider: ProviderId,
    pub status: SourceSyncStatus,
    pub job_id: Option<Uuid>,
    pub window_from: Option<NaiveDate>,
    pub window_to: Option<NaiveDate>,
    pub counts: IngestCounts,
    pub error: Option<String>,
    /// Backoff the provider asked for, when rate limited
    pub retry_after_secs: Option<u64>,
}

impl SourceSyncResult {
    fn new(connection: &ProviderConnection, status: SourceSyncStatus) -> Self {
        Self {
            source_id: connection.source_id,
            connection_id: connection.id,
            provider: connection.provider(),
            status,
            job_id: None,
            window_from: None,
            window_to: None,
            counts: IngestCounts::default(),
            error: None,
            retry_after_secs: None,
        }
    }

    fn from_error(connection: &ProviderConnection, error: &Error) -> Self {
        let status = if error.is_reauth() {
            SourceSyncStatus::ReauthRequired
        } else {
            SourceSyncStatus::Failed
        };
        let mut result = Self::new(connection, status);
        result.error = Some(error.to_string());
        if let Error::RateLimited { retry_after, .. } = error {
            result.retry_after_secs = retry_after.map(|d| d.as_secs());
        }
        result
    }
}

/// Summary of one scheduled run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub results: Vec<SourceSyncResult>,
    pub synced: usize,
    pub skipped: usize,
    pub reauth_required: usize,
    pub failed: usize,
    pub imported: usize,
}

impl SyncRunSummary {
    fn new(started_at: DateTime<Utc>, results: Vec<SourceSyncResult>) -> Self {
        let count = |s: SourceSyncStatus| results.iter().filter(|r| r.status == s).count();
        Self {
            started_at,
            synced: count(SourceSyncStatus::Synced),
            skipped: count(SourceSyncStatus::SkippedRecent) + count(SourceSyncStatus::SkippedInFlight),
            reauth_required: count(SourceSyncStatus::ReauthRequired),
            failed: count(SourceSyncStatus::Failed),
            imported: results.iter().map(|r| r.counts.imported).sum(),
            results,
        }
    }
}

/// Summary of one reminder pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSummary {
    pub checked: usize,
    pub reminded: Vec<Uuid>,
}

/// Removes the source from the in-flight set when dropped
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<Uuid>>,
    source_id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.source_id);
        }
    }
}

/// Sync orchestrator for provider-backed sources
pub struct SyncService {
    repository: Arc<DuckDbRepository>,
    registry: ProviderRegistry,
    settings: SyncSettings,
    logger: Option<Arc<LoggingService>>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl SyncService {
    pub fn new(repository: Arc<DuckDbRepository>, registry: ProviderRegistry, settings: SyncSettings) -> Self {
        Self {
            repository,
            registry,
            settings,
            logger: None,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_logger(mut self, logger: Arc<LoggingService>) -> Self {
        self.logger = Some(logger);
        self
    }

    fn log(&self, event: LogEvent) {
        if let Some(logger) = &self.logger {
            logger.record(event);
        }
    }

    /// Scheduled entry point: every active provider-backed source
    pub fn run_scheduled(&self) -> Result<SyncRunSummary> {
        self.run_scheduled_at(Utc::now())
    }

    pub fn run_scheduled_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        // Latest connection per source; older ones are superseded
        let by_source: BTreeMap<Uuid, ProviderConnection> = self
            .repository
            .list_active_connections()?
            .into_iter()
            .map(|c| (c.source_id, c))
            .collect();
        let connections: Vec<ProviderConnection> = by_source.into_values().collect();

        let parallel = self.settings.max_parallel_sources.max(1);
        let mut results = Vec::with_capacity(connections.len());
        for chunk in connections.chunks(parallel) {
            thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|conn| (conn, scope.spawn(move || self.scheduled_source(conn, now))))
                    .collect();
                for (conn, handle) in handles {
                    let result = handle.join().unwrap_or_else(|_| {
                        tracing::error!(source_id = %conn.source_id, "sync thread panicked");
                        let mut failed = SourceSyncResult::new(conn, SourceSyncStatus::Failed);
                        failed.error = Some("sync panicked".to_string());
                        failed
                    });
                    results.push(result);
                }
            });
        }

        let summary = SyncRunSummary::new(now, results);
        tracing::info!(
            synced = summary.synced,
            skipped = summary.skipped,
            reauth_required = summary.reauth_required,
            failed = summary.failed,
            imported = summary.imported,
            "scheduled sync finished"
        );
        self.log(LogEvent::new(events::SYNC_RUN_COMPLETED).with_error_details(format!(
            "synced={} skipped={} reauth={} failed={}",
            summary.synced, summary.skipped, summary.reauth_required, summary.failed
        )));
        Ok(summary)
    }

    fn scheduled_source(&self, connection: &ProviderConnection, now: DateTime<Utc>) -> SourceSyncResult {
        match self.sync_connection(connection.clone(), SyncTrigger::Scheduled, now) {
            Ok(result) => result,
            Err(e) => SourceSyncResult::from_error(connection, &e),
        }
    }

    /// Manual entry point for one source.
    ///
    /// Bypasses the re-sync interval. Reauth and provider failures come back
    /// as errors instead of notifications.
    pub fn sync_source(&self, source_ref: &str) -> Result<SourceSyncResult> {
        self.sync_source_at(source_ref, Utc::now())
    }

    pub fn sync_source_at(&self, source_ref: &str, now: DateTime<Utc>) -> Result<SourceSyncResult> {
        let source = self.repository.resolve_source(source_ref)?;
        let connection = self
            .repository
            .current_connection(source.id)?
            .ok_or_else(|| Error::config(format!("Source '{}' is not connected to a bank", source.name)))?;

        let result = self.sync_connection(connection, SyncTrigger::Manual, now)?;
        if result.status == SourceSyncStatus::SkippedInFlight {
            return Err(Error::config(format!("A sync for '{}' is already running", source.name)));
        }
        Ok(result)
    }

    fn sync_connection(
        &self,
        mut connection: ProviderConnection,
        trigger: SyncTrigger,
        now: DateTime<Utc>,
    ) -> Result<SourceSyncResult> {
        let Some(_guard) = self.acquire(connection.source_id)? else {
            return Ok(SourceSyncResult::new(&connection, SourceSyncStatus::SkippedInFlight));
        };

        let provider = match self.registry.get_or_throw(connection.provider()) {
            Ok(p) => p,
            Err(e) => {
                self.repository
                    .record_sync_failure(connection.id, &e.to_string(), now)?;
                return Err(e);
            }
        };

        // Expired consent is never passed to the provider
        let check = provider.check_reauth_required(&connection, now);
        if connection.status != ConnectionStatus::Linked || check.required {
            let reason = match check.days_remaining {
                Some(d) if d < 0 => format!("Bank consent expired {} days ago", -d),
                _ => "Bank consent has expired".to_string(),
            };
            return Err(self.require_reauth(&connection, reason, trigger, now)?);
        }

        if trigger == SyncTrigger::Scheduled {
            let min_interval = Duration::hours(self.settings.min_resync_hours);
            if connection.last_sync_at.is_some_and(|last| now - last < min_interval) {
                tracing::debug!(source_id = %connection.source_id, "synced recently, skipping");
                return Ok(SourceSyncResult::new(&connection, SourceSyncStatus::SkippedRecent));
            }
        }

        match provider.refresh_token_if_needed(&connection, now) {
            Ok(RefreshOutcome::Unchanged) => {}
            Ok(RefreshOutcome::Refreshed(credentials)) => {
                connection.credentials = credentials;
                connection.updated_at = now;
                self.repository.upsert_connection(&connection)?;
            }
            Ok(RefreshOutcome::ReauthRequired(reason)) => {
                return Err(self.require_reauth(&connection, reason, trigger, now)?);
            }
            Err(e) => return Err(self.fail(&connection, None, e, trigger, now)?),
        }

        let (window_from, window_to) = self.window(connection.last_sync_at, now);
        let mut job = SyncJob::start(
            connection.source_id,
            connection.id,
            trigger,
            (window_from, window_to),
            now,
        );
        self.repository.upsert_sync_job(&job)?;

        let counts = match self.fetch_and_ingest(provider.as_ref(), &connection, &mut job) {
            Ok(counts) => counts,
            Err(e) if e.is_reauth() => {
                self.finish_job(&mut job, JobStatus::Failed, Some(e.to_string()), now)?;
                let reason = match e {
                    Error::ReauthRequired { reason, .. } => reason,
                    other => other.to_string(),
                };
                return Err(self.require_reauth(&connection, reason, trigger, now)?);
            }
            Err(e) => return Err(self.fail(&connection, Some(&mut job), e, trigger, now)?),
        };

        job.counts = counts;
        self.finish_job(&mut job, JobStatus::Completed, None, now)?;
        self.repository.record_sync_success(connection.id, now)?;

        if trigger == SyncTrigger::Scheduled && counts.imported > 0 {
            self.repository.emit(
                &SyncEvent::new(
                    EventKind::NewTransactions,
                    connection.source_id,
                    format!("{} new transactions", counts.imported),
                    now,
                )
                .with_counts(counts.imported, counts.skipped),
            )?;
        }

        tracing::info!(
            source_id = %connection.source_id,
            provider = %connection.provider(),
            imported = counts.imported,
            skipped = counts.skipped,
            "source synced"
        );
        self.log(
            LogEvent::new(events::SOURCE_SYNC_COMPLETED)
                .with_provider(connection.provider())
                .with_source(connection.source_id)
                .with_command(trigger.as_str()),
        );

        let mut result = SourceSyncResult::new(&connection, SourceSyncStatus::Synced);
        result.job_id = Some(job.id);
        result.window_from = Some(window_from);
        result.window_to = Some(window_to);
        result.counts = counts;
        Ok(result)
    }

    fn fetch_and_ingest(
        &self,
        provider: &dyn BankingProvider,
        connection: &ProviderConnection,
        job: &mut SyncJob,
    ) -> Result<IngestCounts> {
        let source = self
            .repository
            .get_source(connection.source_id)?
            .ok_or_else(|| Error::not_found(format!("Source {}", connection.source_id)))?;
        let account_id = connection
            .external_account_id
            .as_deref()
            .ok_or_else(|| Error::config(format!("Connection {} has no linked account", connection.id)))?;

        let fetched = provider.fetch_transactions(connection, account_id, job.window_from, job.window_to)?;
        let outcome = IngestPipeline::new(self.repository.as_ref()).run(
            &source,
            IngestOrigin::Sync(job.id),
            fetched.transactions,
            None,
        )?;
        let mut counts = outcome.counts;
        if !fetched.rejected.is_empty() {
            tracing::warn!(
                source_id = %source.id,
                rejected = fetched.rejected.len(),
                "provider sent transactions that could not be mapped"
            );
            counts.merge(IngestCounts::rejected(fetched.rejected.len()));
            job.row_errors = fetched.rejected;
        }
        if let Some(first) = outcome.batch_errors.first() {
            tracing::warn!(
                source_id = %source.id,
                errored = outcome.counts.errored,
                "sync stored with write errors: {}",
                first
            );
        }
        Ok(counts)
    }

    /// `[last - overlap, today]`, or the initial lookback on a first sync
    fn window(&self, last_sync_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> (NaiveDate, NaiveDate) {
        let to = now.date_naive();
        let from = match last_sync_at {
            Some(last) => (last - Duration::days(self.settings.overlap_days)).date_naive(),
            None => (now - Duration::days(self.settings.initial_lookback_days)).date_naive(),
        };
        (from.min(to), to)
    }

    fn acquire(&self, source_id: Uuid) -> Result<Option<InFlightGuard<'_>>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|e| Error::database(format!("Lock poisoned: {}", e)))?;
        if !set.insert(source_id) {
            return Ok(None);
        }
        Ok(Some(InFlightGuard {
            in_flight: &self.in_flight,
            source_id,
        }))
    }

    fn finish_job(&self, job: &mut SyncJob, status: JobStatus, error: Option<String>, now: DateTime<Utc>) -> Result<()> {
        job.status = status;
        job.error = error;
        job.finished_at = Some(now);
        self.repository.upsert_sync_job(job)
    }

    /// Record a per-source failure; returns the error for the caller
    fn fail(
        &self,
        connection: &ProviderConnection,
        job: Option<&mut SyncJob>,
        error: Error,
        trigger: SyncTrigger,
        now: DateTime<Utc>,
    ) -> Result<Error> {
        let message = error.to_string();
        tracing::warn!(
            source_id = %connection.source_id,
            provider = %connection.provider(),
            rate_limited = error.is_rate_limited(),
            "source sync failed: {}",
            message
        );

        if let Some(job) = job {
            self.finish_job(job, JobStatus::Failed, Some(message.clone()), now)?;
        }
        self.repository.record_sync_failure(connection.id, &message, now)?;

        if trigger == SyncTrigger::Scheduled {
            self.repository.emit(&SyncEvent::new(
                EventKind::SyncFailed,
                connection.source_id,
                message.clone(),
                now,
            ))?;
        }
        self.log(
            LogEvent::new(events::SOURCE_SYNC_FAILED)
                .with_provider(connection.provider())
                .with_source(connection.source_id)
                .with_command(trigger.as_str())
                .with_error(message),
        );
        Ok(error)
    }

    /// Block the connection until the user reconnects; returns the error
    fn require_reauth(
        &self,
        connection: &ProviderConnection,
        reason: String,
        trigger: SyncTrigger,
        now: DateTime<Utc>,
    ) -> Result<Error> {
        if connection.status == ConnectionStatus::Linked {
            self.repository
                .set_connection_status(connection.id, ConnectionStatus::Expired)?;
        }
        self.repository.record_sync_failure(connection.id, &reason, now)?;

        if trigger == SyncTrigger::Scheduled {
            self.notify_reauth(connection, &reason, now)?;
        }
        self.log(
            LogEvent::new(events::REAUTH_REQUIRED)
                .with_provider(connection.provider())
                .with_source(connection.source_id)
                .with_command(trigger.as_str()),
        );
        Ok(Error::reauth(connection.source_id.to_string(), reason))
    }

    /// At most one reauth notification per source per cooldown window
    fn notify_reauth(&self, connection: &ProviderConnection, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let cooldown = Duration::hours(self.settings.notification_cooldown_hours);
        let last = self
            .repository
            .last_emitted(connection.source_id, EventKind::ReauthRequired)?;
        if last.is_some_and(|at| now - at < cooldown) {
            return Ok(false);
        }

        let mut event = SyncEvent::new(
            EventKind::ReauthRequired,
            connection.source_id,
            format!("Reconnect your bank to resume syncing: {}", reason),
            now,
        );
        if let Some(days) = connection.reauth_check(now).days_remaining {
            event = event.with_days_remaining(days);
        }
        self.repository.emit(&event)?;
        Ok(true)
    }

    /// Remind users whose consent expires soon, once per source per day
    pub fn run_reminders(&self) -> Result<ReminderSummary> {
        self.run_reminders_at(Utc::now())
    }

    pub fn run_reminders_at(&self, now: DateTime<Utc>) -> Result<ReminderSummary> {
        let connections: Vec<ProviderConnection> = self
            .repository
            .list_active_connections()?
            .into_iter()
            .filter(|c| c.status == ConnectionStatus::Linked)
            .collect();

        let mut reminded = Vec::new();
        for connection in &connections {
            let check = match self.registry.get(connection.provider()) {
                Some(provider) => provider.check_reauth_required(connection, now),
                None => connection.reauth_check(now),
            };
            let days = match check.days_remaining {
                Some(d) if !check.required && d <= self.settings.reauth_reminder_days => d,
                _ => continue,
            };

            let last = self
                .repository
                .last_emitted(connection.source_id, EventKind::ReauthReminder)?;
            if last.is_some_and(|at| at.date_naive() == now.date_naive()) {
                continue;
            }

            self.repository.emit(
                &SyncEvent::new(
                    EventKind::ReauthReminder,
                    connection.source_id,
                    format!("Bank access expires in {} days, reconnect to keep syncing", days),
                    now,
                )
                .with_days_remaining(days),
            )?;
            reminded.push(connection.source_id);
        }

        tracing::info!(checked = connections.len(), reminded = reminded.len(), "reauth reminders sent");
        Ok(ReminderSummary {
            checked: connections.len(),
            reminded,
        })
    }

    pub fn recent_jobs(&self, source_id: Option<Uuid>, limit: usize) -> Result<Vec<SyncJob>> {
        self.repository.list_sync_jobs(source_id, limit)
    }
}
