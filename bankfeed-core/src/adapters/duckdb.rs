//! DuckDB repository implementation

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use duckdb::{params, params_from_iter, Connection, Row};
use uuid::Uuid;

use crate::domain::result::{Error, Result};
use crate::domain::{
    ConnectionStatus, EventKind, FieldMapping, ImportRecord, IngestCounts, JobStatus,
    ProviderConnection, Source, SyncEvent, SyncJob, SyncTrigger, Transaction,
};
use crate::ports::{NotificationSink, TransactionStore, MAX_KEYS_PER_QUERY};
use crate::services::{MigrationResult, MigrationService};

/// Maximum number of retries when database file is locked
const MAX_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400, 800ms)
const INITIAL_RETRY_DELAY_MS: u64 = 50;

/// Check if an error message indicates a file locking issue that should be retried
fn is_retryable_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    // Windows error messages
    lower.contains("being used by another process")
        || lower.contains("cannot access the file")
        // Unix/macOS error messages
        || lower.contains("resource temporarily unavailable")
        || lower.contains("database is locked")
        || lower.contains("file is already open")
}

const SOURCE_COLUMNS: &str = "source_id, name, iban, currency, kind, CAST(field_mappings AS VARCHAR),
     created_at::VARCHAR, updated_at::VARCHAR";

const CONNECTION_COLUMNS: &str = "connection_id, source_id, institution_id, status,
     CAST(credentials AS VARCHAR), external_account_id, auth_url, link_expires_at::VARCHAR,
     expires_at::VARCHAR, last_sync_at::VARCHAR, last_sync_error, created_at::VARCHAR,
     updated_at::VARCHAR";

const TRANSACTION_COLUMNS: &str = "transaction_id, source_id, transaction_date::VARCHAR, amount,
     currency, name, description, counterparty_name, counterparty_iban, reference, dedupe_hash,
     import_job_id, sync_job_id, CAST(original AS VARCHAR), superseded_at::VARCHAR,
     created_at::VARCHAR";

const IMPORT_COLUMNS: &str = "import_id, source_id, file_name, raw_file_path, CAST(headers AS VARCHAR),
     CAST(field_mappings AS VARCHAR), total, imported, skipped, errored, CAST(row_errors AS VARCHAR),
     date_from::VARCHAR, date_to::VARCHAR, remapped_from, created_at::VARCHAR";

/// DuckDB repository implementation
pub struct DuckDbRepository {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl DuckDbRepository {
    /// Open (or create) the database file.
    ///
    /// Retries with exponential backoff when the file is locked by another
    /// process, e.g. a scheduled run overlapping a manual command.
    pub fn new(db_path: &Path) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match Self::try_open_connection(db_path) {
                Ok(conn) => {
                    return Ok(Self {
                        conn: Mutex::new(conn),
                        db_path: Some(db_path.to_path_buf()),
                    });
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    if is_retryable_error(&err_msg) && attempt < MAX_RETRIES - 1 {
                        let delay =
                            Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
                        tracing::warn!(
                            attempt = attempt + 1,
                            max = MAX_RETRIES,
                            delay_ms = delay.as_millis() as u64,
                            "database busy, retrying: {}",
                            err_msg
                        );
                        thread::sleep(delay);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::database(format!("Failed to open database after {} retries", MAX_RETRIES))
        }))
    }

    /// In-memory database, schema applied
    pub fn in_memory() -> Result<Self> {
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        let repo = Self {
            conn: Mutex::new(Connection::open_in_memory_with_flags(config)?),
            db_path: None,
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn try_open_connection(db_path: &Path) -> Result<Connection> {
        // Extension autoloading stays off; JSON is compiled in via the "json" feature
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        Ok(Connection::open_with_flags(db_path, config)?)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::database(format!("Lock poisoned: {}", e)))
    }

    pub fn run_migrations(&self) -> Result<MigrationResult> {
        let conn = self.lock()?;
        Ok(MigrationService::new(&conn).run_pending()?)
    }

    /// Ensure database schema exists (runs pending migrations)
    pub fn ensure_schema(&self) -> Result<()> {
        let result = self.run_migrations()?;
        if !result.applied.is_empty() {
            tracing::debug!(applied = ?result.applied, "applied migrations");
        }
        Ok(())
    }

    // === Source operations ===

    pub fn upsert_source(&self, source: &Source) -> Result<()> {
        let conn = self.lock()?;
        let mappings = source
            .field_mappings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO sys_sources (source_id, name, iban, currency, kind, field_mappings, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (source_id) DO UPDATE SET
                name = EXCLUDED.name,
                iban = EXCLUDED.iban,
                currency = EXCLUDED.currency,
                kind = EXCLUDED.kind,
                field_mappings = EXCLUDED.field_mappings,
                updated_at = EXCLUDED.updated_at",
            params![
                source.id.to_string(),
                source.name,
                source.iban,
                source.currency,
                source.kind.to_string(),
                mappings,
                fmt_ts(source.created_at),
                fmt_ts(source.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_sources WHERE source_id = ?",
            SOURCE_COLUMNS
        ))?;
        let mut rows = stmt.query_map([id.to_string()], row_to_source)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_sources(&self) -> Result<Vec<Source>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_sources ORDER BY created_at",
            SOURCE_COLUMNS
        ))?;
        let sources = stmt
            .query_map([], row_to_source)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(sources)
    }

    /// Look a source up by id, or by exact name when unambiguous
    pub fn resolve_source(&self, id_or_name: &str) -> Result<Source> {
        if let Ok(id) = Uuid::parse_str(id_or_name) {
            if let Some(source) = self.get_source(id)? {
                return Ok(source);
            }
        }
        let matches: Vec<Source> = self
            .list_sources()?
            .into_iter()
            .filter(|s| s.name == id_or_name)
            .collect();
        match matches.len() {
            1 => Ok(matches.into_iter().next().ok_or_else(|| Error::not_found(id_or_name))?),
            0 => Err(Error::not_found(format!("Source {}", id_or_name))),
            n => Err(Error::config(format!(
                "{} sources are named '{}', use the id instead",
                n, id_or_name
            ))),
        }
    }

    pub fn set_source_field_mappings(&self, id: Uuid, mappings: &[FieldMapping]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sys_sources SET field_mappings = ?, updated_at = ? WHERE source_id = ?",
            params![
                serde_json::to_string(mappings)?,
                fmt_ts(Utc::now()),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    // === Connection operations ===

    pub fn upsert_connection(&self, connection: &ProviderConnection) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sys_connections (connection_id, source_id, provider, institution_id, status,
                                          credentials, external_account_id, auth_url, link_expires_at,
                                          expires_at, last_sync_at, last_sync_error, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (connection_id) DO UPDATE SET
                source_id = EXCLUDED.source_id,
                status = EXCLUDED.status,
                credentials = EXCLUDED.credentials,
                external_account_id = EXCLUDED.external_account_id,
                auth_url = EXCLUDED.auth_url,
                link_expires_at = EXCLUDED.link_expires_at,
                expires_at = EXCLUDED.expires_at,
                last_sync_at = EXCLUDED.last_sync_at,
                last_sync_error = EXCLUDED.last_sync_error,
                updated_at = EXCLUDED.updated_at",
            params![
                connection.id.to_string(),
                connection.source_id.to_string(),
                connection.provider().as_str(),
                connection.institution_id,
                connection.status.as_str(),
                serde_json::to_string(&connection.credentials)?,
                connection.external_account_id,
                connection.auth_url,
                connection.link_expires_at.map(fmt_ts),
                connection.expires_at.map(fmt_ts),
                connection.last_sync_at.map(fmt_ts),
                connection.last_sync_error,
                fmt_ts(connection.created_at),
                fmt_ts(connection.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_connection(&self, id: Uuid) -> Result<Option<ProviderConnection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_connections WHERE connection_id = ?",
            CONNECTION_COLUMNS
        ))?;
        let mut rows = stmt.query_map([id.to_string()], row_to_connection)?;
        Ok(rows.next().transpose()?)
    }

    /// Most recent connection of a source that has not been revoked
    pub fn current_connection(&self, source_id: Uuid) -> Result<Option<ProviderConnection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_connections
             WHERE source_id = ? AND status <> 'revoked'
             ORDER BY created_at DESC LIMIT 1",
            CONNECTION_COLUMNS
        ))?;
        let mut rows = stmt.query_map([source_id.to_string()], row_to_connection)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_connections(&self) -> Result<Vec<ProviderConnection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_connections ORDER BY created_at",
            CONNECTION_COLUMNS
        ))?;
        let connections = stmt
            .query_map([], row_to_connection)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(connections)
    }

    /// Connections the scheduled run looks at: linked ones plus expired ones
    /// that still need reauth notifications
    pub fn list_active_connections(&self) -> Result<Vec<ProviderConnection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_connections
             WHERE status IN ('linked', 'expired')
             ORDER BY created_at",
            CONNECTION_COLUMNS
        ))?;
        let connections = stmt
            .query_map([], row_to_connection)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(connections)
    }

    pub fn set_connection_status(&self, id: Uuid, status: ConnectionStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sys_connections SET status = ?, updated_at = ? WHERE connection_id = ?",
            params![status.as_str(), fmt_ts(Utc::now()), id.to_string()],
        )?;
        Ok(())
    }

    pub fn record_sync_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sys_connections
             SET last_sync_at = ?, last_sync_error = NULL, updated_at = ?
             WHERE connection_id = ?",
            params![fmt_ts(at), fmt_ts(at), id.to_string()],
        )?;
        Ok(())
    }

    /// Record a failure without advancing `last_sync_at`
    pub fn record_sync_failure(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sys_connections SET last_sync_error = ?, updated_at = ? WHERE connection_id = ?",
            params![error, fmt_ts(at), id.to_string()],
        )?;
        Ok(())
    }

    // === Transaction operations ===

    pub fn get_transactions_by_source(&self, source_id: Uuid) -> Result<Vec<Transaction>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_transactions
             WHERE source_id = ? AND superseded_at IS NULL
             ORDER BY transaction_date DESC, created_at DESC",
            TRANSACTION_COLUMNS
        ))?;
        let transactions = stmt
            .query_map([source_id.to_string()], row_to_transaction)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(transactions)
    }

    pub fn transaction_count(&self, source_id: Uuid) -> Result<i64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sys_transactions WHERE source_id = ? AND superseded_at IS NULL",
            [source_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // === Job operations ===

    pub fn upsert_sync_job(&self, job: &SyncJob) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sys_sync_jobs (job_id, source_id, connection_id, sync_trigger, status,
                                        window_from, window_to, total, imported, skipped, errored,
                                        row_errors, error, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                total = EXCLUDED.total,
                imported = EXCLUDED.imported,
                skipped = EXCLUDED.skipped,
                errored = EXCLUDED.errored,
                row_errors = EXCLUDED.row_errors,
                error = EXCLUDED.error,
                finished_at = EXCLUDED.finished_at",
            params![
                job.id.to_string(),
                job.source_id.to_string(),
                job.connection_id.to_string(),
                job.trigger.as_str(),
                job.status.to_string(),
                job.window_from.to_string(),
                job.window_to.to_string(),
                job.counts.total as i64,
                job.counts.imported as i64,
                job.counts.skipped as i64,
                job.counts.errored as i64,
                serde_json::to_string(&job.row_errors)?,
                job.error,
                fmt_ts(job.started_at),
                job.finished_at.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn list_sync_jobs(&self, source_id: Option<Uuid>, limit: usize) -> Result<Vec<SyncJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, source_id, connection_id, sync_trigger, status, window_from::VARCHAR,
                    window_to::VARCHAR, total, imported, skipped, errored, error,
                    started_at::VARCHAR, finished_at::VARCHAR, CAST(row_errors AS VARCHAR)
             FROM sys_sync_jobs
             WHERE ? IS NULL OR source_id = ?
             ORDER BY started_at DESC
             LIMIT ?",
        )?;
        let source = source_id.map(|s| s.to_string());
        let jobs = stmt
            .query_map(params![source, source, limit as i64], |row| {
                Ok(SyncJob {
                    id: parse_uuid(row, 0)?,
                    source_id: parse_uuid(row, 1)?,
                    connection_id: parse_uuid(row, 2)?,
                    trigger: match row.get::<_, String>(3)?.as_str() {
                        "manual" => SyncTrigger::Manual,
                        _ => SyncTrigger::Scheduled,
                    },
                    status: match row.get::<_, String>(4)?.as_str() {
                        "completed" => JobStatus::Completed,
                        "failed" => JobStatus::Failed,
                        _ => JobStatus::Running,
                    },
                    window_from: parse_date_col(row, 5)?,
                    window_to: parse_date_col(row, 6)?,
                    counts: counts_from(row, 7)?,
                    row_errors: match row.get::<_, Option<String>>(14)? {
                        Some(json) => serde_json::from_str(&json).map_err(|e| conversion_error(14, e.to_string()))?,
                        None => Vec::new(),
                    },
                    error: row.get(11)?,
                    started_at: parse_ts_col(row, 12)?,
                    finished_at: parse_opt_ts_col(row, 13)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn insert_import_record(&self, record: &ImportRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sys_import_records (import_id, source_id, file_name, raw_file_path, headers,
                                             field_mappings, total, imported, skipped, errored,
                                             row_errors, date_from, date_to, remapped_from, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id.to_string(),
                record.source_id.to_string(),
                record.file_name,
                record.raw_file_path,
                serde_json::to_string(&record.headers)?,
                serde_json::to_string(&record.field_mappings)?,
                record.counts.total as i64,
                record.counts.imported as i64,
                record.counts.skipped as i64,
                record.counts.errored as i64,
                serde_json::to_string(&record.row_errors)?,
                record.date_from.map(|d| d.to_string()),
                record.date_to.map(|d| d.to_string()),
                record.remapped_from.map(|id| id.to_string()),
                fmt_ts(record.created_at),
            ],
        )?;
        Ok(())
    }

    /// Store the outcome of a run whose record was written up front
    pub fn update_import_record(&self, record: &ImportRecord) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE sys_import_records
             SET total = ?, imported = ?, skipped = ?, errored = ?, row_errors = ?,
                 date_from = ?, date_to = ?
             WHERE import_id = ?",
            params![
                record.counts.total as i64,
                record.counts.imported as i64,
                record.counts.skipped as i64,
                record.counts.errored as i64,
                serde_json::to_string(&record.row_errors)?,
                record.date_from.map(|d| d.to_string()),
                record.date_to.map(|d| d.to_string()),
                record.id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(Error::not_found(format!("Import {}", record.id)));
        }
        Ok(())
    }

    pub fn delete_import_record(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sys_import_records WHERE import_id = ?", [id.to_string()])?;
        Ok(())
    }

    /// Retire the live rows written by `import_ids`; returns how many
    pub fn supersede_import_rows(&self, source_id: Uuid, import_ids: &[Uuid], at: DateTime<Utc>) -> Result<usize> {
        if import_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE sys_transactions SET superseded_at = CAST(? AS TIMESTAMP)
             WHERE source_id = ? AND superseded_at IS NULL AND import_job_id IN ({})",
            vec!["?"; import_ids.len()].join(", ")
        );
        let mut args = vec![fmt_ts(at), source_id.to_string()];
        args.extend(import_ids.iter().map(Uuid::to_string));
        Ok(conn.execute(&sql, params_from_iter(args))?)
    }

    /// Undo [`Self::supersede_import_rows`] for rows that have no live
    /// replacement; returns how many came back
    pub fn restore_import_rows(&self, source_id: Uuid, import_ids: &[Uuid], at: DateTime<Utc>) -> Result<usize> {
        if import_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE sys_transactions SET superseded_at = NULL
             WHERE source_id = ? AND superseded_at = CAST(? AS TIMESTAMP) AND import_job_id IN ({})
               AND dedupe_hash NOT IN (
                   SELECT dedupe_hash FROM sys_transactions WHERE source_id = ? AND superseded_at IS NULL
               )",
            vec!["?"; import_ids.len()].join(", ")
        );
        let source = source_id.to_string();
        let mut args = vec![source.clone(), fmt_ts(at)];
        args.extend(import_ids.iter().map(Uuid::to_string));
        args.push(source);
        Ok(conn.execute(&sql, params_from_iter(args))?)
    }

    pub fn get_import_record(&self, id: Uuid) -> Result<Option<ImportRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_import_records WHERE import_id = ?",
            IMPORT_COLUMNS
        ))?;
        let mut rows = stmt.query_map([id.to_string()], row_to_import_record)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_import_records(&self, source_id: Option<Uuid>) -> Result<Vec<ImportRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_import_records WHERE ? IS NULL OR source_id = ? ORDER BY created_at DESC",
            IMPORT_COLUMNS
        ))?;
        let source = source_id.map(|s| s.to_string());
        let records = stmt
            .query_map(params![source, source], row_to_import_record)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(records)
    }

    // === Notification outbox ===

    pub fn list_notifications(&self, undelivered_only: bool, limit: usize) -> Result<Vec<SyncEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT CAST(payload AS VARCHAR) FROM sys_notifications
             WHERE NOT ? OR delivered_at IS NULL
             ORDER BY created_at DESC
             LIMIT ?",
        )?;
        let payloads = stmt
            .query_map(params![undelivered_only, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<duckdb::Result<Vec<_>>>()?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(Error::from))
            .collect()
    }

    /// Mark every undelivered notification as handed off
    pub fn mark_notifications_delivered(&self) -> Result<usize> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE sys_notifications SET delivered_at = ? WHERE delivered_at IS NULL",
            [fmt_ts(Utc::now())],
        )?;
        Ok(rows)
    }
}

impl TransactionStore for DuckDbRepository {
    fn max_keys_per_query(&self) -> usize {
        MAX_KEYS_PER_QUERY
    }

    fn existing_hashes(&self, source_id: Uuid, hashes: &[String]) -> Result<HashSet<String>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        if hashes.len() > MAX_KEYS_PER_QUERY {
            return Err(Error::database(format!(
                "Duplicate check takes at most {} keys, got {}",
                MAX_KEYS_PER_QUERY,
                hashes.len()
            )));
        }

        let conn = self.lock()?;
        let placeholders = vec!["?"; hashes.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT dedupe_hash FROM sys_transactions
             WHERE source_id = ? AND superseded_at IS NULL AND dedupe_hash IN ({})",
            placeholders
        );
        let source = source_id.to_string();
        let args = std::iter::once(source.as_str()).chain(hashes.iter().map(String::as_str));

        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, String>(0))?
            .collect::<duckdb::Result<HashSet<_>>>()?;
        Ok(found)
    }

    fn insert_batch(&self, transactions: &[Transaction]) -> Result<usize> {
        if transactions.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sys_transactions (transaction_id, source_id, transaction_date, amount, currency,
                                               name, description, counterparty_name, counterparty_iban,
                                               reference, dedupe_hash, import_job_id, sync_job_id, original,
                                               superseded_at, created_at)
                 SELECT ?, ?, CAST(? AS DATE), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CAST(? AS JSON), NULL, CAST(? AS TIMESTAMP)
                 WHERE NOT EXISTS (
                     SELECT 1 FROM sys_transactions
                     WHERE source_id = ? AND dedupe_hash = ? AND superseded_at IS NULL
                 )",
            )?;

            for t in transactions {
                let source = t.source_id.to_string();
                inserted += stmt.execute(params![
                    t.id.to_string(),
                    source,
                    t.date.to_string(),
                    t.amount,
                    t.currency,
                    t.name,
                    t.description,
                    t.counterparty_name,
                    t.counterparty_iban,
                    t.reference,
                    t.dedupe_hash,
                    t.import_job_id.map(|id| id.to_string()),
                    t.sync_job_id.map(|id| id.to_string()),
                    t.original.to_string(),
                    fmt_ts(t.created_at),
                    source,
                    t.dedupe_hash,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }
}

impl NotificationSink for DuckDbRepository {
    fn emit(&self, event: &SyncEvent) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sys_notifications (notification_id, source_id, kind, message, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                event.source_id.to_string(),
                event.kind.as_str(),
                event.message,
                serde_json::to_string(event)?,
                fmt_ts(event.created_at),
            ],
        )?;
        Ok(())
    }

    fn last_emitted(&self, source_id: Uuid, kind: EventKind) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(created_at)::VARCHAR FROM sys_notifications WHERE source_id = ? AND kind = ?",
            params![source_id.to_string(), kind.as_str()],
            |row| row.get(0),
        )?;
        latest
            .map(|s| parse_ts(&s).ok_or_else(|| Error::database(format!("Bad timestamp: {}", s))))
            .transpose()
    }
}

// Row mapping

fn conversion_error(idx: usize, msg: impl Into<String>) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(
        idx,
        duckdb::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())),
    )
}

fn parse_uuid(row: &Row, idx: usize) -> duckdb::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e.to_string()))
}

fn parse_opt_uuid(row: &Row, idx: usize) -> duckdb::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn parse_date_col(row: &Row, idx: usize) -> duckdb::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_error(idx, e.to_string()))
}

fn parse_opt_date_col(row: &Row, idx: usize) -> duckdb::Result<Option<NaiveDate>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn parse_ts_col(row: &Row, idx: usize) -> duckdb::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).ok_or_else(|| conversion_error(idx, format!("bad timestamp {}", s)))
}

fn parse_opt_ts_col(row: &Row, idx: usize) -> duckdb::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(&s).ok_or_else(|| conversion_error(idx, format!("bad timestamp {}", s))))
        .transpose()
}

fn parse_json_col<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> duckdb::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e.to_string()))
}

fn counts_from(row: &Row, start: usize) -> duckdb::Result<IngestCounts> {
    Ok(IngestCounts {
        total: row.get::<_, i64>(start)? as usize,
        imported: row.get::<_, i64>(start + 1)? as usize,
        skipped: row.get::<_, i64>(start + 2)? as usize,
        errored: row.get::<_, i64>(start + 3)? as usize,
    })
}

fn row_to_source(row: &Row) -> duckdb::Result<Source> {
    let kind: String = row.get(4)?;
    let mappings: Option<String> = row.get(5)?;
    Ok(Source {
        id: parse_uuid(row, 0)?,
        name: row.get(1)?,
        iban: row.get(2)?,
        currency: row.get(3)?,
        kind: kind.parse().map_err(|e: String| conversion_error(4, e))?,
        field_mappings: mappings
            .map(|m| serde_json::from_str::<Vec<FieldMapping>>(&m).map_err(|e| conversion_error(5, e.to_string())))
            .transpose()?
            .filter(|m| !m.is_empty()),
        created_at: parse_ts_col(row, 6)?,
        updated_at: parse_ts_col(row, 7)?,
    })
}

fn row_to_connection(row: &Row) -> duckdb::Result<ProviderConnection> {
    let status: String = row.get(3)?;
    Ok(ProviderConnection {
        id: parse_uuid(row, 0)?,
        source_id: parse_uuid(row, 1)?,
        institution_id: row.get(2)?,
        status: status.parse().map_err(|e: String| conversion_error(3, e))?,
        credentials: parse_json_col(row, 4)?,
        external_account_id: row.get(5)?,
        auth_url: row.get(6)?,
        link_expires_at: parse_opt_ts_col(row, 7)?,
        expires_at: parse_opt_ts_col(row, 8)?,
        last_sync_at: parse_opt_ts_col(row, 9)?,
        last_sync_error: row.get(10)?,
        created_at: parse_ts_col(row, 11)?,
        updated_at: parse_ts_col(row, 12)?,
    })
}

fn row_to_transaction(row: &Row) -> duckdb::Result<Transaction> {
    let original: Option<String> = row.get(13)?;
    Ok(Transaction {
        id: parse_uuid(row, 0)?,
        source_id: parse_uuid(row, 1)?,
        date: parse_date_col(row, 2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        name: row.get(5)?,
        description: row.get(6)?,
        counterparty_name: row.get(7)?,
        counterparty_iban: row.get(8)?,
        reference: row.get(9)?,
        dedupe_hash: row.get(10)?,
        import_job_id: parse_opt_uuid(row, 11)?,
        sync_job_id: parse_opt_uuid(row, 12)?,
        original: original
            .map(|o| serde_json::from_str(&o).map_err(|e| conversion_error(13, e.to_string())))
            .transpose()?
            .unwrap_or(serde_json::Value::Null),
        superseded_at: parse_opt_ts_col(row, 14)?,
        created_at: parse_ts_col(row, 15)?,
    })
}

fn row_to_import_record(row: &Row) -> duckdb::Result<ImportRecord> {
    Ok(ImportRecord {
        id: parse_uuid(row, 0)?,
        source_id: parse_uuid(row, 1)?,
        file_name: row.get(2)?,
        raw_file_path: row.get(3)?,
        headers: parse_json_col(row, 4)?,
        field_mappings: parse_json_col(row, 5)?,
        counts: counts_from(row, 6)?,
        row_errors: parse_json_col(row, 10)?,
        date_from: parse_opt_date_col(row, 11)?,
        date_to: parse_opt_date_col(row, 12)?,
        remapped_from: parse_opt_uuid(row, 13)?,
        created_at: parse_ts_col(row, 14)?,
    })
}

// Helper functions

/// Timestamps are stored as naive UTC
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IncomingTransaction, IngestOrigin, RowError, SourceKind};
    use chrono::Duration as ChronoDuration;

    fn repo_with_source() -> (DuckDbRepository, Source) {
        let repo = DuckDbRepository::in_memory().unwrap();
        let source = Source::new("Giro", SourceKind::Csv, "EUR").with_iban("DE89370400440532013000");
        repo.upsert_source(&source).unwrap();
        (repo, source)
    }

    fn tx(source: &Source, day: u32, amount: i64) -> Transaction {
        IncomingTransaction::new(NaiveDate::from_ymd_opt(2024, 1, day).unwrap(), amount, "Shop")
            .into_transaction(source, IngestOrigin::Import(Uuid::new_v4()), Utc::now())
    }

    #[test]
    fn test_source_round_trip() {
        let (repo, source) = repo_with_source();
        let loaded = repo.get_source(source.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Giro");
        assert_eq!(loaded.iban.as_deref(), Some("DE89370400440532013000"));
        assert_eq!(repo.resolve_source("Giro").unwrap().id, source.id);
        assert!(repo.resolve_source("Nope").is_err());
    }

    #[test]
    fn test_guarded_insert_skips_existing_hash() {
        let (repo, source) = repo_with_source();
        let first = tx(&source, 2, -500);
        let mut again = tx(&source, 2, -500);
        again.id = Uuid::new_v4();

        assert_eq!(repo.insert_batch(&[first.clone()]).unwrap(), 1);
        assert_eq!(repo.insert_batch(&[again]).unwrap(), 0);
        assert_eq!(repo.transaction_count(source.id).unwrap(), 1);

        let stored = repo.get_transactions_by_source(source.id).unwrap();
        assert_eq!(stored[0].dedupe_hash, first.dedupe_hash);
        assert_eq!(stored[0].amount, -500);
    }

    #[test]
    fn test_existing_hashes_rejects_oversized_queries() {
        let (repo, source) = repo_with_source();
        let hashes: Vec<String> = (0..MAX_KEYS_PER_QUERY + 1).map(|i| i.to_string()).collect();
        assert!(repo.existing_hashes(source.id, &hashes).is_err());
    }

    #[test]
    fn test_existing_hashes_scoped_to_source() {
        let (repo, source) = repo_with_source();
        let other = Source::new("Other", SourceKind::Csv, "EUR");
        repo.upsert_source(&other).unwrap();

        let t = tx(&source, 3, 100);
        repo.insert_batch(&[t.clone()]).unwrap();

        let found = repo.existing_hashes(source.id, &[t.dedupe_hash.clone()]).unwrap();
        assert!(found.contains(&t.dedupe_hash));
        assert!(repo.existing_hashes(other.id, &[t.dedupe_hash]).unwrap().is_empty());
    }

    #[test]
    fn test_supersede_and_restore_import_rows() {
        let (repo, source) = repo_with_source();
        let import_id = Uuid::new_v4();
        let origin = IngestOrigin::Import(import_id);
        let rows: Vec<Transaction> = [(4, -100), (5, -200)]
            .iter()
            .map(|&(day, amount)| {
                IncomingTransaction::new(NaiveDate::from_ymd_opt(2024, 1, day).unwrap(), amount, "Shop")
                    .into_transaction(&source, origin, Utc::now())
            })
            .collect();
        repo.insert_batch(&rows).unwrap();

        let at = Utc::now();
        assert_eq!(repo.supersede_import_rows(source.id, &[import_id], at).unwrap(), 2);
        assert_eq!(repo.transaction_count(source.id).unwrap(), 0);
        assert!(repo
            .existing_hashes(source.id, &[rows[0].dedupe_hash.clone()])
            .unwrap()
            .is_empty());

        // one row was replaced by a live copy, the other comes back
        let mut replacement = rows[0].clone();
        replacement.id = Uuid::new_v4();
        assert_eq!(repo.insert_batch(&[replacement]).unwrap(), 1);
        assert_eq!(repo.restore_import_rows(source.id, &[import_id], at).unwrap(), 1);
        assert_eq!(repo.transaction_count(source.id).unwrap(), 2);
        assert_eq!(repo.supersede_import_rows(source.id, &[], at).unwrap(), 0);
    }

    #[test]
    fn test_sync_job_keeps_row_errors() {
        let (repo, source) = repo_with_source();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut job = SyncJob::start(source.id, Uuid::new_v4(), SyncTrigger::Manual, (day, day), Utc::now());
        repo.upsert_sync_job(&job).unwrap();

        job.row_errors.push(RowError::from_json(
            2,
            "transaction without booking or value date",
            &serde_json::json!({"transactionId": "tx-2"}),
        ));
        job.counts = IngestCounts {
            total: 1,
            errored: 1,
            ..Default::default()
        };
        job.status = JobStatus::Completed;
        repo.upsert_sync_job(&job).unwrap();

        let stored = repo.list_sync_jobs(Some(source.id), 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].counts.errored, 1);
        assert_eq!(stored[0].row_errors, job.row_errors);
    }

    #[test]
    fn test_notification_last_emitted() {
        let (repo, source) = repo_with_source();
        assert!(repo
            .last_emitted(source.id, EventKind::ReauthRequired)
            .unwrap()
            .is_none());

        let at = Utc::now() - ChronoDuration::hours(3);
        repo.emit(&SyncEvent::new(EventKind::ReauthRequired, source.id, "reconnect", at))
            .unwrap();

        let last = repo
            .last_emitted(source.id, EventKind::ReauthRequired)
            .unwrap()
            .unwrap();
        assert!((last - at).num_seconds().abs() < 1);
        assert!(repo
            .last_emitted(source.id, EventKind::SyncFailed)
            .unwrap()
            .is_none());
        assert_eq!(repo.list_notifications(true, 10).unwrap().len(), 1);
        assert_eq!(repo.mark_notifications_delivered().unwrap(), 1);
        assert!(repo.list_notifications(true, 10).unwrap().is_empty());
    }

    #[test]
    fn test_parse_ts_formats() {
        assert!(parse_ts("2024-01-02 03:04:05.123456").is_some());
        assert!(parse_ts("2024-01-02 03:04:05").is_some());
        assert!(parse_ts("2024-01-02T03:04:05+00:00").is_some());
        assert!(parse_ts("garbage").is_none());
    }
}
