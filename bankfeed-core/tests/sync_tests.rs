//! Integration tests for provider sync
//!
//! A fake provider stands in for the bank APIs; every database operation runs
//! against a real DuckDB file.
//!
//! Run with: cargo test --test sync_tests -- --nocapture

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use bankfeed_core::adapters::duckdb::DuckDbRepository;
use bankfeed_core::config::SyncSettings;
use bankfeed_core::domain::result::{Error, Result};
use bankfeed_core::domain::{
    AccountKind, ConnectionStatus, EventKind, IncomingTransaction, IngestOrigin, Institution, JobStatus,
    ProviderAccount, ProviderConnection, ProviderCredentials, ProviderId, RowError, Source, SourceKind,
};
use bankfeed_core::ports::{
    BankingProvider, CallbackOutcome, CallbackParams, ConnectionRequest, ConnectionStart, FetchedTransactions,
    RefreshOutcome,
};
use bankfeed_core::services::{
    ConnectionService, IngestPipeline, ProviderRegistry, SourceService, SourceSyncStatus, SyncService,
};

// ============================================================================
// Fake provider
// ============================================================================

#[derive(Default)]
struct FakeProvider {
    /// Transactions per provider account id
    transactions: Mutex<HashMap<String, Vec<IncomingTransaction>>>,
    failing_accounts: Mutex<HashSet<String>>,
    /// Accounts answering 429 with the given Retry-After seconds
    rate_limited_accounts: Mutex<HashMap<String, u64>>,
    /// Unmappable records per provider account id
    rejected: Mutex<HashMap<String, Vec<RowError>>>,
    /// What the pre-fetch token check answers; `Unchanged` when unset
    refresh: Mutex<Option<RefreshOutcome>>,
    /// Accounts returned when a consent is granted
    shared_accounts: Vec<ProviderAccount>,
    fetches: AtomicUsize,
    windows: Mutex<Vec<(NaiveDate, NaiveDate)>>,
}

impl FakeProvider {
    fn with_accounts(shared_accounts: Vec<ProviderAccount>) -> Self {
        Self {
            shared_accounts,
            ..Default::default()
        }
    }

    fn set_transactions(&self, account_id: &str, transactions: Vec<IncomingTransaction>) {
        self.transactions
            .lock()
            .unwrap()
            .insert(account_id.to_string(), transactions);
    }

    fn fail(&self, account_id: &str) {
        self.failing_accounts.lock().unwrap().insert(account_id.to_string());
    }

    fn rate_limit(&self, account_id: &str, retry_after_secs: u64) {
        self.rate_limited_accounts
            .lock()
            .unwrap()
            .insert(account_id.to_string(), retry_after_secs);
    }

    fn reject(&self, account_id: &str, rejected: Vec<RowError>) {
        self.rejected.lock().unwrap().insert(account_id.to_string(), rejected);
    }

    fn answer_refresh(&self, outcome: RefreshOutcome) {
        *self.refresh.lock().unwrap() = Some(outcome);
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn credentials() -> ProviderCredentials {
        ProviderCredentials::GoCardless {
            requisition_id: "req-fake".to_string(),
            agreement_id: None,
        }
    }

    fn linked(&self) -> CallbackOutcome {
        CallbackOutcome {
            status: ConnectionStatus::Linked,
            account_ids: self.shared_accounts.iter().map(|a| a.external_id.clone()).collect(),
            credentials: Self::credentials(),
            consent_expires_at: Some(Utc::now() + Duration::days(90)),
        }
    }
}

impl BankingProvider for FakeProvider {
    fn id(&self) -> ProviderId {
        ProviderId::GoCardless
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn supported_countries(&self) -> &[&'static str] {
        &["GB", "DE"]
    }

    fn list_institutions(&self, _country: &str) -> Result<Vec<Institution>> {
        Ok(Vec::new())
    }

    fn create_connection(&self, request: &ConnectionRequest) -> Result<ConnectionStart> {
        Ok(ConnectionStart {
            connection_id: request.connection_id,
            auth_url: format!("https://bank.example/auth/{}", request.connection_id),
            expires_at: Utc::now() + Duration::hours(1),
            credentials: Self::credentials(),
        })
    }

    fn handle_callback(&self, _connection: &ProviderConnection, params: &CallbackParams) -> Result<CallbackOutcome> {
        if params.error.is_some() {
            return Ok(CallbackOutcome {
                status: ConnectionStatus::Rejected,
                account_ids: Vec::new(),
                credentials: Self::credentials(),
                consent_expires_at: None,
            });
        }
        Ok(self.linked())
    }

    fn connection_status(&self, _connection: &ProviderConnection) -> Result<CallbackOutcome> {
        Ok(self.linked())
    }

    fn get_accounts(&self, _connection: &ProviderConnection) -> Result<Vec<ProviderAccount>> {
        Ok(self.shared_accounts.clone())
    }

    fn fetch_transactions(
        &self,
        _connection: &ProviderConnection,
        account_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<FetchedTransactions> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.windows.lock().unwrap().push((date_from, date_to));
        if self.failing_accounts.lock().unwrap().contains(account_id) {
            return Err(Error::provider("gocardless", "Internal server error"));
        }
        if let Some(secs) = self.rate_limited_accounts.lock().unwrap().get(account_id) {
            return Err(Error::RateLimited {
                provider: "gocardless".to_string(),
                retry_after: Some(StdDuration::from_secs(*secs)),
            });
        }
        let transactions = self
            .transactions
            .lock()
            .unwrap()
            .get(account_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t.date >= date_from && t.date <= date_to)
            .collect();
        Ok(FetchedTransactions {
            transactions,
            rejected: self.rejected.lock().unwrap().get(account_id).cloned().unwrap_or_default(),
        })
    }

    fn refresh_token_if_needed(&self, _connection: &ProviderConnection, _now: DateTime<Utc>) -> Result<RefreshOutcome> {
        Ok(self.refresh.lock().unwrap().clone().unwrap_or(RefreshOutcome::Unchanged))
    }

    fn revoke_connection(&self, _connection: &ProviderConnection) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    _dir: TempDir,
    repo: Arc<DuckDbRepository>,
    provider: Arc<FakeProvider>,
    sync: SyncService,
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

fn harness_with(provider: FakeProvider) -> Harness {
    let dir = TempDir::new().unwrap();
    let repo = DuckDbRepository::new(&dir.path().join("test.duckdb")).expect("Failed to create repository");
    repo.ensure_schema().expect("Failed to initialize schema");
    let repo = Arc::new(repo);

    let provider = Arc::new(provider);
    let registry = ProviderRegistry::with_providers(vec![provider.clone() as Arc<dyn BankingProvider>]);
    let sync = SyncService::new(Arc::clone(&repo), registry, SyncSettings::default());
    Harness {
        _dir: dir,
        repo,
        provider,
        sync,
    }
}

fn harness() -> Harness {
    harness_with(FakeProvider::default())
}

/// A provider source with a linked connection to `account_id`
fn linked_source(h: &Harness, name: &str, account_id: &str, expires_at: DateTime<Utc>) -> (Source, ProviderConnection) {
    let source = Source::new(name, SourceKind::Provider, "EUR").with_iban(format!("DE00{}", account_id));
    h.repo.upsert_source(&source).unwrap();

    let created = now() - Duration::days(30);
    let connection = ProviderConnection {
        id: Uuid::new_v4(),
        source_id: source.id,
        institution_id: "SANDBOXFINANCE_SFIN0000".to_string(),
        status: ConnectionStatus::Linked,
        credentials: FakeProvider::credentials(),
        external_account_id: Some(account_id.to_string()),
        auth_url: None,
        link_expires_at: None,
        expires_at: Some(expires_at),
        last_sync_at: None,
        last_sync_error: None,
        created_at: created,
        updated_at: created,
    };
    h.repo.upsert_connection(&connection).unwrap();
    (source, connection)
}

fn three_transactions() -> Vec<IncomingTransaction> {
    vec![
        IncomingTransaction::new(day(1), -1250, "REWE").with_reference("Card 1234"),
        IncomingTransaction::new(day(3), 250000, "ACME GmbH").with_reference("Salary March"),
        IncomingTransaction::new(day(5), -4999, "Netflix"),
    ]
}

fn notifications_of(h: &Harness, kind: EventKind) -> usize {
    h.repo
        .list_notifications(false, 100)
        .unwrap()
        .iter()
        .filter(|e| e.kind == kind)
        .count()
}

// ============================================================================
// Re-sync and scheduling
// ============================================================================

#[test]
fn test_resync_imports_nothing_new() {
    let h = harness();
    let (source, _) = linked_source(&h, "Giro", "acc-1", now() + Duration::days(60));
    h.provider.set_transactions("acc-1", three_transactions());

    let first = h.sync.sync_source_at("Giro", now()).unwrap();
    assert_eq!(first.status, SourceSyncStatus::Synced);
    assert_eq!(first.counts.imported, 3);

    // Same window again: everything is a known duplicate
    let second = h.sync.sync_source_at("Giro", now()).unwrap();
    assert_eq!(second.counts.imported, 0);
    assert_eq!(second.counts.skipped, 3);
    assert!(second.counts.is_balanced());
    assert_eq!(h.repo.transaction_count(source.id).unwrap(), 3);
}

#[test]
fn test_scheduled_run_respects_resync_interval_and_overlap() {
    let h = harness();
    let (_, connection) = linked_source(&h, "Giro", "acc-1", now() + Duration::days(60));
    h.provider.set_transactions("acc-1", three_transactions());

    let first = h.sync.run_scheduled_at(now()).unwrap();
    assert_eq!(first.synced, 1);
    assert_eq!(first.imported, 3);
    // First sync looks back the initial 90 days
    assert_eq!(first.results[0].window_from, Some(NaiveDate::from_ymd_opt(2023, 12, 11).unwrap()));

    let early = h.sync.run_scheduled_at(now() + Duration::hours(1)).unwrap();
    assert_eq!(early.results[0].status, SourceSyncStatus::SkippedRecent);
    assert_eq!(h.provider.fetch_count(), 1);

    let later = h.sync.run_scheduled_at(now() + Duration::hours(7)).unwrap();
    assert_eq!(later.synced, 1);
    assert_eq!(later.imported, 0);
    // Re-fetch starts two days before the last successful sync
    assert_eq!(later.results[0].window_from, Some(day(8)));
    assert_eq!(h.provider.windows.lock().unwrap().last().copied(), Some((day(8), day(10))));

    let stored = h.repo.get_connection(connection.id).unwrap().unwrap();
    assert_eq!(stored.last_sync_at, Some(now() + Duration::hours(7)));
}

#[test]
fn test_new_transactions_notification_only_when_something_imported() {
    let h = harness();
    linked_source(&h, "Giro", "acc-1", now() + Duration::days(60));
    h.provider.set_transactions("acc-1", three_transactions());

    h.sync.run_scheduled_at(now()).unwrap();
    assert_eq!(notifications_of(&h, EventKind::NewTransactions), 1);

    h.sync.run_scheduled_at(now() + Duration::hours(7)).unwrap();
    assert_eq!(notifications_of(&h, EventKind::NewTransactions), 1);

    let event = h
        .repo
        .list_notifications(false, 10)
        .unwrap()
        .into_iter()
        .find(|e| e.kind == EventKind::NewTransactions)
        .unwrap();
    assert_eq!(event.imported, Some(3));
}

#[test]
fn test_sync_jobs_are_recorded() {
    let h = harness();
    let (source, _) = linked_source(&h, "Giro", "acc-1", now() + Duration::days(60));
    h.provider.set_transactions("acc-1", three_transactions());

    let result = h.sync.sync_source_at("Giro", now()).unwrap();
    let jobs = h.sync.recent_jobs(Some(source.id), 10).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(Some(jobs[0].id), result.job_id);
    assert_eq!(jobs[0].counts.imported, 3);
    assert!(jobs[0].finished_at.is_some());

    let stored = h.repo.get_transactions_by_source(source.id).unwrap();
    assert!(stored.iter().all(|t| t.sync_job_id == result.job_id && t.import_job_id.is_none()));
}

#[test]
fn test_unmappable_provider_records_are_counted_and_kept() {
    let h = harness();
    let (source, _) = linked_source(&h, "Giro", "acc-1", now() + Duration::days(60));
    h.provider.set_transactions("acc-1", three_transactions());
    let broken = serde_json::json!({"transactionId": "tx-broken", "transactionAmount": {"amount": "-1.00"}});
    h.provider.reject(
        "acc-1",
        vec![RowError::from_json(4, "transaction without booking or value date", &broken)],
    );

    let result = h.sync.sync_source_at("Giro", now()).unwrap();
    assert_eq!(result.status, SourceSyncStatus::Synced);
    assert_eq!(result.counts.total, 4);
    assert_eq!(result.counts.imported, 3);
    assert_eq!(result.counts.errored, 1);
    assert!(result.counts.is_balanced());

    let jobs = h.sync.recent_jobs(Some(source.id), 10).unwrap();
    assert_eq!(jobs[0].counts, result.counts);
    assert_eq!(jobs[0].row_errors.len(), 1);
    assert_eq!(jobs[0].row_errors[0].row, 4);
    assert_eq!(jobs[0].row_errors[0].raw["transactionId"], "tx-broken");
    assert_eq!(h.repo.transaction_count(source.id).unwrap(), 3);
}

#[test]
fn test_rate_limited_source_fails_without_retry_in_same_run() {
    let h = harness();
    let (source, connection) = linked_source(&h, "Giro", "acc-1", now() + Duration::days(60));
    linked_source(&h, "Savings", "acc-2", now() + Duration::days(60));
    h.provider.set_transactions("acc-1", three_transactions());
    h.provider.set_transactions("acc-2", three_transactions());
    h.provider.rate_limit("acc-1", 120);

    let run = h.sync.run_scheduled_at(now()).unwrap();
    assert_eq!(run.failed, 1);
    assert_eq!(run.synced, 1);
    let limited = run.results.iter().find(|r| r.source_id == source.id).unwrap();
    assert_eq!(limited.status, SourceSyncStatus::Failed);
    assert_eq!(limited.retry_after_secs, Some(120));
    // One fetch per source: the limited one is not retried within the run
    assert_eq!(h.provider.fetch_count(), 2);

    let stored = h.repo.get_connection(connection.id).unwrap().unwrap();
    assert!(stored.last_sync_at.is_none());
    assert_eq!(stored.status, ConnectionStatus::Linked);
    assert_eq!(h.repo.transaction_count(source.id).unwrap(), 0);
    let jobs = h.sync.recent_jobs(Some(source.id), 10).unwrap();
    assert_eq!(jobs[0].status, JobStatus::Failed);

    // The next run picks it up again
    h.provider.rate_limited_accounts.lock().unwrap().clear();
    let next = h.sync.run_scheduled_at(now() + Duration::hours(1)).unwrap();
    assert_eq!(next.synced, 1);
    assert_eq!(next.skipped, 1);
    assert_eq!(h.provider.fetch_count(), 3);
    assert_eq!(h.repo.transaction_count(source.id).unwrap(), 3);
}

#[test]
fn test_rejected_token_refresh_requires_reauth_without_fetching() {
    let h = harness();
    let (source, connection) = linked_source(&h, "Giro", "acc-1", now() + Duration::days(60));
    h.provider.set_transactions("acc-1", three_transactions());
    h.provider
        .answer_refresh(RefreshOutcome::ReauthRequired("refresh token revoked".to_string()));

    let run = h.sync.run_scheduled_at(now()).unwrap();
    assert_eq!(run.reauth_required, 1);
    assert_eq!(run.results[0].status, SourceSyncStatus::ReauthRequired);
    assert!(run.results[0].error.as_deref().unwrap().contains("refresh token revoked"));
    assert_eq!(h.provider.fetch_count(), 0);
    assert_eq!(notifications_of(&h, EventKind::ReauthRequired), 1);

    let stored = h.repo.get_connection(connection.id).unwrap().unwrap();
    assert_eq!(stored.status, ConnectionStatus::Expired);
    assert!(stored.last_sync_at.is_none());
    assert_eq!(h.repo.transaction_count(source.id).unwrap(), 0);

    let err = h.sync.sync_source_at("Giro", now()).unwrap_err();
    assert!(err.is_reauth());
    assert_eq!(h.provider.fetch_count(), 0);
}

// ============================================================================
// Consent and reauth
// ============================================================================

#[test]
fn test_expired_consent_never_fetches_and_notifies_once_per_day() {
    let h = harness();
    let (source, connection) = linked_source(&h, "Giro", "acc-1", now() - Duration::days(1));
    h.provider.set_transactions("acc-1", three_transactions());

    let run = h.sync.run_scheduled_at(now()).unwrap();
    assert_eq!(run.reauth_required, 1);
    assert_eq!(run.results[0].status, SourceSyncStatus::ReauthRequired);
    assert_eq!(h.provider.fetch_count(), 0);
    assert_eq!(notifications_of(&h, EventKind::ReauthRequired), 1);

    let stored = h.repo.get_connection(connection.id).unwrap().unwrap();
    assert_eq!(stored.status, ConnectionStatus::Expired);
    assert!(stored.last_sync_at.is_none());

    // Still blocked; the cooldown holds back a second notification
    h.sync.run_scheduled_at(now() + Duration::hours(7)).unwrap();
    assert_eq!(notifications_of(&h, EventKind::ReauthRequired), 1);

    h.sync.run_scheduled_at(now() + Duration::hours(25)).unwrap();
    assert_eq!(notifications_of(&h, EventKind::ReauthRequired), 2);

    assert_eq!(h.provider.fetch_count(), 0);
    assert_eq!(h.repo.transaction_count(source.id).unwrap(), 0);
}

#[test]
fn test_manual_sync_returns_reauth_error_without_notification() {
    let h = harness();
    linked_source(&h, "Giro", "acc-1", now() - Duration::days(1));

    let err = h.sync.sync_source_at("Giro", now()).unwrap_err();
    assert!(err.is_reauth());
    assert_eq!(h.provider.fetch_count(), 0);
    assert_eq!(notifications_of(&h, EventKind::ReauthRequired), 0);
}

#[test]
fn test_reminder_sent_once_per_day() {
    let h = harness();
    let (source, _) = linked_source(&h, "Giro", "acc-1", now() + Duration::days(5));
    linked_source(&h, "Savings", "acc-2", now() + Duration::days(40));

    let first = h.sync.run_reminders_at(now()).unwrap();
    assert_eq!(first.checked, 2);
    assert_eq!(first.reminded, vec![source.id]);

    let again = h.sync.run_reminders_at(now() + Duration::hours(3)).unwrap();
    assert!(again.reminded.is_empty());

    let tomorrow = h.sync.run_reminders_at(now() + Duration::days(1)).unwrap();
    assert_eq!(tomorrow.reminded, vec![source.id]);

    let event = h
        .repo
        .list_notifications(false, 10)
        .unwrap()
        .into_iter()
        .find(|e| e.kind == EventKind::ReauthReminder)
        .unwrap();
    assert!(event.days_remaining.is_some_and(|d| d <= 5));
}

// ============================================================================
// Failure isolation
// ============================================================================

#[test]
fn test_failing_source_does_not_block_the_others() {
    let h = harness();
    let mut connections = Vec::new();
    for i in 1..=5 {
        let account = format!("acc-{}", i);
        let (_, connection) = linked_source(&h, &format!("Account {}", i), &account, now() + Duration::days(60));
        h.provider.set_transactions(&account, three_transactions());
        connections.push(connection);
    }
    h.provider.fail("acc-3");

    let run = h.sync.run_scheduled_at(now()).unwrap();
    assert_eq!(run.results.len(), 5);
    assert_eq!(run.synced, 4);
    assert_eq!(run.failed, 1);
    assert_eq!(run.imported, 12);

    for (i, connection) in connections.iter().enumerate() {
        let stored = h.repo.get_connection(connection.id).unwrap().unwrap();
        if i == 2 {
            assert!(stored.last_sync_at.is_none());
            assert!(stored.last_sync_error.as_deref().unwrap().contains("Internal server error"));
            assert_eq!(stored.status, ConnectionStatus::Linked);
        } else {
            assert_eq!(stored.last_sync_at, Some(now()));
            assert!(stored.last_sync_error.is_none());
        }
    }
    assert_eq!(notifications_of(&h, EventKind::SyncFailed), 1);

    // The failed source is retried on the next run; the rest are recent
    let retry = h.sync.run_scheduled_at(now() + Duration::hours(1)).unwrap();
    assert_eq!(retry.failed, 1);
    assert_eq!(retry.skipped, 4);
}

#[test]
fn test_manual_sync_of_unlinked_source_fails() {
    let h = harness();
    let sources = SourceService::new(Arc::clone(&h.repo));
    sources.create("Cash", SourceKind::Csv, "EUR", None).unwrap();

    let err = h.sync.sync_source_at("Cash", now()).unwrap_err();
    assert!(err.to_string().contains("not connected"));
    assert!(h.sync.sync_source_at("Nope", now()).is_err());
}

// ============================================================================
// Connections
// ============================================================================

fn account(id: &str, name: &str, iban: Option<&str>) -> ProviderAccount {
    ProviderAccount {
        external_id: id.to_string(),
        name: name.to_string(),
        iban: iban.map(str::to_string),
        currency: Some("EUR".to_string()),
        kind: AccountKind::Account,
    }
}

#[test]
fn test_consent_with_two_accounts_creates_second_source() {
    let h = harness_with(FakeProvider::with_accounts(vec![
        account("acc-1", "Giro", Some("DE89370400440532013000")),
        account("acc-2", "Savings", Some("DE89370400440532013001")),
    ]));
    let sources = SourceService::new(Arc::clone(&h.repo));
    let registry = ProviderRegistry::with_providers(vec![h.provider.clone() as Arc<dyn BankingProvider>]);
    let connections = ConnectionService::new(Arc::clone(&h.repo), registry);

    let origin = sources.create("Main", SourceKind::Csv, "EUR", None).unwrap();
    let started = connections
        .start_connection("Main", ProviderId::GoCardless, "SANDBOXFINANCE_SFIN0000", "http://localhost/cb", AccountKind::Account)
        .unwrap();
    assert_eq!(started.source_id, origin.id);
    assert_eq!(
        h.repo.get_connection(started.connection_id).unwrap().unwrap().status,
        ConnectionStatus::Pending
    );

    let done = connections
        .complete_connection(started.connection_id, &CallbackParams::default())
        .unwrap();
    assert_eq!(done.status, ConnectionStatus::Linked);
    assert_eq!(done.linked_sources.len(), 2);
    assert_eq!(done.linked_sources[0].id, origin.id);
    assert_eq!(done.linked_sources[0].kind, SourceKind::Provider);
    assert_eq!(done.linked_sources[0].iban.as_deref(), Some("DE89370400440532013000"));
    assert_eq!(done.linked_sources[1].name, "Savings");

    // Both accounts sync independently
    let today = Utc::now().date_naive();
    let recent: Vec<IncomingTransaction> = three_transactions()
        .into_iter()
        .enumerate()
        .map(|(i, mut t)| {
            t.date = today - Duration::days(i as i64 + 1);
            t
        })
        .collect();
    h.provider.set_transactions("acc-1", recent.clone());
    h.provider.set_transactions("acc-2", recent[..1].to_vec());
    let run = h.sync.run_scheduled_at(Utc::now()).unwrap();
    assert_eq!(run.synced, 2);
    assert_eq!(h.repo.transaction_count(origin.id).unwrap(), 3);
    assert_eq!(h.repo.transaction_count(done.linked_sources[1].id).unwrap(), 1);

    // Callbacks are idempotent once resolved
    let again = connections
        .complete_connection(started.connection_id, &CallbackParams::default())
        .unwrap();
    assert_eq!(again.status, ConnectionStatus::Linked);
    assert_eq!(sources.list().unwrap().len(), 2);
}

#[test]
fn test_linking_csv_source_keeps_its_dedupe_identity() {
    let h = harness_with(FakeProvider::with_accounts(vec![account(
        "acc-1",
        "Giro",
        Some("DE89370400440532013000"),
    )]));
    let sources = SourceService::new(Arc::clone(&h.repo));
    let registry = ProviderRegistry::with_providers(vec![h.provider.clone() as Arc<dyn BankingProvider>]);
    let connections = ConnectionService::new(Arc::clone(&h.repo), registry);

    // Rows imported from CSV before the bank was linked, no IBAN known
    let main = sources.create("Main", SourceKind::Csv, "EUR", None).unwrap();
    let today = Utc::now().date_naive();
    let recent: Vec<IncomingTransaction> = three_transactions()
        .into_iter()
        .enumerate()
        .map(|(i, mut t)| {
            t.date = today - Duration::days(i as i64 + 1);
            t
        })
        .collect();
    let csv = IngestPipeline::new(h.repo.as_ref())
        .run(&main, IngestOrigin::Import(Uuid::new_v4()), recent.clone(), None)
        .unwrap();
    assert_eq!(csv.counts.imported, 3);

    let started = connections
        .start_connection("Main", ProviderId::GoCardless, "BANK", "http://localhost/cb", AccountKind::Account)
        .unwrap();
    let done = connections
        .complete_connection(started.connection_id, &CallbackParams::default())
        .unwrap();
    assert_eq!(done.linked_sources[0].id, main.id);
    assert!(done.linked_sources[0].iban.is_none());

    // The bank sends the same rows the CSV already had
    h.provider.set_transactions("acc-1", recent);
    let synced = h.sync.sync_source_at("Main", Utc::now()).unwrap();
    assert_eq!(synced.counts.imported, 0);
    assert_eq!(synced.counts.skipped, 3);
    assert_eq!(h.repo.transaction_count(main.id).unwrap(), 3);
    assert!(h.repo.get_source(main.id).unwrap().unwrap().iban.is_none());
}

#[test]
fn test_denied_consent_and_disconnect() {
    let h = harness_with(FakeProvider::with_accounts(vec![account("acc-1", "Giro", None)]));
    let sources = SourceService::new(Arc::clone(&h.repo));
    let registry = ProviderRegistry::with_providers(vec![h.provider.clone() as Arc<dyn BankingProvider>]);
    let connections = ConnectionService::new(Arc::clone(&h.repo), registry);
    sources.create("Main", SourceKind::Csv, "EUR", None).unwrap();

    let denied = connections
        .start_connection("Main", ProviderId::GoCardless, "BANK", "http://localhost/cb", AccountKind::Account)
        .unwrap();
    let outcome = connections
        .complete_connection(
            denied.connection_id,
            &CallbackParams {
                code: None,
                error: Some("access_denied".to_string()),
            },
        )
        .unwrap();
    assert_eq!(outcome.status, ConnectionStatus::Rejected);
    assert!(outcome.linked_sources.is_empty());

    let granted = connections
        .start_connection("Main", ProviderId::GoCardless, "BANK", "http://localhost/cb", AccountKind::Account)
        .unwrap();
    connections
        .complete_connection(granted.connection_id, &CallbackParams::default())
        .unwrap();

    let view = connections.connection_status("Main").unwrap();
    assert_eq!(view.connection_id, granted.connection_id);
    assert_eq!(view.status, ConnectionStatus::Linked);
    assert!(!view.reauth.required);
    assert!(view.reauth.days_remaining.is_some_and(|d| d >= 89));

    let revoked = connections.disconnect("Main").unwrap();
    assert_eq!(revoked.status, ConnectionStatus::Revoked);
    assert!(h.repo.current_connection(revoked.source_id).unwrap().is_none());
    assert!(h.repo.list_active_connections().unwrap().is_empty());
}
