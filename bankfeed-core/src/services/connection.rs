//! Connection service - linking sources to banking providers
//!
//! A connection starts `pending` with an authorization URL. The callback (or
//! a status poll) resolves it; once linked, the first shared account stays on
//! the originating source and every further account gets a source of its own.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::adapters::duckdb::DuckDbRepository;
use crate::domain::result::{Error, Result};
use crate::domain::{
    AccountKind, ConnectionStatus, ProviderAccount, ProviderConnection, ProviderId, ReauthCheck, Source,
    SourceKind,
};
use crate::ports::{CallbackOutcome, CallbackParams, ConnectionRequest};
use crate::services::logging::{events, LogEvent, LoggingService};
use crate::services::registry::ProviderRegistry;

/// Returned when an authorization flow starts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedConnection {
    pub connection_id: Uuid,
    pub source_id: Uuid,
    pub provider: ProviderId,
    pub auth_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a callback or poll
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedConnection {
    pub connection_id: Uuid,
    pub status: ConnectionStatus,
    /// Sources now syncing from this consent, originating source first
    pub linked_sources: Vec<Source>,
}

/// Provider-agnostic view of a source's connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusView {
    pub source_id: Uuid,
    pub connection_id: Uuid,
    pub provider: ProviderId,
    pub status: ConnectionStatus,
    #[serde(flatten)]
    pub reauth: ReauthCheck,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
}

pub struct ConnectionService {
    repository: Arc<DuckDbRepository>,
    registry: ProviderRegistry,
    logger: Option<Arc<LoggingService>>,
}

impl ConnectionService {
    pub fn new(repository: Arc<DuckDbRepository>, registry: ProviderRegistry) -> Self {
        Self {
            repository,
            registry,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<LoggingService>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Begin linking `source_ref` to a bank at `provider`
    pub fn start_connection(
        &self,
        source_ref: &str,
        provider_id: ProviderId,
        institution_id: &str,
        redirect_url: &str,
        account_kind: AccountKind,
    ) -> Result<StartedConnection> {
        let source = self.repository.resolve_source(source_ref)?;
        let provider = self.registry.get_or_throw(provider_id)?;

        let connection_id = Uuid::new_v4();
        let start = provider.create_connection(&ConnectionRequest {
            connection_id,
            institution_id: institution_id.to_string(),
            redirect_url: redirect_url.to_string(),
            max_history_days: None,
            account_kind,
        })?;

        let now = Utc::now();
        self.repository.upsert_connection(&ProviderConnection {
            id: connection_id,
            source_id: source.id,
            institution_id: institution_id.to_string(),
            status: ConnectionStatus::Pending,
            credentials: start.credentials,
            external_account_id: None,
            auth_url: Some(start.auth_url.clone()),
            link_expires_at: Some(start.expires_at),
            expires_at: None,
            last_sync_at: None,
            last_sync_error: None,
            created_at: now,
            updated_at: now,
        })?;

        tracing::info!(%connection_id, source_id = %source.id, provider = %provider_id, "connection started");

        Ok(StartedConnection {
            connection_id,
            source_id: source.id,
            provider: provider_id,
            auth_url: start.auth_url,
            expires_at: start.expires_at,
        })
    }

    /// Resolve a connection from the redirect's `code` or `error`
    pub fn complete_connection(&self, connection_id: Uuid, params: &CallbackParams) -> Result<CompletedConnection> {
        let connection = self.load(connection_id)?;
        if let Some(done) = self.already_resolved(&connection)? {
            return Ok(done);
        }
        if let Some(expired) = self.expire_stale_link(&connection)? {
            return Ok(expired);
        }

        let provider = self.registry.get_or_throw(connection.provider())?;
        let outcome = provider.handle_callback(&connection, params)?;
        self.apply_outcome(connection, outcome)
    }

    /// Poll the provider for a connection that is still being authorized
    pub fn refresh_pending(&self, connection_id: Uuid) -> Result<CompletedConnection> {
        let connection = self.load(connection_id)?;
        if let Some(done) = self.already_resolved(&connection)? {
            return Ok(done);
        }
        if let Some(expired) = self.expire_stale_link(&connection)? {
            return Ok(expired);
        }

        let provider = self.registry.get_or_throw(connection.provider())?;
        let outcome = provider.connection_status(&connection)?;
        self.apply_outcome(connection, outcome)
    }

    /// Revoke the source's connection at the provider and locally.
    ///
    /// The connection row is kept with status `revoked`.
    pub fn disconnect(&self, source_ref: &str) -> Result<ProviderConnection> {
        let source = self.repository.resolve_source(source_ref)?;
        let mut connection = self
            .repository
            .current_connection(source.id)?
            .ok_or_else(|| Error::not_found(format!("No connection for source '{}'", source.name)))?;

        match self.registry.get_or_throw(connection.provider()) {
            Ok(provider) => {
                if let Err(e) = provider.revoke_connection(&connection) {
                    tracing::warn!(connection_id = %connection.id, "provider-side revoke failed: {}", e);
                }
            }
            Err(e) => tracing::warn!(connection_id = %connection.id, "skipping provider-side revoke: {}", e),
        }

        self.repository
            .set_connection_status(connection.id, ConnectionStatus::Revoked)?;
        connection.status = ConnectionStatus::Revoked;
        tracing::info!(connection_id = %connection.id, source_id = %source.id, "connection revoked");
        Ok(connection)
    }

    /// `{status, required, daysRemaining}` for a source, polling pending links
    pub fn connection_status(&self, source_ref: &str) -> Result<ConnectionStatusView> {
        self.connection_status_at(source_ref, Utc::now())
    }

    pub fn connection_status_at(&self, source_ref: &str, now: DateTime<Utc>) -> Result<ConnectionStatusView> {
        let source = self.repository.resolve_source(source_ref)?;
        let mut connection = self
            .repository
            .current_connection(source.id)?
            .ok_or_else(|| Error::not_found(format!("No connection for source '{}'", source.name)))?;

        if matches!(connection.status, ConnectionStatus::Pending | ConnectionStatus::Authorizing) {
            match self.refresh_pending(connection.id) {
                Ok(_) => {
                    connection = self.load(connection.id)?;
                }
                Err(e) => tracing::warn!(connection_id = %connection.id, "status poll failed: {}", e),
            }
        }

        let reauth = match self.registry.get(connection.provider()) {
            Some(provider) => provider.check_reauth_required(&connection, now),
            None => connection.reauth_check(now),
        };

        Ok(ConnectionStatusView {
            source_id: source.id,
            connection_id: connection.id,
            provider: connection.provider(),
            status: connection.status,
            reauth,
            expires_at: connection.expires_at,
            last_sync_at: connection.last_sync_at,
            last_sync_error: connection.last_sync_error,
        })
    }

    fn load(&self, connection_id: Uuid) -> Result<ProviderConnection> {
        self.repository
            .get_connection(connection_id)?
            .ok_or_else(|| Error::not_found(format!("Connection {}", connection_id)))
    }

    /// Linked or terminal connections are not resolved twice
    fn already_resolved(&self, connection: &ProviderConnection) -> Result<Option<CompletedConnection>> {
        if connection.status == ConnectionStatus::Linked || connection.status.is_terminal() {
            let linked_sources = self
                .repository
                .get_source(connection.source_id)?
                .into_iter()
                .collect();
            return Ok(Some(CompletedConnection {
                connection_id: connection.id,
                status: connection.status,
                linked_sources,
            }));
        }
        Ok(None)
    }

    fn expire_stale_link(&self, connection: &ProviderConnection) -> Result<Option<CompletedConnection>> {
        if connection.link_expires_at.is_some_and(|exp| exp <= Utc::now()) {
            self.repository
                .set_connection_status(connection.id, ConnectionStatus::Expired)?;
            return Ok(Some(CompletedConnection {
                connection_id: connection.id,
                status: ConnectionStatus::Expired,
                linked_sources: Vec::new(),
            }));
        }
        Ok(None)
    }

    fn apply_outcome(&self, mut connection: ProviderConnection, outcome: CallbackOutcome) -> Result<CompletedConnection> {
        let now = Utc::now();
        connection.credentials = outcome.credentials;
        connection.status = outcome.status;
        connection.expires_at = outcome.consent_expires_at.or(connection.expires_at);
        connection.updated_at = now;

        if connection.status == ConnectionStatus::Linked && outcome.account_ids.is_empty() {
            connection.status = ConnectionStatus::Rejected;
            connection.last_sync_error = Some("No accounts were shared".to_string());
        }

        if connection.status != ConnectionStatus::Linked {
            self.repository.upsert_connection(&connection)?;
            return Ok(CompletedConnection {
                connection_id: connection.id,
                status: connection.status,
                linked_sources: Vec::new(),
            });
        }

        let provider = self.registry.get_or_throw(connection.provider())?;
        let details: HashMap<String, ProviderAccount> = provider
            .get_accounts(&connection)?
            .into_iter()
            .map(|a| (a.external_id.clone(), a))
            .collect();

        let mut source = self
            .repository
            .get_source(connection.source_id)?
            .ok_or_else(|| Error::not_found(format!("Source {}", connection.source_id)))?;

        let mut linked_sources = Vec::with_capacity(outcome.account_ids.len());
        for (idx, account_id) in outcome.account_ids.iter().enumerate() {
            let account = details.get(account_id);
            if idx == 0 {
                source.kind = SourceKind::Provider;
                // The IBAN feeds the dedupe hash; only an empty source may take one
                if source.iban.is_none() && self.repository.transaction_count(source.id)? == 0 {
                    source.iban = account.and_then(|a| a.iban.clone());
                }
                source.updated_at = now;
                self.repository.upsert_source(&source)?;
                self.supersede_other_connections(source.id, connection.id)?;

                connection.external_account_id = Some(account_id.clone());
                self.repository.upsert_connection(&connection)?;
                linked_sources.push(source.clone());
            } else {
                let extra = self.source_for_account(&source, account_id, account)?;
                let mut sibling = connection.clone();
                sibling.id = Uuid::new_v4();
                sibling.source_id = extra.id;
                sibling.external_account_id = Some(account_id.clone());
                sibling.created_at = now;
                self.repository.upsert_connection(&sibling)?;
                linked_sources.push(extra);
            }
        }

        for linked in &linked_sources {
            tracing::info!(source_id = %linked.id, provider = %connection.provider(), "source linked");
            if let Some(logger) = &self.logger {
                logger.record(
                    LogEvent::new(events::CONNECTION_LINKED)
                        .with_provider(connection.provider())
                        .with_source(linked.id),
                );
            }
        }

        Ok(CompletedConnection {
            connection_id: connection.id,
            status: ConnectionStatus::Linked,
            linked_sources,
        })
    }

    /// A reconnect replaces whatever the source was linked to before
    fn supersede_other_connections(&self, source_id: Uuid, keep: Uuid) -> Result<()> {
        for old in self.repository.list_connections()? {
            if old.source_id == source_id && old.id != keep && old.status != ConnectionStatus::Revoked {
                self.repository.set_connection_status(old.id, ConnectionStatus::Revoked)?;
            }
        }
        Ok(())
    }

    fn source_for_account(
        &self,
        origin: &Source,
        account_id: &str,
        account: Option<&ProviderAccount>,
    ) -> Result<Source> {
        let base_name = account
            .map(|a| a.name.clone())
            .unwrap_or_else(|| format!("{} {}", origin.name, account_id));
        let taken: Vec<String> = self.repository.list_sources()?.into_iter().map(|s| s.name).collect();
        let mut name = base_name.clone();
        let mut n = 2;
        while taken.contains(&name) {
            name = format!("{} ({})", base_name, n);
            n += 1;
        }

        let currency = account
            .and_then(|a| a.currency.clone())
            .unwrap_or_else(|| origin.currency.clone());
        let mut source = Source::new(name, SourceKind::Provider, currency);
        if let Some(iban) = account.and_then(|a| a.iban.clone()) {
            source = source.with_iban(iban);
        }
        self.repository.upsert_source(&source)?;
        Ok(source)
    }
}
