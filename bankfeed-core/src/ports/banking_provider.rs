//! Banking provider port
//!
//! One interface over heterogeneous bank data APIs. The sync orchestrator and
//! the connection service only ever see this trait, never provider-specific
//! states: GoCardless requisitions and TrueLayer tokens both reduce to a
//! [`ConnectionStatus`] and a [`ReauthCheck`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::result::Result;
use crate::domain::{
    AccountKind, ConnectionStatus, IncomingTransaction, Institution, ProviderAccount,
    ProviderConnection, ProviderCredentials, ProviderId, ReauthCheck, RowError,
};

/// Booked transactions for one window
#[derive(Debug, Clone, Default)]
pub struct FetchedTransactions {
    pub transactions: Vec<IncomingTransaction>,
    /// Records the provider sent that could not be mapped
    pub rejected: Vec<RowError>,
}

/// Input for starting an authorization flow
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// Our connection id; providers echo it back on the callback
    pub connection_id: Uuid,
    pub institution_id: String,
    pub redirect_url: String,
    pub max_history_days: Option<u32>,
    pub account_kind: AccountKind,
}

/// Result of starting an authorization flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStart {
    pub connection_id: Uuid,
    pub auth_url: String,
    /// When the authorization link stops working
    pub expires_at: DateTime<Utc>,
    pub credentials: ProviderCredentials,
}

/// What came back on the redirect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
}

/// Resolved state after a callback or status poll
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub status: ConnectionStatus,
    pub account_ids: Vec<String>,
    pub credentials: ProviderCredentials,
    /// Consent expiry, independent of the link expiry
    pub consent_expires_at: Option<DateTime<Utc>>,
}

/// Result of the lazy pre-fetch token check
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Unchanged,
    /// Persist the new credentials before fetching
    Refreshed(ProviderCredentials),
    /// Refresh failed; the connection needs the user
    ReauthRequired(String),
}

/// A bank data provider.
///
/// Calls are blocking and run on the caller's thread.
pub trait BankingProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Credentials are configured
    fn is_enabled(&self) -> bool;

    /// ISO 3166 alpha-2 codes, uppercase
    fn supported_countries(&self) -> &[&'static str];

    fn supports_country(&self, country: &str) -> bool {
        let country = country.to_ascii_uppercase();
        self.supported_countries().iter().any(|c| *c == country)
    }

    fn list_institutions(&self, country: &str) -> Result<Vec<Institution>>;

    fn create_connection(&self, request: &ConnectionRequest) -> Result<ConnectionStart>;

    fn handle_callback(
        &self,
        connection: &ProviderConnection,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome>;

    /// Poll the provider for the current state of a pending connection
    fn connection_status(&self, connection: &ProviderConnection) -> Result<CallbackOutcome>;

    fn get_accounts(&self, connection: &ProviderConnection) -> Result<Vec<ProviderAccount>>;

    fn fetch_transactions(
        &self,
        connection: &ProviderConnection,
        account_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<FetchedTransactions>;

    fn check_reauth_required(&self, connection: &ProviderConnection, now: DateTime<Utc>) -> ReauthCheck {
        connection.reauth_check(now)
    }

    fn revoke_connection(&self, connection: &ProviderConnection) -> Result<()>;

    fn refresh_token_if_needed(
        &self,
        _connection: &ProviderConnection,
        _now: DateTime<Utc>,
    ) -> Result<RefreshOutcome> {
        Ok(RefreshOutcome::Unchanged)
    }
}
