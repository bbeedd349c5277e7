//! TrueLayer Data API client
//!
//! OAuth2 authorization-code flow. Tokens are per connection and stored in
//! its credentials; the access token is refreshed lazily before a fetch.
//!
//! API Documentation: https://docs.truelayer.com/docs/data-api-basics

use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::blocking::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use url::Url;
use uuid::Uuid;

use super::http::{deserialize_decimal, error_for_status, request_error, REQUEST_TIMEOUT};
use crate::config::TrueLayerSettings;
use crate::domain::result::{Error, Result};
use crate::domain::{
    AccountKind, ConnectionStatus, IncomingTransaction, Institution, OAuthTokens, ProviderAccount,
    ProviderConnection, ProviderCredentials, ProviderId, ReauthCheck, RowError,
};
use crate::parsing::decimal_to_minor;
use crate::ports::{
    BankingProvider, CallbackOutcome, CallbackParams, ConnectionRequest, ConnectionStart, FetchedTransactions,
    RefreshOutcome,
};

const AUTH_URL: &str = "https://auth.truelayer.com";
const API_URL: &str = "https://api.truelayer.com";
const SANDBOX_AUTH_URL: &str = "https://auth.truelayer-sandbox.com";
const SANDBOX_API_URL: &str = "https://api.truelayer-sandbox.com";

const SCOPES: &str = "info accounts balance cards transactions offline_access";

/// Consent length when /me does not say
const DEFAULT_CONSENT_DAYS: i64 = 90;

/// How long an authorization link stays usable
const LINK_VALIDITY_HOURS: i64 = 1;

/// Refresh when the access token expires within this window
const REFRESH_MARGIN_MINUTES: i64 = 5;

const REAUTH_STATUSES: [u16; 2] = [401, 403];

const SUPPORTED_COUNTRIES: &[&str] = &["GB", "IE", "FR", "DE", "ES", "IT", "NL", "PT", "LT", "PL", "AT", "BE", "FI"];

/// Lifecycle of the stored access token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    /// Expires within the refresh margin
    NeedsRefresh,
    /// Missing or already past expiry
    Expired,
}

impl TokenState {
    pub fn of(tokens: Option<&OAuthTokens>, now: DateTime<Utc>) -> Self {
        match tokens {
            None => TokenState::Expired,
            Some(t) if t.expires_at <= now => TokenState::Expired,
            Some(t) if t.expires_at - Duration::minutes(REFRESH_MARGIN_MINUTES) <= now => TokenState::NeedsRefresh,
            Some(_) => TokenState::Valid,
        }
    }
}

// =============================================================================
// API Response Models
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct Results<T> {
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TlProvider {
    provider_id: String,
    display_name: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    logo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeResult {
    #[serde(default)]
    consent_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TlAccount {
    account_id: String,
    display_name: String,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    account_number: Option<TlAccountNumber>,
}

#[derive(Debug, Deserialize)]
struct TlAccountNumber {
    #[serde(default)]
    iban: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TlTransaction {
    #[serde(default)]
    transaction_id: Option<String>,
    timestamp: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(deserialize_with = "deserialize_decimal")]
    amount: Decimal,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    transaction_type: Option<String>,
    #[serde(default)]
    merchant_name: Option<String>,
    #[serde(default)]
    meta: Option<TlMeta>,
}

#[derive(Debug, Deserialize)]
struct TlMeta {
    #[serde(default)]
    provider_reference: Option<String>,
    #[serde(default)]
    counter_party_iban: Option<String>,
}

// =============================================================================
// TrueLayer HTTP Client
// =============================================================================

pub struct TrueLayerProvider {
    client: Client,
    settings: TrueLayerSettings,
    auth_url: String,
    api_url: String,
}

impl TrueLayerProvider {
    pub fn new(settings: TrueLayerSettings) -> Result<Self> {
        let (auth_default, api_default) = if settings.sandbox {
            (SANDBOX_AUTH_URL, SANDBOX_API_URL)
        } else {
            (AUTH_URL, API_URL)
        };
        let auth_url = settings.auth_base_url.clone().unwrap_or_else(|| auth_default.to_string());
        let api_url = settings.api_base_url.clone().unwrap_or_else(|| api_default.to_string());
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| request_error(ProviderId::TrueLayer, e))?;

        Ok(Self {
            client,
            settings,
            auth_url: auth_url.trim_end_matches('/').to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder, source_id: Option<Uuid>) -> Result<T> {
        let response = request
            .header("accept", "application/json")
            .send()
            .map_err(|e| request_error(ProviderId::TrueLayer, e))?;
        let response = error_for_status(ProviderId::TrueLayer, response, source_id, &REAUTH_STATUSES)?;
        response
            .json()
            .map_err(|e| Error::provider("truelayer", format!("Unexpected response: {}", e)))
    }

    fn data<T: DeserializeOwned>(&self, connection: &ProviderConnection, path: &str) -> Result<Vec<T>> {
        let (tokens, _) = Self::credentials(connection)?;
        let tokens = tokens.ok_or_else(|| {
            Error::reauth(connection.source_id.to_string(), "Authorization code was never exchanged")
        })?;
        let request = self
            .client
            .get(format!("{}/data/v1/{}", self.api_url, path))
            .bearer_auth(&tokens.access_token);
        let results: Results<T> = self.send(request, Some(connection.source_id))?;
        Ok(results.results)
    }

    fn credentials(connection: &ProviderConnection) -> Result<(Option<&OAuthTokens>, AccountKind)> {
        match &connection.credentials {
            ProviderCredentials::TrueLayer { tokens, account_kind } => Ok((tokens.as_ref(), *account_kind)),
            other => Err(Error::config(format!(
                "Connection {} belongs to {}, not truelayer",
                connection.id,
                other.provider()
            ))),
        }
    }

    fn token_request(&self, form: &[(&str, &str)], source_id: Option<Uuid>) -> Result<OAuthTokens> {
        let mut fields = vec![
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
        ];
        fields.extend_from_slice(form);
        let request = self
            .client
            .post(format!("{}/connect/token", self.auth_url))
            .form(&fields);
        let token: TokenResponse = self.send(request, source_id)?;
        Ok(OAuthTokens {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }

    fn authorization_url(&self, request: &ConnectionRequest) -> Result<String> {
        let mut url = Url::parse(&self.auth_url)
            .map_err(|e| Error::config(format!("Invalid TrueLayer auth URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("scope", SCOPES)
            .append_pair("redirect_uri", &request.redirect_url)
            .append_pair("provider_id", &request.institution_id)
            .append_pair("state", &request.connection_id.to_string());
        Ok(url.to_string())
    }

    /// The redirect used to start the flow; the code exchange must repeat it
    fn redirect_uri(connection: &ProviderConnection) -> Result<String> {
        connection
            .auth_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .and_then(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == "redirect_uri")
                    .map(|(_, v)| v.into_owned())
            })
            .ok_or_else(|| Error::config(format!("Connection {} has no redirect URI on record", connection.id)))
    }

    fn consent_expiry(&self, connection: &ProviderConnection) -> DateTime<Utc> {
        let fallback = Utc::now() + Duration::days(DEFAULT_CONSENT_DAYS);
        match self.data::<MeResult>(connection, "me") {
            Ok(me) => me
                .into_iter()
                .find_map(|m| m.consent_expires_at)
                .unwrap_or(fallback),
            Err(e) => {
                tracing::warn!(connection_id = %connection.id, "could not read truelayer consent expiry: {}", e);
                fallback
            }
        }
    }

    fn linked_outcome(&self, connection: &ProviderConnection) -> Result<CallbackOutcome> {
        let accounts = self.get_accounts(connection)?;
        Ok(CallbackOutcome {
            status: ConnectionStatus::Linked,
            account_ids: accounts.into_iter().map(|a| a.external_id).collect(),
            credentials: connection.credentials.clone(),
            consent_expires_at: Some(self.consent_expiry(connection)),
        })
    }
}

/// Map a TrueLayer transaction onto the canonical shape
fn map_transaction(raw: JsonValue) -> Result<IncomingTransaction> {
    let tx: TlTransaction = serde_json::from_value(raw.clone())?;

    let date = tx
        .timestamp
        .get(..10)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .ok_or_else(|| Error::Parse(format!("invalid timestamp: {}", tx.timestamp)))?;

    let mut amount = decimal_to_minor(tx.amount)
        .ok_or_else(|| Error::Parse(format!("amount out of range: {}", tx.amount)))?;
    if tx.transaction_type.as_deref() == Some("DEBIT") && amount > 0 {
        amount = -amount;
    }

    let name = tx
        .merchant_name
        .clone()
        .or_else(|| tx.description.clone())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    let meta = tx.meta.unwrap_or(TlMeta {
        provider_reference: None,
        counter_party_iban: None,
    });

    let mut incoming = IncomingTransaction::new(date, amount, name);
    incoming.currency = tx.currency;
    incoming.description = tx.description;
    incoming.counterparty_name = tx.merchant_name;
    incoming.counterparty_iban = meta.counter_party_iban;
    incoming.reference = meta.provider_reference;
    incoming.external_id = tx.transaction_id;
    incoming.original = raw;
    Ok(incoming)
}

impl BankingProvider for TrueLayerProvider {
    fn id(&self) -> ProviderId {
        ProviderId::TrueLayer
    }

    fn is_enabled(&self) -> bool {
        self.settings.is_configured()
    }

    fn supported_countries(&self) -> &[&'static str] {
        SUPPORTED_COUNTRIES
    }

    fn list_institutions(&self, country: &str) -> Result<Vec<Institution>> {
        let request = self
            .client
            .get(format!("{}/api/providers", self.auth_url))
            .query(&[("clientId", self.settings.client_id.as_str())]);
        let providers: Vec<TlProvider> = self.send(request, None)?;
        let country = country.to_ascii_uppercase();

        Ok(providers
            .into_iter()
            .filter(|p| p.country.as_deref().map(str::to_ascii_uppercase).as_deref() == Some(country.as_str()))
            .map(|p| Institution {
                id: p.provider_id,
                name: p.display_name,
                provider: ProviderId::TrueLayer,
                bic: None,
                logo: p.logo_url,
                countries: p.country.into_iter().collect(),
                max_history_days: None,
            })
            .collect())
    }

    fn create_connection(&self, request: &ConnectionRequest) -> Result<ConnectionStart> {
        Ok(ConnectionStart {
            connection_id: request.connection_id,
            auth_url: self.authorization_url(request)?,
            expires_at: Utc::now() + Duration::hours(LINK_VALIDITY_HOURS),
            credentials: ProviderCredentials::TrueLayer {
                tokens: None,
                account_kind: request.account_kind,
            },
        })
    }

    fn handle_callback(&self, connection: &ProviderConnection, params: &CallbackParams) -> Result<CallbackOutcome> {
        let (_, account_kind) = Self::credentials(connection)?;

        if let Some(error) = &params.error {
            tracing::info!(connection_id = %connection.id, "truelayer callback returned error: {}", error);
            return Ok(CallbackOutcome {
                status: ConnectionStatus::Rejected,
                account_ids: Vec::new(),
                credentials: connection.credentials.clone(),
                consent_expires_at: None,
            });
        }

        let code = params
            .code
            .as_deref()
            .ok_or_else(|| Error::provider("truelayer", "Callback carried neither code nor error"))?;
        let redirect_uri = Self::redirect_uri(connection)?;
        let tokens = self.token_request(
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri.as_str()),
            ],
            None,
        )?;

        let mut linked = connection.clone();
        linked.credentials = ProviderCredentials::TrueLayer {
            tokens: Some(tokens),
            account_kind,
        };
        self.linked_outcome(&linked)
    }

    fn connection_status(&self, connection: &ProviderConnection) -> Result<CallbackOutcome> {
        let (tokens, _) = Self::credentials(connection)?;
        if tokens.is_none() {
            let expired = connection.link_expires_at.is_some_and(|exp| exp <= Utc::now());
            return Ok(CallbackOutcome {
                status: if expired { ConnectionStatus::Expired } else { ConnectionStatus::Pending },
                account_ids: Vec::new(),
                credentials: connection.credentials.clone(),
                consent_expires_at: None,
            });
        }
        self.linked_outcome(connection)
    }

    fn get_accounts(&self, connection: &ProviderConnection) -> Result<Vec<ProviderAccount>> {
        let (_, kind) = Self::credentials(connection)?;
        let path = match kind {
            AccountKind::Account => "accounts",
            AccountKind::Card => "cards",
        };
        let accounts: Vec<TlAccount> = self.data(connection, path)?;
        Ok(accounts
            .into_iter()
            .map(|a| ProviderAccount {
                external_id: a.account_id,
                name: a.display_name,
                iban: a.account_number.and_then(|n| n.iban),
                currency: a.currency,
                kind,
            })
            .collect())
    }

    fn fetch_transactions(
        &self,
        connection: &ProviderConnection,
        account_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<FetchedTransactions> {
        let (_, kind) = Self::credentials(connection)?;
        let path = match kind {
            AccountKind::Account => "accounts",
            AccountKind::Card => "cards",
        };
        let raw: Vec<JsonValue> = self.data(
            connection,
            &format!("{}/{}/transactions?from={}&to={}", path, account_id, date_from, date_to),
        )?;

        let mut fetched = FetchedTransactions::default();
        for (idx, item) in raw.into_iter().enumerate() {
            match map_transaction(item.clone()) {
                Ok(tx) => fetched.transactions.push(tx),
                Err(e) => {
                    tracing::debug!(source_id = %connection.source_id, "unmappable truelayer transaction: {}", e);
                    fetched.rejected.push(RowError::from_json(idx + 1, e.to_string(), &item));
                }
            }
        }
        Ok(fetched)
    }

    fn check_reauth_required(&self, connection: &ProviderConnection, now: DateTime<Utc>) -> ReauthCheck {
        let check = connection.reauth_check(now);
        let unusable = match Self::credentials(connection) {
            Ok((Some(tokens), _)) => tokens.refresh_token.is_empty(),
            _ => true,
        };
        if unusable && connection.status == ConnectionStatus::Linked {
            return ReauthCheck {
                required: true,
                days_remaining: check.days_remaining,
            };
        }
        check
    }

    fn revoke_connection(&self, connection: &ProviderConnection) -> Result<()> {
        let (tokens, _) = Self::credentials(connection)?;
        let Some(tokens) = tokens else {
            return Ok(());
        };
        let response = self
            .client
            .delete(format!("{}/api/delete", self.auth_url))
            .bearer_auth(&tokens.access_token)
            .send()
            .map_err(|e| request_error(ProviderId::TrueLayer, e))?;
        // An expired token means there is nothing left to revoke
        if response.status().as_u16() == 401 {
            return Ok(());
        }
        error_for_status(ProviderId::TrueLayer, response, None, &[])?;
        Ok(())
    }

    fn refresh_token_if_needed(&self, connection: &ProviderConnection, now: DateTime<Utc>) -> Result<RefreshOutcome> {
        let (tokens, account_kind) = Self::credentials(connection)?;
        let Some(tokens) = tokens else {
            return Ok(RefreshOutcome::ReauthRequired(
                "Authorization code was never exchanged".to_string(),
            ));
        };
        if TokenState::of(Some(tokens), now) == TokenState::Valid {
            return Ok(RefreshOutcome::Unchanged);
        }

        tracing::debug!(connection_id = %connection.id, "refreshing truelayer access token");
        match self.token_request(
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh_token.as_str()),
            ],
            Some(connection.source_id),
        ) {
            Ok(tokens) => Ok(RefreshOutcome::Refreshed(ProviderCredentials::TrueLayer {
                tokens: Some(tokens),
                account_kind,
            })),
            // invalid_grant comes back as 400
            Err(Error::ReauthRequired { reason, .. }) => Ok(RefreshOutcome::ReauthRequired(reason)),
            Err(Error::Provider { message, .. }) if message.starts_with("HTTP 400") => {
                Ok(RefreshOutcome::ReauthRequired(message))
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
