//! GoCardless Bank Account Data API client
//!
//! Connections follow the requisition flow: an end-user agreement fixes the
//! consent scope and duration, a requisition produces the bank link, and the
//! requisition status tells us when accounts are linked.
//!
//! API Documentation: https://developer.gocardless.com/bank-account-data/overview

use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::blocking::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use super::http::{deserialize_decimal, error_for_status, request_error, REQUEST_TIMEOUT};
use crate::config::GoCardlessSettings;
use crate::domain::result::{Error, Result};
use crate::domain::{
    AccountKind, ConnectionStatus, IncomingTransaction, Institution,
    ProviderAccount, ProviderConnection, ProviderCredentials, ProviderId, RowError,
};
use crate::parsing::decimal_to_minor;
use crate::ports::{
    BankingProvider, CallbackOutcome, CallbackParams, ConnectionRequest, ConnectionStart, FetchedTransactions,
};

/// Default production API URL
pub const GOCARDLESS_PRODUCTION_URL: &str = "https://bankaccountdata.gocardless.com/api/v2";

/// PSD2 caps consent at 90 days
pub const MAX_CONSENT_DAYS: i64 = 90;

/// How long a requisition link stays usable
const LINK_VALIDITY_HOURS: i64 = 24;

const ACCESS_SCOPE: [&str; 3] = ["balances", "details", "transactions"];

/// Renew the access token this long before it lapses
const TOKEN_MARGIN_SECS: i64 = 60;

/// Statuses that mean the consent behind a requisition is gone
const REAUTH_STATUSES: [u16; 3] = [401, 403, 409];

const SUPPORTED_COUNTRIES: &[&str] = &[
    "AT", "BE", "BG", "CY", "CZ", "DE", "DK", "EE", "ES", "FI", "FR", "GB", "GR", "HR", "HU",
    "IE", "IS", "IT", "LI", "LT", "LU", "LV", "MT", "NL", "NO", "PL", "PT", "RO", "SE", "SI",
    "SK",
];

// =============================================================================
// Requisition state machine
// =============================================================================

/// Requisition status codes as GoCardless reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequisitionStatus {
    #[serde(rename = "CR")]
    Created,
    #[serde(rename = "GC")]
    GivingConsent,
    #[serde(rename = "UA")]
    UndergoingAuthentication,
    #[serde(rename = "RJ")]
    Rejected,
    #[serde(rename = "SA")]
    SelectingAccounts,
    #[serde(rename = "GA")]
    GrantingAccess,
    #[serde(rename = "LN")]
    Linked,
    #[serde(rename = "EX")]
    Expired,
    #[serde(rename = "SU")]
    Suspended,
}

impl RequisitionStatus {
    /// Collapse onto the provider-agnostic status
    pub fn connection_status(self) -> ConnectionStatus {
        match self {
            Self::Created => ConnectionStatus::Pending,
            Self::GivingConsent
            | Self::UndergoingAuthentication
            | Self::SelectingAccounts
            | Self::GrantingAccess => ConnectionStatus::Authorizing,
            Self::Linked => ConnectionStatus::Linked,
            Self::Rejected => ConnectionStatus::Rejected,
            Self::Expired => ConnectionStatus::Expired,
            Self::Suspended => ConnectionStatus::Suspended,
        }
    }
}

// =============================================================================
// API Response Models
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
    access_expires: i64,
    #[serde(default)]
    refresh: Option<String>,
    #[serde(default)]
    refresh_expires: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GcInstitution {
    id: String,
    name: String,
    #[serde(default)]
    bic: Option<String>,
    #[serde(default)]
    logo: Option<String>,
    #[serde(default)]
    countries: Vec<String>,
    /// Sent as a string
    #[serde(default)]
    transaction_total_days: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Agreement {
    id: String,
    #[serde(default)]
    access_valid_for_days: Option<i64>,
    #[serde(default)]
    accepted: Option<DateTime<Utc>>,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Requisition {
    id: String,
    status: RequisitionStatus,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    accounts: Vec<String>,
    #[serde(default)]
    agreement: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountDetailsResponse {
    account: AccountDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountDetails {
    #[serde(default)]
    iban: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    owner_name: Option<String>,
    #[serde(default)]
    product: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    transactions: TransactionLists,
}

#[derive(Debug, Deserialize)]
struct TransactionLists {
    #[serde(default)]
    booked: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcTransaction {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    internal_transaction_id: Option<String>,
    #[serde(default)]
    booking_date: Option<NaiveDate>,
    #[serde(default)]
    value_date: Option<NaiveDate>,
    transaction_amount: GcAmount,
    #[serde(default)]
    creditor_name: Option<String>,
    #[serde(default)]
    debtor_name: Option<String>,
    #[serde(default)]
    creditor_account: Option<GcAccountRef>,
    #[serde(default)]
    debtor_account: Option<GcAccountRef>,
    #[serde(default)]
    remittance_information_unstructured: Option<String>,
    #[serde(default)]
    remittance_information_unstructured_array: Vec<String>,
    #[serde(default)]
    remittance_information_structured: Option<String>,
    #[serde(default)]
    additional_information: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcAmount {
    #[serde(deserialize_with = "deserialize_decimal")]
    amount: Decimal,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct GcAccountRef {
    #[serde(default)]
    iban: Option<String>,
}

// =============================================================================
// GoCardless HTTP Client
// =============================================================================

#[derive(Debug, Clone)]
struct TokenState {
    access: String,
    access_expires_at: DateTime<Utc>,
    refresh: Option<String>,
    refresh_expires_at: Option<DateTime<Utc>>,
}

/// GoCardless provider. The API token is client-level and cached here;
/// per-connection credentials are just the requisition and agreement ids.
pub struct GoCardlessProvider {
    client: Client,
    settings: GoCardlessSettings,
    base_url: String,
    token: Mutex<Option<TokenState>>,
}

impl GoCardlessProvider {
    pub fn new(settings: GoCardlessSettings) -> Result<Self> {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| GOCARDLESS_PRODUCTION_URL.to_string());
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| request_error(ProviderId::GoCardless, e))?;

        Ok(Self {
            client,
            settings,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Valid access token, renewing or re-issuing it when needed
    fn access_token(&self) -> Result<String> {
        let mut cached = self
            .token
            .lock()
            .map_err(|e| Error::provider("gocardless", format!("Lock poisoned: {}", e)))?;
        let now = Utc::now();
        let margin = Duration::seconds(TOKEN_MARGIN_SECS);

        if let Some(state) = cached.as_ref() {
            if state.access_expires_at - margin > now {
                return Ok(state.access.clone());
            }
        }

        let refreshable = cached.as_ref().and_then(|s| match (&s.refresh, s.refresh_expires_at) {
            (Some(r), Some(exp)) if exp - margin > now => Some((r.clone(), exp)),
            _ => None,
        });

        let state = match refreshable {
            Some((refresh, refresh_expires_at)) => {
                tracing::debug!("refreshing gocardless access token");
                let token: TokenResponse =
                    self.post_unauthenticated("token/refresh/", &json!({ "refresh": refresh }))?;
                TokenState {
                    access: token.access,
                    access_expires_at: now + Duration::seconds(token.access_expires),
                    refresh: Some(refresh),
                    refresh_expires_at: Some(refresh_expires_at),
                }
            }
            None => {
                tracing::debug!("requesting new gocardless token");
                let token: TokenResponse = self.post_unauthenticated(
                    "token/new/",
                    &json!({
                        "secret_id": self.settings.secret_id,
                        "secret_key": self.settings.secret_key,
                    }),
                )?;
                TokenState {
                    access: token.access,
                    access_expires_at: now + Duration::seconds(token.access_expires),
                    refresh: token.refresh,
                    refresh_expires_at: token.refresh_expires.map(|s| now + Duration::seconds(s)),
                }
            }
        };

        let access = state.access.clone();
        *cached = Some(state);
        Ok(access)
    }

    fn post_unauthenticated<T: DeserializeOwned>(&self, path: &str, body: &JsonValue) -> Result<T> {
        let request = self.client.post(self.url(path)).json(body);
        self.send(request, None)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, source_id: Option<Uuid>) -> Result<T> {
        let request = self.client.get(self.url(path)).bearer_auth(self.access_token()?);
        self.send(request, source_id)
    }

    fn post<T: DeserializeOwned>(&self, path: &str, body: &JsonValue) -> Result<T> {
        let request = self
            .client
            .post(self.url(path))
            .bearer_auth(self.access_token()?)
            .json(body);
        self.send(request, None)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder, source_id: Option<Uuid>) -> Result<T> {
        let response = request
            .header("accept", "application/json")
            .send()
            .map_err(|e| request_error(ProviderId::GoCardless, e))?;
        let response = error_for_status(ProviderId::GoCardless, response, source_id, &REAUTH_STATUSES)?;
        response
            .json()
            .map_err(|e| Error::provider("gocardless", format!("Unexpected response: {}", e)))
    }

    fn requisition_id(connection: &ProviderConnection) -> Result<&str> {
        match &connection.credentials {
            ProviderCredentials::GoCardless { requisition_id, .. } => Ok(requisition_id),
            other => Err(Error::config(format!(
                "Connection {} belongs to {}, not gocardless",
                connection.id,
                other.provider()
            ))),
        }
    }

    fn requisition(&self, connection: &ProviderConnection) -> Result<Requisition> {
        let id = Self::requisition_id(connection)?;
        self.get(&format!("requisitions/{}/", id), Some(connection.source_id))
    }

    /// Consent end: acceptance (or creation) plus the agreed validity
    fn consent_expiry(&self, agreement_id: &str, source_id: Uuid) -> Result<DateTime<Utc>> {
        let agreement: Agreement = self.get(&format!("agreements/enduser/{}/", agreement_id), Some(source_id))?;
        let days = agreement
            .access_valid_for_days
            .unwrap_or(MAX_CONSENT_DAYS)
            .min(MAX_CONSENT_DAYS);
        let start = agreement.accepted.or(agreement.created).unwrap_or_else(Utc::now);
        Ok(start + Duration::days(days))
    }
}

/// "Account …1234" from the last four IBAN characters
fn fallback_account_name(iban: Option<&str>) -> String {
    match iban {
        Some(iban) if iban.chars().count() > 4 => {
            let tail: String = iban.chars().skip(iban.chars().count() - 4).collect();
            format!("Account …{}", tail)
        }
        _ => "Bank account".to_string(),
    }
}

/// Map a booked transaction onto the canonical shape
fn map_transaction(raw: JsonValue) -> Result<IncomingTransaction> {
    let tx: GcTransaction = serde_json::from_value(raw.clone())?;

    let date = tx
        .booking_date
        .or(tx.value_date)
        .ok_or_else(|| Error::Parse("transaction without booking or value date".to_string()))?;
    let amount = decimal_to_minor(tx.transaction_amount.amount)
        .ok_or_else(|| Error::Parse(format!("amount out of range: {}", tx.transaction_amount.amount)))?;

    let outgoing = amount < 0;
    let (counterparty, counterparty_account) = if outgoing {
        (tx.creditor_name.clone(), tx.creditor_account.as_ref())
    } else {
        (tx.debtor_name.clone(), tx.debtor_account.as_ref())
    };
    let counterparty = counterparty.filter(|n| !n.trim().is_empty());

    let reference = tx
        .remittance_information_unstructured
        .clone()
        .filter(|r| !r.trim().is_empty())
        .or_else(|| {
            Some(tx.remittance_information_unstructured_array.join(" ")).filter(|r| !r.trim().is_empty())
        })
        .or_else(|| tx.remittance_information_structured.clone());

    let name = counterparty
        .clone()
        .or_else(|| reference.clone())
        .or_else(|| tx.additional_information.clone())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    let mut incoming = IncomingTransaction::new(date, amount, name)
        .with_currency(tx.transaction_amount.currency.clone());
    incoming.description = tx.additional_information.clone();
    incoming.counterparty_name = counterparty;
    incoming.counterparty_iban = counterparty_account.and_then(|a| a.iban.clone());
    incoming.reference = reference;
    incoming.external_id = tx.transaction_id.or(tx.internal_transaction_id);
    incoming.original = raw;
    Ok(incoming)
}

impl BankingProvider for GoCardlessProvider {
    fn id(&self) -> ProviderId {
        ProviderId::GoCardless
    }

    fn is_enabled(&self) -> bool {
        self.settings.is_configured()
    }

    fn supported_countries(&self) -> &[&'static str] {
        SUPPORTED_COUNTRIES
    }

    fn list_institutions(&self, country: &str) -> Result<Vec<Institution>> {
        let institutions: Vec<GcInstitution> = self.get(
            &format!("institutions/?country={}", country.to_ascii_lowercase()),
            None,
        )?;
        Ok(institutions
            .into_iter()
            .map(|i| Institution {
                id: i.id,
                name: i.name,
                provider: ProviderId::GoCardless,
                bic: i.bic.filter(|b| !b.is_empty()),
                logo: i.logo,
                countries: i.countries,
                max_history_days: i.transaction_total_days.and_then(|d| d.parse().ok()),
            })
            .collect())
    }

    fn create_connection(&self, request: &ConnectionRequest) -> Result<ConnectionStart> {
        let agreement: Agreement = self.post(
            "agreements/enduser/",
            &json!({
                "institution_id": request.institution_id,
                "max_historical_days": request.max_history_days.unwrap_or(MAX_CONSENT_DAYS as u32),
                "access_valid_for_days": MAX_CONSENT_DAYS,
                "access_scope": ACCESS_SCOPE,
            }),
        )?;

        let requisition: Requisition = self.post(
            "requisitions/",
            &json!({
                "redirect": request.redirect_url,
                "institution_id": request.institution_id,
                "reference": request.connection_id.to_string(),
                "agreement": agreement.id,
                "user_language": "EN",
            }),
        )?;

        let auth_url = requisition
            .link
            .ok_or_else(|| Error::provider("gocardless", "Requisition has no link"))?;

        Ok(ConnectionStart {
            connection_id: request.connection_id,
            auth_url,
            expires_at: Utc::now() + Duration::hours(LINK_VALIDITY_HOURS),
            credentials: ProviderCredentials::GoCardless {
                requisition_id: requisition.id,
                agreement_id: Some(agreement.id),
            },
        })
    }

    fn handle_callback(&self, connection: &ProviderConnection, params: &CallbackParams) -> Result<CallbackOutcome> {
        if let Some(error) = &params.error {
            tracing::info!(connection_id = %connection.id, "gocardless callback returned error: {}", error);
            return Ok(CallbackOutcome {
                status: ConnectionStatus::Rejected,
                account_ids: Vec::new(),
                credentials: connection.credentials.clone(),
                consent_expires_at: None,
            });
        }
        self.connection_status(connection)
    }

    fn connection_status(&self, connection: &ProviderConnection) -> Result<CallbackOutcome> {
        let requisition = self.requisition(connection)?;
        let status = requisition.status.connection_status();

        let agreement_id = requisition.agreement.clone().or_else(|| match &connection.credentials {
            ProviderCredentials::GoCardless { agreement_id, .. } => agreement_id.clone(),
            _ => None,
        });

        let consent_expires_at = match (&status, &agreement_id) {
            (ConnectionStatus::Linked, Some(id)) => Some(self.consent_expiry(id, connection.source_id)?),
            (ConnectionStatus::Linked, None) => Some(Utc::now() + Duration::days(MAX_CONSENT_DAYS)),
            _ => None,
        };

        Ok(CallbackOutcome {
            status,
            account_ids: requisition.accounts,
            credentials: ProviderCredentials::GoCardless {
                requisition_id: requisition.id,
                agreement_id,
            },
            consent_expires_at,
        })
    }

    fn get_accounts(&self, connection: &ProviderConnection) -> Result<Vec<ProviderAccount>> {
        let requisition = self.requisition(connection)?;
        requisition
            .accounts
            .iter()
            .map(|id| {
                let details: AccountDetailsResponse =
                    self.get(&format!("accounts/{}/details/", id), Some(connection.source_id))?;
                let account = details.account;
                let name = account
                    .name
                    .clone()
                    .or(account.product.clone())
                    .or(account.owner_name.clone())
                    .unwrap_or_else(|| fallback_account_name(account.iban.as_deref()));
                Ok(ProviderAccount {
                    external_id: id.clone(),
                    name,
                    iban: account.iban,
                    currency: account.currency,
                    kind: AccountKind::Account,
                })
            })
            .collect()
    }

    fn fetch_transactions(
        &self,
        connection: &ProviderConnection,
        account_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<FetchedTransactions> {
        let response: TransactionsResponse = self.get(
            &format!(
                "accounts/{}/transactions/?date_from={}&date_to={}",
                account_id, date_from, date_to
            ),
            Some(connection.source_id),
        )?;

        let mut fetched = FetchedTransactions::default();
        for (idx, raw) in response.transactions.booked.into_iter().enumerate() {
            match map_transaction(raw.clone()) {
                Ok(tx) => fetched.transactions.push(tx),
                Err(e) => {
                    tracing::debug!(source_id = %connection.source_id, "unmappable gocardless transaction: {}", e);
                    fetched.rejected.push(RowError::from_json(idx + 1, e.to_string(), &raw));
                }
            }
        }
        Ok(fetched)
    }

    fn revoke_connection(&self, connection: &ProviderConnection) -> Result<()> {
        let id = Self::requisition_id(connection)?;
        let response = self
            .client
            .delete(self.url(&format!("requisitions/{}/", id)))
            .bearer_auth(self.access_token()?)
            .send()
            .map_err(|e| request_error(ProviderId::GoCardless, e))?;

        // Already deleted on their side
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        error_for_status(ProviderId::GoCardless, response, None, &[])?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
