//! Provider connection domain model
//!
//! One connection per linked bank account, owned by exactly one source.
//! Connections are never deleted: a revoked or expired connection stays on
//! record and blocks syncing until the user reconnects.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported banking providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    GoCardless,
    TrueLayer,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::GoCardless, ProviderId::TrueLayer];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::GoCardless => "gocardless",
            ProviderId::TrueLayer => "truelayer",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gocardless" => Ok(ProviderId::GoCardless),
            "truelayer" => Ok(ProviderId::TrueLayer),
            other => Err(format!("Unknown provider: {}", other)),
        }
    }
}

/// Provider-agnostic connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Authorizing,
    Linked,
    Rejected,
    Expired,
    Suspended,
    Revoked,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Authorizing => "authorizing",
            ConnectionStatus::Linked => "linked",
            ConnectionStatus::Rejected => "rejected",
            ConnectionStatus::Expired => "expired",
            ConnectionStatus::Suspended => "suspended",
            ConnectionStatus::Revoked => "revoked",
        }
    }

    /// No further transitions happen without a new connection
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Rejected
                | ConnectionStatus::Expired
                | ConnectionStatus::Suspended
                | ConnectionStatus::Revoked
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "authorizing" => Ok(ConnectionStatus::Authorizing),
            "linked" => Ok(ConnectionStatus::Linked),
            "rejected" => Ok(ConnectionStatus::Rejected),
            "expired" => Ok(ConnectionStatus::Expired),
            "suspended" => Ok(ConnectionStatus::Suspended),
            "revoked" => Ok(ConnectionStatus::Revoked),
            other => Err(format!("Unknown connection status: {}", other)),
        }
    }
}

/// Bank account or card, as the provider exposes them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    #[default]
    Account,
    Card,
}

/// OAuth token pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Provider-specific credentials, tagged by provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ProviderCredentials {
    GoCardless {
        requisition_id: String,
        agreement_id: Option<String>,
    },
    TrueLayer {
        /// None until the authorization code is exchanged
        tokens: Option<OAuthTokens>,
        #[serde(default)]
        account_kind: AccountKind,
    },
}

impl ProviderCredentials {
    pub fn provider(&self) -> ProviderId {
        match self {
            ProviderCredentials::GoCardless { .. } => ProviderId::GoCardless,
            ProviderCredentials::TrueLayer { .. } => ProviderId::TrueLayer,
        }
    }
}

/// Answer to "does the user need to reconnect?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReauthCheck {
    pub required: bool,
    /// Whole days until consent lapses; negative once past
    pub days_remaining: Option<i64>,
}

impl ReauthCheck {
    /// Derive the check from a consent expiry
    pub fn from_expiry(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match expires_at {
            Some(exp) => Self {
                required: exp <= now,
                days_remaining: Some((exp - now).num_days()),
            },
            None => Self {
                required: false,
                days_remaining: None,
            },
        }
    }
}

/// One linked (or linking) bank account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConnection {
    pub id: Uuid,
    pub source_id: Uuid,
    pub institution_id: String,
    pub status: ConnectionStatus,
    pub credentials: ProviderCredentials,
    /// Provider account id this connection syncs
    pub external_account_id: Option<String>,
    pub auth_url: Option<String>,
    /// Expiry of the authorization link itself
    pub link_expires_at: Option<DateTime<Utc>>,
    /// Consent expiry; past this point the connection needs reauth
    pub expires_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderConnection {
    pub fn provider(&self) -> ProviderId {
        self.credentials.provider()
    }

    pub fn is_consent_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn reauth_check(&self, now: DateTime<Utc>) -> ReauthCheck {
        if self.status.is_terminal() {
            return ReauthCheck {
                required: true,
                days_remaining: self.expires_at.map(|exp| (exp - now).num_days()),
            };
        }
        ReauthCheck::from_expiry(self.expires_at, now)
    }
}
