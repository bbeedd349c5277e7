//! Institutions and provider-side accounts

use serde::{Deserialize, Serialize};

use super::connection::{AccountKind, ProviderId};

/// A bank selectable when starting a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Institution {
    pub id: String,
    pub name: String,
    pub provider: ProviderId,
    pub bic: Option<String>,
    pub logo: Option<String>,
    pub countries: Vec<String>,
    /// How far back the bank serves history, when it says
    pub max_history_days: Option<u32>,
}

/// An account as reported by the provider after linking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAccount {
    pub external_id: String,
    pub name: String,
    pub iban: Option<String>,
    pub currency: Option<String>,
    pub kind: AccountKind,
}
