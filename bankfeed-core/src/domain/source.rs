//! Source domain model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dedupe::source_identifier;
use super::mapping::FieldMapping;

/// How transactions reach a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// User-uploaded CSV exports only
    Csv,
    /// Linked to a banking provider connection
    Provider,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Csv => write!(f, "csv"),
            SourceKind::Provider => write!(f, "provider"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(SourceKind::Csv),
            "provider" => Ok(SourceKind::Provider),
            other => Err(format!("Unknown source kind: {}", other)),
        }
    }
}

/// A bank account or CSV-origin identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    /// Absent for card accounts; the id then stands in for dedupe
    pub iban: Option<String>,
    pub currency: String,
    pub kind: SourceKind,
    /// Column assignments reused by later CSV imports
    pub field_mappings: Option<Vec<FieldMapping>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn new(name: impl Into<String>, kind: SourceKind, currency: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            iban: None,
            currency: currency.into().trim().to_uppercase(),
            kind,
            field_mappings: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_iban(mut self, iban: impl Into<String>) -> Self {
        let iban = iban.into();
        self.iban = if iban.trim().is_empty() { None } else { Some(iban) };
        self
    }

    /// Identifier fed into the dedupe hash
    pub fn dedupe_identifier(&self) -> String {
        source_identifier(self.iban.as_deref(), &self.id.to_string())
    }
}
