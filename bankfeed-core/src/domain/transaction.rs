//! Transaction domain model

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::dedupe::dedupe_hash;
use super::source::Source;

/// The canonical ingested record.
///
/// `amount` is signed minor units. At most one non-superseded row may exist
/// per `(source_id, dedupe_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub source_id: Uuid,
    pub date: NaiveDate,
    pub amount: i64,
    /// ISO 4217, uppercase
    pub currency: String,
    pub name: String,
    pub description: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    pub dedupe_hash: String,
    pub import_job_id: Option<Uuid>,
    pub sync_job_id: Option<Uuid>,
    /// Raw values as received. Audit only, never read back into logic.
    #[serde(rename = "_original")]
    pub original: JsonValue,
    pub superseded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Which ingestion run produced a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOrigin {
    Import(Uuid),
    Sync(Uuid),
}

/// A normalized candidate that has not been stored yet.
///
/// Provider adapters and the CSV row mapper both produce these; the ingest
/// pipeline turns them into [`Transaction`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingTransaction {
    pub date: NaiveDate,
    pub amount: i64,
    /// Falls back to the source currency when absent
    pub currency: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    /// Provider-side id, kept in `original` only
    pub external_id: Option<String>,
    pub original: JsonValue,
}

impl IncomingTransaction {
    pub fn new(date: NaiveDate, amount: i64, name: impl Into<String>) -> Self {
        Self {
            date,
            amount,
            currency: None,
            name: name.into(),
            description: None,
            counterparty_name: None,
            counterparty_iban: None,
            reference: None,
            external_id: None,
            original: JsonValue::Null,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    /// Dedupe hash of this candidate for a given source identifier
    pub fn dedupe_hash(&self, identifier: &str) -> String {
        dedupe_hash(self.date, self.amount, identifier, self.reference.as_deref())
    }

    /// Materialize into a storable transaction owned by `source`
    pub fn into_transaction(self, source: &Source, origin: IngestOrigin, now: DateTime<Utc>) -> Transaction {
        let hash = self.dedupe_hash(&source.dedupe_identifier());
        let (import_job_id, sync_job_id) = match origin {
            IngestOrigin::Import(id) => (Some(id), None),
            IngestOrigin::Sync(id) => (None, Some(id)),
        };

        Transaction {
            id: Uuid::new_v4(),
            source_id: source.id,
            date: self.date,
            amount: self.amount,
            currency: self
                .currency
                .filter(|c| !c.trim().is_empty())
                .map(|c| c.trim().to_uppercase())
                .unwrap_or_else(|| source.currency.clone()),
            name: self.name,
            description: self.description,
            counterparty_name: self.counterparty_name,
            counterparty_iban: self.counterparty_iban,
            reference: self.reference.filter(|r| !r.trim().is_empty()),
            dedupe_hash: hash,
            import_job_id,
            sync_job_id,
            original: self.original,
            superseded_at: None,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::source::SourceKind;

    #[test]
    fn test_into_transaction_uses_source_defaults() {
        let source = Source::new("Girokonto", SourceKind::Csv, "eur").with_iban("DE89 3704 0044 0532 0130 00");
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let job = Uuid::new_v4();

        let tx = IncomingTransaction::new(date, -1999, "Coffee")
            .with_reference("  ")
            .into_transaction(&source, IngestOrigin::Import(job), Utc::now());

        assert_eq!(tx.currency, "EUR");
        assert_eq!(tx.import_job_id, Some(job));
        assert!(tx.sync_job_id.is_none());
        assert!(tx.reference.is_none());
        assert_eq!(
            tx.dedupe_hash,
            dedupe_hash(date, -1999, "DE89370400440532013000", None)
        );
    }

    #[test]
    fn test_original_serializes_with_underscore() {
        let source = Source::new("Card", SourceKind::Provider, "GBP");
        let mut incoming = IncomingTransaction::new(
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            500,
            "Refund",
        )
        .with_currency("gbp");
        incoming.original = serde_json::json!({"amount": 5.0});

        let tx = incoming.into_transaction(&source, IngestOrigin::Sync(Uuid::new_v4()), Utc::now());
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["_original"]["amount"], serde_json::json!(5.0));
        assert_eq!(json["currency"], "GBP");
    }
}
