//! Source service - registering and listing sources

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::adapters::duckdb::DuckDbRepository;
use crate::domain::result::{Error, Result};
use crate::domain::{ConnectionStatus, ProviderId, Source, SourceKind};

/// A source together with its provider link, for listings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub source: Source,
    pub transaction_count: i64,
    pub provider: Option<ProviderId>,
    pub connection_status: Option<ConnectionStatus>,
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_sync_error: Option<String>,
}

pub struct SourceService {
    repository: Arc<DuckDbRepository>,
}

impl SourceService {
    pub fn new(repository: Arc<DuckDbRepository>) -> Self {
        Self { repository }
    }

    /// Register a source. Names must be unique so they can be used as handles.
    pub fn create(
        &self,
        name: &str,
        kind: SourceKind,
        currency: &str,
        iban: Option<&str>,
    ) -> Result<Source> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::config("Source name cannot be empty"));
        }
        let currency = currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(Error::config(format!("'{}' is not an ISO 4217 currency code", currency)));
        }
        if self.repository.list_sources()?.iter().any(|s| s.name == name) {
            return Err(Error::config(format!("A source named '{}' already exists", name)));
        }

        let mut source = Source::new(name, kind, currency);
        if let Some(iban) = iban {
            source = source.with_iban(iban);
        }
        self.repository.upsert_source(&source)?;
        tracing::info!(source_id = %source.id, kind = %kind, "source created");
        Ok(source)
    }

    pub fn get(&self, id_or_name: &str) -> Result<Source> {
        self.repository.resolve_source(id_or_name)
    }

    pub fn list(&self) -> Result<Vec<SourceSummary>> {
        self.repository
            .list_sources()?
            .into_iter()
            .map(|source| self.summarize(source))
            .collect()
    }

    fn summarize(&self, source: Source) -> Result<SourceSummary> {
        let connection = self.repository.current_connection(source.id)?;
        Ok(SourceSummary {
            transaction_count: self.repository.transaction_count(source.id)?,
            provider: connection.as_ref().map(|c| c.provider()),
            connection_status: connection.as_ref().map(|c| c.status),
            last_sync_at: connection.as_ref().and_then(|c| c.last_sync_at),
            last_sync_error: connection.and_then(|c| c.last_sync_error),
            source,
        })
    }

    /// Forget saved CSV column mappings so the matcher runs again
    pub fn clear_field_mappings(&self, source_id: Uuid) -> Result<()> {
        self.repository.set_source_field_mappings(source_id, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SourceService {
        SourceService::new(Arc::new(DuckDbRepository::in_memory().unwrap()))
    }

    #[test]
    fn test_create_and_list() {
        let service = service();
        let source = service
            .create("Giro", SourceKind::Csv, "eur", Some("DE89 3704 0044 0532 0130 00"))
            .unwrap();
        assert_eq!(source.currency, "EUR");

        let listed = service.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].source.id, source.id);
        assert_eq!(listed[0].transaction_count, 0);
        assert!(listed[0].provider.is_none());

        assert_eq!(service.get("Giro").unwrap().id, source.id);
    }

    #[test]
    fn test_rejects_duplicates_and_bad_currency() {
        let service = service();
        service.create("Giro", SourceKind::Csv, "EUR", None).unwrap();
        assert!(service.create("Giro", SourceKind::Csv, "EUR", None).is_err());
        assert!(service.create("Card", SourceKind::Csv, "EURO", None).is_err());
        assert!(service.create("  ", SourceKind::Csv, "EUR", None).is_err());
    }

    #[test]
    fn test_clear_field_mappings() {
        use crate::domain::{CanonicalField, FieldMapping};

        let service = service();
        let source = service.create("Giro", SourceKind::Csv, "EUR", None).unwrap();
        service
            .repository
            .set_source_field_mappings(
                source.id,
                &[FieldMapping::manual("Betrag", CanonicalField::Amount, Some("de".into()))],
            )
            .unwrap();
        assert!(service.get("Giro").unwrap().field_mappings.is_some());

        service.clear_field_mappings(source.id).unwrap();
        assert!(service.get("Giro").unwrap().field_mappings.is_none());
    }
}
