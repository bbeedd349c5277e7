//! Audit records for ingestion runs

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::mapping::FieldMapping;

/// Exact accounting of one run. `imported + skipped + errored == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestCounts {
    pub total: usize,
    pub imported: usize,
    /// Duplicates, not errors
    pub skipped: usize,
    pub errored: usize,
}

impl IngestCounts {
    pub fn is_balanced(&self) -> bool {
        self.imported + self.skipped + self.errored == self.total
    }

    /// `n` rows that never reached the pipeline
    pub fn rejected(n: usize) -> Self {
        Self {
            total: n,
            errored: n,
            ..Default::default()
        }
    }

    pub fn merge(&mut self, other: IngestCounts) {
        self.total += other.total;
        self.imported += other.imported;
        self.skipped += other.skipped;
        self.errored += other.errored;
    }
}

/// A row that could not be turned into a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    /// 1-based data row number (header excluded)
    pub row: usize,
    pub message: String,
    pub raw: BTreeMap<String, String>,
}

impl RowError {
    /// Error for a provider record; top-level fields are kept as text
    pub fn from_json(row: usize, message: impl Into<String>, raw: &JsonValue) -> Self {
        let raw = match raw {
            JsonValue::Object(fields) => fields
                .iter()
                .map(|(k, v)| {
                    let text = match v {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), text)
                })
                .collect(),
            other => BTreeMap::from([("value".to_string(), other.to_string())]),
        };
        Self {
            row,
            message: message.into(),
            raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Scheduled,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Scheduled => "scheduled",
            SyncTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One provider sync attempt for one source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: Uuid,
    pub source_id: Uuid,
    pub connection_id: Uuid,
    pub trigger: SyncTrigger,
    pub status: JobStatus,
    pub window_from: NaiveDate,
    pub window_to: NaiveDate,
    pub counts: IngestCounts,
    /// Provider records that could not be mapped
    #[serde(default)]
    pub row_errors: Vec<RowError>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn start(
        source_id: Uuid,
        connection_id: Uuid,
        trigger: SyncTrigger,
        window: (NaiveDate, NaiveDate),
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            connection_id,
            trigger,
            status: JobStatus::Running,
            window_from: window.0,
            window_to: window.1,
            counts: IngestCounts::default(),
            row_errors: Vec::new(),
            error: None,
            started_at: now,
            finished_at: None,
        }
    }
}

/// One CSV import, kept so it can be re-mapped without re-uploading
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    pub file_name: String,
    /// Copy of the uploaded file under the data directory
    pub raw_file_path: String,
    pub headers: Vec<String>,
    pub field_mappings: Vec<FieldMapping>,
    pub counts: IngestCounts,
    pub row_errors: Vec<RowError>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Set when this import re-ran an earlier one with new mappings
    pub remapped_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
