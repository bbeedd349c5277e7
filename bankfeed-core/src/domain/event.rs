//! Notification events handed to the external notification collaborator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewTransactions,
    SyncFailed,
    ReauthRequired,
    ReauthReminder,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewTransactions => "new_transactions",
            EventKind::SyncFailed => "sync_failed",
            EventKind::ReauthRequired => "reauth_required",
            EventKind::ReauthReminder => "reauth_reminder",
        }
    }
}

/// A structured event. Rendering and delivery happen elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub source_id: Uuid,
    pub message: String,
    pub imported: Option<usize>,
    pub skipped: Option<usize>,
    pub days_remaining: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl SyncEvent {
    pub fn new(kind: EventKind, source_id: Uuid, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            source_id,
            message: message.into(),
            imported: None,
            skipped: None,
            days_remaining: None,
            created_at: now,
        }
    }

    pub fn with_counts(mut self, imported: usize, skipped: usize) -> Self {
        self.imported = Some(imported);
        self.skipped = Some(skipped);
        self
    }

    pub fn with_days_remaining(mut self, days: i64) -> Self {
        self.days_remaining = Some(days);
        self
    }
}
