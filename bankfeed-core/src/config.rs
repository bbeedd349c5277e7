//! Configuration management
//!
//! Settings live in `settings.json` inside the data directory:
//! ```json
//! {
//!   "providers": {
//!     "gocardless": { "secretId": "...", "secretKey": "..." },
//!     "truelayer": { "clientId": "...", "clientSecret": "...", "sandbox": true }
//!   },
//!   "sync": { "minResyncHours": 6, "overlapDays": 2, ... },
//!   "import": { "region": "de" }
//! }
//! ```
//! Keys this crate does not manage are kept when saving.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::parsing::Region;

pub const GOCARDLESS_SECRET_ID_ENV: &str = "BANKFEED_GOCARDLESS_SECRET_ID";
pub const GOCARDLESS_SECRET_KEY_ENV: &str = "BANKFEED_GOCARDLESS_SECRET_KEY";
pub const TRUELAYER_CLIENT_ID_ENV: &str = "BANKFEED_TRUELAYER_CLIENT_ID";
pub const TRUELAYER_CLIENT_SECRET_ENV: &str = "BANKFEED_TRUELAYER_CLIENT_SECRET";
pub const TRUELAYER_SANDBOX_ENV: &str = "BANKFEED_TRUELAYER_SANDBOX";

/// Raw settings.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default)]
    providers: ProviderSettings,
    #[serde(default)]
    sync: SyncSettings,
    #[serde(default)]
    import: ImportSettings,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gocardless: Option<GoCardlessSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truelayer: Option<TrueLayerSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoCardlessSettings {
    #[serde(default)]
    pub secret_id: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl GoCardlessSettings {
    pub fn is_configured(&self) -> bool {
        !self.secret_id.trim().is_empty() && !self.secret_key.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrueLayerSettings {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
}

impl TrueLayerSettings {
    pub fn is_configured(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }
}

/// Sync orchestration knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Scheduled runs skip sources synced more recently than this
    pub min_resync_hours: i64,
    /// Days re-fetched before `last_sync_at`
    pub overlap_days: i64,
    /// History fetched on a first sync
    pub initial_lookback_days: i64,
    /// Consent expiring within this many days triggers a reminder
    pub reauth_reminder_days: i64,
    /// Minimum gap between two reauth notifications for one source
    pub notification_cooldown_hours: i64,
    pub max_parallel_sources: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            min_resync_hours: 6,
            overlap_days: 2,
            initial_lookback_days: 90,
            reauth_reminder_days: 7,
            notification_cooldown_hours: 24,
            max_parallel_sources: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSettings {
    #[serde(default)]
    pub region: Region,
}

/// Bankfeed configuration (view of settings.json plus environment overrides)
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub gocardless: GoCardlessSettings,
    pub truelayer: TrueLayerSettings,
    pub sync: SyncSettings,
    pub import: ImportSettings,
}

impl Config {
    /// Load config from the data directory, then apply `BANKFEED_*` overrides
    pub fn load(data_dir: &Path) -> Result<Self> {
        let raw = read_settings(data_dir)?;
        let mut config = Self {
            gocardless: raw.providers.gocardless.unwrap_or_default(),
            truelayer: raw.providers.truelayer.unwrap_or_default(),
            sync: raw.sync,
            import: raw.import,
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var(GOCARDLESS_SECRET_ID_ENV) {
            self.gocardless.secret_id = v;
        }
        if let Some(v) = var(GOCARDLESS_SECRET_KEY_ENV) {
            self.gocardless.secret_key = v;
        }
        if let Some(v) = var(TRUELAYER_CLIENT_ID_ENV) {
            self.truelayer.client_id = v;
        }
        if let Some(v) = var(TRUELAYER_CLIENT_SECRET_ENV) {
            self.truelayer.client_secret = v;
        }
        match var(TRUELAYER_SANDBOX_ENV).as_deref() {
            Some("true" | "1" | "yes" | "TRUE" | "YES") => self.truelayer.sandbox = true,
            Some("false" | "0" | "no" | "FALSE" | "NO") => self.truelayer.sandbox = false,
            _ => {}
        }
    }

    /// Save config to the data directory.
    ///
    /// Environment overrides are not written back; unknown keys are preserved.
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let mut settings = read_settings(data_dir)?;

        settings.providers.gocardless = Some(self.gocardless.clone()).filter(|g| g.is_configured() || g.base_url.is_some());
        settings.providers.truelayer = Some(self.truelayer.clone()).filter(|t| t.is_configured() || t.sandbox);
        settings.sync = self.sync.clone();
        settings.import = self.import.clone();

        std::fs::create_dir_all(data_dir)?;
        let content = serde_json::to_string_pretty(&settings)?;
        std::fs::write(data_dir.join("settings.json"), content)?;
        Ok(())
    }
}

fn read_settings(data_dir: &Path) -> Result<SettingsFile> {
    let settings_path = data_dir.join("settings.json");
    if !settings_path.exists() {
        return Ok(SettingsFile::default());
    }
    let content = std::fs::read_to_string(&settings_path)
        .with_context(|| format!("Failed to read {}", settings_path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid settings file {}", settings_path.display()))
}
