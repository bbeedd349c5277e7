//! Response handling shared by the provider HTTP clients

use std::str::FromStr;
use std::time::Duration;

use reqwest::blocking::Response;
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::domain::result::{Error, Result};
use crate::domain::ProviderId;

/// Request timeout for provider calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// GoCardless reports the per-account quota reset under this header
const GOCARDLESS_RESET_HEADER: &str = "http_x_ratelimit_account_success_reset";

/// Map transport failures to user-facing messages
pub fn request_error(provider: ProviderId, error: reqwest::Error) -> Error {
    let message = if error.is_timeout() {
        format!("Connection timed out after {} seconds", REQUEST_TIMEOUT.as_secs())
    } else if error.is_connect() {
        format!("Unable to connect to {} servers", provider)
    } else {
        format!("Request failed: {}", error)
    };
    Error::provider(provider.as_str(), message)
}

/// Pass 2xx responses through and classify everything else.
///
/// 429 becomes [`Error::RateLimited`]. Statuses in `reauth_statuses` become
/// [`Error::ReauthRequired`] when the call was made for a source.
pub fn error_for_status(
    provider: ProviderId,
    response: Response,
    source_id: Option<Uuid>,
    reauth_statuses: &[u16],
) -> Result<Response> {
    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }

    if status == 429 {
        return Err(Error::RateLimited {
            provider: provider.to_string(),
            retry_after: retry_after(response.headers()),
        });
    }

    let detail = error_detail(response.text().unwrap_or_default());
    if reauth_statuses.contains(&status) {
        if let Some(source_id) = source_id {
            return Err(Error::reauth(source_id.to_string(), format!("HTTP {}: {}", status, detail)));
        }
    }
    Err(Error::provider(provider.as_str(), format!("HTTP {}: {}", status, detail)))
}

/// Backoff hint from `Retry-After` or the GoCardless reset header, in seconds
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    ["retry-after", GOCARDLESS_RESET_HEADER]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Short human-readable reason from an error body
fn error_detail(body: String) -> String {
    let parsed = serde_json::from_str::<JsonValue>(&body).ok();
    let from_json = parsed.as_ref().and_then(|json| {
        ["detail", "summary", "error_description", "error", "message"]
            .iter()
            .find_map(|k| json.get(*k).and_then(|v| v.as_str()).map(str::to_string))
    });
    let detail = from_json.unwrap_or(body);
    let detail = detail.trim();
    if detail.is_empty() {
        "no details".to_string()
    } else {
        detail.chars().take(200).collect()
    }
}

/// Deserialize an amount that can be a JSON number or string
pub fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let value: JsonValue = Deserialize::deserialize(deserializer)?;
    match value {
        JsonValue::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .map_err(|e| D::Error::custom(format!("invalid decimal: {}", e))),
        JsonValue::String(s) => Decimal::from_str(s.trim())
            .map_err(|e| D::Error::custom(format!("invalid decimal: {}", e))),
        _ => Err(D::Error::custom("expected number or string for amount")),
    }
}
