//! Shared HTTP plumbing for the REST adapters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_scheduler::{AdapterError, Connection};
use reqwest::Response;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;

/// Longest error body kept in messages and logs.
const MAX_ERROR_BODY: usize = 500;

/// Parse a `Retry-After` header, either delta-seconds or an HTTP date.
pub(crate) fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}

/// Turn a non-success response into a classified error.
pub(crate) async fn error_from_response(response: Response) -> AdapterError {
    let status = response.status().as_u16();
    let retry_after = retry_after(response.headers(), Utc::now());
    let body = response.text().await.unwrap_or_default();
    AdapterError::from_status(status, error_message(&body), retry_after)
}

/// Pull a readable message out of an error body.
fn error_message(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        ["message", "error_description", "error"]
            .iter()
            .find_map(|key| json.get(key).and_then(Value::as_str).map(str::to_string))
    });
    let mut message = message.unwrap_or_else(|| body.trim().to_string());
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
        message.push_str("...");
    }
    message
}

/// Classify a transport-level failure.
pub(crate) fn error_from_reqwest(e: reqwest::Error, timeout: Duration) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Timeout(timeout)
    } else if e.is_decode() {
        // The request went through; retrying could publish twice.
        AdapterError::Rejected {
            status: e.status().map_or(200, |s| s.as_u16()),
            message: format!("unreadable response: {e}"),
        }
    } else {
        AdapterError::Network(e.to_string())
    }
}

/// Base URL of a self-hosted platform, without a trailing slash.
pub(crate) fn base_url(connection: &Connection) -> Result<&str, AdapterError> {
    connection
        .endpoint
        .as_deref()
        .map(|url| url.trim_end_matches('/'))
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            AdapterError::Auth(format!(
                "{} connection for {} has no endpoint",
                connection.platform, connection.account
            ))
        })
}
