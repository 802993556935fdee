//! Mastodon (and compatible) instances.

use std::time::Duration;

use async_trait::async_trait;
use herald_scheduler::{
    AdapterError, Connection, ExternalRef, Platform, PlatformAdapter, PublishRequest,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http;
use crate::render;

/// Default status length limit of a stock instance.
pub const MAX_STATUS_CHARS: usize = 500;

/// Posts statuses with a bearer access token.
///
/// Every request carries an `Idempotency-Key` derived from the job, so a
/// retry after a lost response does not create a second status.
#[derive(Debug, Clone)]
pub struct MastodonAdapter {
    http: Client,
    max_chars: usize,
}

#[derive(Serialize)]
struct CreateStatus<'a> {
    status: &'a str,
    visibility: &'a str,
}

#[derive(Deserialize)]
struct Status {
    id: String,
    url: Option<String>,
}

impl MastodonAdapter {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            max_chars: MAX_STATUS_CHARS,
        }
    }

    /// Override the length limit for instances that allow longer posts.
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl PlatformAdapter for MastodonAdapter {
    fn platform(&self) -> Platform {
        Platform::Mastodon
    }

    async fn publish(
        &self,
        connection: &Connection,
        request: &PublishRequest<'_>,
        timeout: Duration,
    ) -> Result<ExternalRef, AdapterError> {
        let url = format!("{}/api/v1/statuses", http::base_url(connection)?);
        let text = render::social_text(request.payload);
        let length = text.chars().count();
        if length > self.max_chars {
            return Err(AdapterError::InvalidPayload(format!(
                "status is {length} characters, limit is {}",
                self.max_chars
            )));
        }

        let response = self
            .http
            .post(&url)
            .bearer_auth(&connection.secret)
            .header("Idempotency-Key", request.idempotency_key(Platform::Mastodon))
            .timeout(timeout)
            .json(&CreateStatus {
                status: &text,
                visibility: "public",
            })
            .send()
            .await
            .map_err(|e| http::error_from_reqwest(e, timeout))?;

        if !response.status().is_success() {
            return Err(http::error_from_response(response).await);
        }

        let status: Status = response
            .json()
            .await
            .map_err(|e| http::error_from_reqwest(e, timeout))?;
        debug!(status_id = %status.id, "created mastodon status");

        let external_ref = ExternalRef::new(status.id);
        Ok(match status.url {
            Some(url) => external_ref.with_url(url),
            None => external_ref,
        })
    }
}
