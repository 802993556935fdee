//! Capability seams to the outside world: platform adapters, the
//! connection registry and the pre-dispatch guard.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::state::{AttemptFailure, AttemptOutcome};
use crate::{ExternalRef, FailureKind, JobId, Payload, Platform, ScheduledJob};

/// Saved credentials for one owner on one platform.
#[derive(Clone, Serialize, Deserialize)]
pub struct Connection {
    pub owner_id: String,
    pub platform: Platform,
    /// Handle, username or account id on the platform.
    pub account: String,
    /// Instance or site base URL for self-hosted platforms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// App password or access token.
    pub secret: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("owner_id", &self.owner_id)
            .field("platform", &self.platform)
            .field("account", &self.account)
            .field("endpoint", &self.endpoint)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Errors resolving a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no {platform} connection for {owner_id}")]
    NotFound { owner_id: String, platform: Platform },

    #[error("{platform} connection is unusable: {reason}")]
    Invalid { platform: Platform, reason: String },
}

/// Resolves a user's saved connection for a platform.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn resolve(&self, owner_id: &str, platform: Platform)
    -> Result<Connection, ConnectionError>;
}

/// Connection registry backed by an in-memory map.
#[derive(Debug, Default, Clone)]
pub struct MemoryConnectionRegistry {
    connections: HashMap<(String, Platform), Connection>,
}

impl MemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_connections(connections: impl IntoIterator<Item = Connection>) -> Self {
        let mut registry = Self::new();
        for connection in connections {
            registry.insert(connection);
        }
        registry
    }

    /// Add or replace a connection.
    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(
            (connection.owner_id.clone(), connection.platform),
            connection,
        );
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryConnectionRegistry {
    async fn resolve(
        &self,
        owner_id: &str,
        platform: Platform,
    ) -> Result<Connection, ConnectionError> {
        let connection = self
            .connections
            .get(&(owner_id.to_string(), platform))
            .ok_or_else(|| ConnectionError::NotFound {
                owner_id: owner_id.to_string(),
                platform,
            })?;

        if connection.secret.is_empty() {
            return Err(ConnectionError::Invalid {
                platform,
                reason: "credentials are empty".to_string(),
            });
        }
        Ok(connection.clone())
    }
}

/// What an adapter is asked to publish.
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub job_id: JobId,
    pub title: &'a str,
    pub payload: &'a Payload,
    /// 1-based attempt number for this target.
    pub attempt: u32,
}

impl PublishRequest<'_> {
    /// Stable key for platforms that deduplicate retried requests.
    pub fn idempotency_key(&self, platform: Platform) -> String {
        format!("herald-{}-{}", self.job_id, platform)
    }
}

/// Classified adapter failure.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("rate limited{}", retry_after.as_ref().map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl AdapterError {
    /// Classify an HTTP error response.
    ///
    /// 408, 429 and 5xx are transient; 401/403 are auth failures; any
    /// other status is a permanent rejection.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            429 => AdapterError::RateLimited { retry_after },
            408 | 500..=599 => AdapterError::Server { status, message },
            401 | 403 => AdapterError::Auth(format!("{status}: {message}")),
            _ => AdapterError::Rejected { status, message },
        }
    }

    /// Transient errors are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout(_)
                | AdapterError::RateLimited { .. }
                | AdapterError::Server { .. }
                | AdapterError::Network(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Structured form for the attempt log.
    pub fn details(&self) -> serde_json::Value {
        let kind = match self {
            AdapterError::Timeout(_) => "timeout",
            AdapterError::RateLimited { .. } => "rate_limited",
            AdapterError::Server { .. } => "server",
            AdapterError::Network(_) => "network",
            AdapterError::Auth(_) => "auth",
            AdapterError::Rejected { .. } => "rejected",
            AdapterError::InvalidPayload(_) => "invalid_payload",
        };
        let status = match self {
            AdapterError::Server { status, .. } | AdapterError::Rejected { status, .. } => {
                Some(*status)
            }
            AdapterError::RateLimited { .. } => Some(429),
            _ => None,
        };
        json!({
            "error": kind,
            "status": status,
            "message": self.to_string(),
            "retry_after_secs": self.retry_after().map(|d| d.as_secs()),
        })
    }
}

impl From<AdapterError> for AttemptOutcome {
    fn from(error: AdapterError) -> Self {
        let kind = if error.is_transient() {
            FailureKind::AdapterTransient
        } else {
            FailureKind::AdapterPermanent
        };
        AttemptOutcome::Failed(
            AttemptFailure::new(kind, error.to_string())
                .with_retry_after(error.retry_after())
                .with_details(error.details()),
        )
    }
}

/// Platform-specific publishing client.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// The platform this adapter publishes to.
    fn platform(&self) -> Platform;

    /// Publish `request` using `connection`.
    ///
    /// `timeout` is the budget the dispatcher enforces around this call;
    /// adapters pass it on to their HTTP clients.
    async fn publish(
        &self,
        connection: &Connection,
        request: &PublishRequest<'_>,
        timeout: Duration,
    ) -> Result<ExternalRef, AdapterError>;
}

/// Adapters keyed by platform.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same platform.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

/// Precondition checked once before a job's first dispatch (e.g. a credit
/// ledger). A refusal fails every target permanently.
#[async_trait]
pub trait PublishGuard: Send + Sync {
    async fn admit(&self, job: &ScheduledJob) -> Result<(), String>;
}

/// Guard that admits every job.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl PublishGuard for AllowAll {
    async fn admit(&self, _job: &ScheduledJob) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(secret: &str) -> Connection {
        Connection {
            owner_id: "user-1".to_string(),
            platform: Platform::Mastodon,
            account: "@herald@example.social".to_string(),
            endpoint: Some("https://example.social".to_string()),
            secret: secret.to_string(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(AdapterError::from_status(500, "boom", None).is_transient());
        assert!(AdapterError::from_status(503, "down", None).is_transient());
        assert!(AdapterError::from_status(408, "slow", None).is_transient());
        assert!(AdapterError::from_status(429, "", None).is_transient());
        assert!(!AdapterError::from_status(401, "bad token", None).is_transient());
        assert!(!AdapterError::from_status(403, "forbidden", None).is_transient());
        assert!(!AdapterError::from_status(422, "too long", None).is_transient());
        assert!(matches!(
            AdapterError::from_status(401, "bad token", None),
            AdapterError::Auth(_)
        ));
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let err = AdapterError::from_status(429, "", Some(Duration::from_secs(120)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(120)));
        assert_eq!(err.to_string(), "rate limited (retry after 120s)");
        assert_eq!(err.details()["retry_after_secs"], 120);
    }

    #[test]
    fn test_adapter_error_into_outcome() {
        let outcome: AttemptOutcome = AdapterError::Timeout(Duration::from_secs(30)).into();
        match outcome {
            AttemptOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::AdapterTransient);
                assert_eq!(failure.message, "timed out after 30s");
                assert_eq!(failure.details["error"], "timeout");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let outcome: AttemptOutcome = AdapterError::Auth("401: bad token".to_string()).into();
        match outcome {
            AttemptOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::AdapterPermanent)
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_connection_debug_redacts_secret() {
        let debug = format!("{:?}", connection("hunter2"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_memory_registry_resolve() {
        let registry = MemoryConnectionRegistry::from_connections([connection("token")]);
        assert!(registry.resolve("user-1", Platform::Mastodon).await.is_ok());
        assert!(matches!(
            registry.resolve("user-1", Platform::Bluesky).await,
            Err(ConnectionError::NotFound { .. })
        ));
        assert!(matches!(
            registry.resolve("user-2", Platform::Mastodon).await,
            Err(ConnectionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_secret_is_invalid() {
        let registry = MemoryConnectionRegistry::from_connections([connection("")]);
        assert!(matches!(
            registry.resolve("user-1", Platform::Mastodon).await,
            Err(ConnectionError::Invalid { .. })
        ));
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let payload = Payload::default();
        let request = PublishRequest {
            job_id: JobId::new(),
            title: "t",
            payload: &payload,
            attempt: 1,
        };
        let again = PublishRequest {
            attempt: 2,
            ..request
        };
        assert_eq!(
            request.idempotency_key(Platform::Mastodon),
            again.idempotency_key(Platform::Mastodon)
        );
    }
}
