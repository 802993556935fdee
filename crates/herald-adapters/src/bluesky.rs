//! Bluesky via the AT Protocol SDK.

use std::time::Duration;

use async_trait::async_trait;
use atrium_api::app::bsky::feed::post::RecordData as PostRecordData;
use atrium_api::types::string::Datetime;
use bsky_sdk::BskyAgent;
use bsky_sdk::agent::config::Config as BskyConfig;
use bsky_sdk::rich_text::RichText;
use herald_scheduler::{
    AdapterError, Connection, ExternalRef, Platform, PlatformAdapter, PublishRequest,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::render;

/// Default PDS when the connection names none.
pub const DEFAULT_PDS: &str = "https://bsky.social";

/// Post length limit.
pub const MAX_POST_CHARS: usize = 300;

/// Recent posts searched for an earlier attempt's post.
const RECENT_POSTS: u8 = 25;

/// Publishes posts with an app password.
///
/// Each publish logs in with the connection's handle and app password, so
/// there is no session state to refresh between attempts.
///
/// `createRecord` takes no idempotency key, and a post can land after the
/// dispatcher's timeout has already failed the attempt. Retries therefore
/// look for a recent post with the same text and return it instead of
/// posting again.
#[derive(Debug, Clone, Default)]
pub struct BlueskyAdapter;

impl BlueskyAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn login(connection: &Connection) -> Result<BskyAgent, AdapterError> {
        let pds_url = connection
            .endpoint
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_PDS);

        let agent = if pds_url == DEFAULT_PDS {
            BskyAgent::builder()
                .build()
                .await
                .map_err(|e| classify(e.to_string()))?
        } else {
            let config = BskyConfig {
                endpoint: pds_url.to_string(),
                ..Default::default()
            };
            BskyAgent::builder()
                .config(config)
                .build()
                .await
                .map_err(|e| classify(e.to_string()))?
        };

        agent
            .login(&connection.account, &connection.secret)
            .await
            .map_err(|e| match classify(e.to_string()) {
                AdapterError::Rejected { message, .. } => AdapterError::Auth(message),
                other => other,
            })?;

        info!(handle = %connection.account, pds = %pds_url, "authenticated with bluesky");
        Ok(agent)
    }

    /// AT URI of a recent post of ours with exactly `text`, if any.
    async fn find_published(agent: &BskyAgent, text: &str) -> Result<Option<String>, AdapterError> {
        let Some(session) = agent.get_session().await else {
            return Ok(None);
        };
        let params = atrium_api::app::bsky::feed::get_author_feed::ParametersData {
            actor: session
                .did
                .to_string()
                .parse()
                .map_err(|e| AdapterError::Auth(format!("invalid session DID: {e}")))?,
            cursor: None,
            filter: None,
            include_pins: None,
            limit: RECENT_POSTS.try_into().ok(),
        };

        let output = agent
            .api
            .app
            .bsky
            .feed
            .get_author_feed(params.into())
            .await
            .map_err(|e| classify(e.to_string()))?;

        let posts: Vec<(String, Option<String>)> = output
            .feed
            .iter()
            .filter(|item| item.reason.is_none())
            .map(|item| (item.post.uri.clone(), record_text(&item.post.record)))
            .collect();
        Ok(matching_post(&posts, text).map(str::to_string))
    }
}

#[async_trait]
impl PlatformAdapter for BlueskyAdapter {
    fn platform(&self) -> Platform {
        Platform::Bluesky
    }

    async fn publish(
        &self,
        connection: &Connection,
        request: &PublishRequest<'_>,
        _timeout: Duration,
    ) -> Result<ExternalRef, AdapterError> {
        let text = render::social_text(request.payload);
        let length = text.chars().count();
        if length > MAX_POST_CHARS {
            return Err(AdapterError::InvalidPayload(format!(
                "post is {length} characters, limit is {MAX_POST_CHARS}"
            )));
        }

        let agent = Self::login(connection).await?;

        if request.attempt > 1 {
            if let Some(uri) = Self::find_published(&agent, &text).await? {
                info!(uri = %uri, attempt = request.attempt, "earlier attempt already posted");
                return Ok(external_ref(uri));
            }
        }

        // Mentions, links and hashtags become facets
        let rt = RichText::new_with_detect_facets(&text)
            .await
            .map_err(|e| classify(e.to_string()))?;

        let record_data = PostRecordData {
            created_at: Datetime::now(),
            embed: None,
            entities: None,
            facets: rt.facets,
            labels: None,
            langs: None,
            reply: None,
            tags: None,
            text: rt.text,
        };

        let output = agent
            .create_record(record_data)
            .await
            .map_err(|e| classify(e.to_string()))?;

        let uri = output.uri.to_string();
        debug!(uri = %uri, "created bluesky post");
        Ok(external_ref(uri))
    }
}

fn external_ref(uri: String) -> ExternalRef {
    match post_url(&uri) {
        Some(url) => ExternalRef::new(uri).with_url(url),
        None => ExternalRef::new(uri),
    }
}

#[derive(Deserialize)]
struct PostText {
    text: String,
}

fn record_text(record: &atrium_api::types::Unknown) -> Option<String> {
    serde_json::from_value::<PostText>(serde_json::to_value(record).ok()?)
        .ok()
        .map(|post| post.text)
}

/// First post (newest first) whose text is exactly `text`.
fn matching_post<'a>(posts: &'a [(String, Option<String>)], text: &str) -> Option<&'a str> {
    posts
        .iter()
        .find(|(_, post_text)| post_text.as_deref() == Some(text))
        .map(|(uri, _)| uri.as_str())
}

/// Classify an SDK error from its message.
fn classify(error: String) -> AdapterError {
    if error.contains("RateLimitExceeded") || error.contains("429") {
        AdapterError::RateLimited { retry_after: None }
    } else if ["AuthenticationRequired", "InvalidToken", "ExpiredToken", "AccountTakedown", "401"]
        .iter()
        .any(|marker| error.contains(marker))
    {
        AdapterError::Auth(error)
    } else if error.contains("InvalidRequest") || error.contains("400") {
        AdapterError::Rejected {
            status: 400,
            message: error,
        }
    } else if ["500", "502", "503", "504"].iter().any(|code| error.contains(code)) {
        AdapterError::Server {
            status: 502,
            message: error,
        }
    } else {
        AdapterError::Network(error)
    }
}

/// Public web URL for a post's AT URI.
fn post_url(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.split('/');
    let (did, collection, rkey) = (parts.next()?, parts.next()?, parts.next()?);
    if collection != "app.bsky.feed.post" || rkey.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(format!("https://bsky.app/profile/{did}/post/{rkey}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_scheduler::{JobId, Payload};

    #[test]
    fn test_post_url() {
        assert_eq!(
            post_url("at://did:plc:abc123/app.bsky.feed.post/3kxyz").as_deref(),
            Some("https://bsky.app/profile/did:plc:abc123/post/3kxyz")
        );
        assert_eq!(post_url("at://did:plc:abc123/app.bsky.feed.like/3kxyz"), None);
        assert_eq!(post_url("https://bsky.app"), None);
    }

    #[test]
    fn test_matching_post() {
        let posts = vec![
            (
                "at://did:plc:abc/app.bsky.feed.post/3new".to_string(),
                Some("Something else".to_string()),
            ),
            ("at://did:plc:abc/app.bsky.feed.post/3gap".to_string(), None),
            (
                "at://did:plc:abc/app.bsky.feed.post/3mid".to_string(),
                Some("We shipped\n\n#rust".to_string()),
            ),
            (
                "at://did:plc:abc/app.bsky.feed.post/3old".to_string(),
                Some("We shipped\n\n#rust".to_string()),
            ),
        ];

        assert_eq!(
            matching_post(&posts, "We shipped\n\n#rust"),
            Some("at://did:plc:abc/app.bsky.feed.post/3mid")
        );
        assert_eq!(matching_post(&posts, "We shipped"), None);
        assert_eq!(matching_post(&[], "We shipped"), None);
    }

    #[test]
    fn test_external_ref_for_found_post() {
        let found = external_ref("at://did:plc:abc/app.bsky.feed.post/3mid".to_string());
        assert_eq!(found.id, "at://did:plc:abc/app.bsky.feed.post/3mid");
        assert_eq!(
            found.url.as_deref(),
            Some("https://bsky.app/profile/did:plc:abc/post/3mid")
        );
    }

    #[test]
    fn test_record_text() {
        let record: atrium_api::types::Unknown = serde_json::from_value(serde_json::json!({
            "$type": "app.bsky.feed.post",
            "text": "We shipped",
            "createdAt": "2026-03-01T09:00:00.000Z"
        }))
        .unwrap();
        assert_eq!(record_text(&record).as_deref(), Some("We shipped"));
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify("XRPC error: RateLimitExceeded".to_string()),
            AdapterError::RateLimited { .. }
        ));
        assert!(matches!(
            classify("AuthenticationRequired: Invalid identifier or password".to_string()),
            AdapterError::Auth(_)
        ));
        assert!(matches!(
            classify("InvalidRequest: Record/text must not be longer than 300 graphemes".to_string()),
            AdapterError::Rejected { status: 400, .. }
        ));
        assert!(matches!(
            classify("XRPC error: status 503".to_string()),
            AdapterError::Server { .. }
        ));
        let err = classify("error sending request: connection refused".to_string());
        assert!(matches!(err, AdapterError::Network(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_overlong_post_rejected_before_login() {
        let payload = Payload {
            text: "a".repeat(MAX_POST_CHARS + 1),
            ..Default::default()
        };
        let request = PublishRequest {
            job_id: JobId::new(),
            title: "",
            payload: &payload,
            attempt: 1,
        };
        let connection = Connection {
            owner_id: "user-1".to_string(),
            platform: Platform::Bluesky,
            account: "herald.test".to_string(),
            // Unroutable, so a login attempt would fail differently
            endpoint: Some("http://127.0.0.1:9".to_string()),
            secret: "app-password".to_string(),
        };

        let err = BlueskyAdapter::new()
            .publish(&connection, &request, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidPayload(_)));
    }
}
