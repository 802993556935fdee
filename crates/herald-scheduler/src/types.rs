//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state;

/// Unique identifier of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A publishing destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Self-hosted WordPress site.
    Wordpress,
    Bluesky,
    Mastodon,
    Linkedin,
    X,
}

impl Platform {
    /// Every platform a job can target.
    pub const ALL: [Platform; 5] = [
        Platform::Wordpress,
        Platform::Bluesky,
        Platform::Mastodon,
        Platform::Linkedin,
        Platform::X,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Wordpress => "wordpress",
            Platform::Bluesky => "bluesky",
            Platform::Mastodon => "mastodon",
            Platform::Linkedin => "linkedin",
            Platform::X => "x",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unrecognised platform name.
#[derive(Debug, Error)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

/// Media attached to a post, referenced by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub mime_type: String,
    /// Alt text.
    #[serde(default)]
    pub alt: String,
}

/// Content rendered to each platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Body text.
    pub text: String,
    /// Canonical link to the original article, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Aggregate status of a job over all of its targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No target has been dispatched yet.
    #[default]
    Pending,
    /// At least one target is in flight or waiting for a retry.
    Processing,
    /// Every target finished and at least one published.
    Completed,
    /// Every target failed permanently.
    Failed,
    /// Cancelled before dispatch.
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one (job, platform) target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    #[default]
    Pending,
    Processing,
    Succeeded,
    FailedRetryable,
    FailedPermanent,
    /// Only set together with the job's cancellation.
    Cancelled,
}

impl TargetState {
    pub const ALL: [TargetState; 6] = [
        TargetState::Pending,
        TargetState::Processing,
        TargetState::Succeeded,
        TargetState::FailedRetryable,
        TargetState::FailedPermanent,
        TargetState::Cancelled,
    ];

    /// No further attempts are made from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TargetState::Succeeded | TargetState::FailedPermanent | TargetState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Pending => "pending",
            TargetState::Processing => "processing",
            TargetState::Succeeded => "succeeded",
            TargetState::FailedRetryable => "failed_retryable",
            TargetState::FailedPermanent => "failed_permanent",
            TargetState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a published item, as returned by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRef {
    /// Platform-side identifier (post id, AT URI, ...).
    pub id: String,
    /// Public URL for the "view published" link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ExternalRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The owner has no usable connection for the platform.
    ConnectionMissing,
    /// Timeout, rate limit, 5xx or network failure.
    AdapterTransient,
    /// Auth, validation or content rejection.
    AdapterPermanent,
    /// No adapter is registered for the platform.
    UnsupportedPlatform,
    /// The attempt was reclaimed by the staleness sweep.
    Abandoned,
}

impl FailureKind {
    /// Whether a failure of this kind may be retried while attempts remain.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::AdapterTransient | FailureKind::Abandoned)
    }

    fn describe(&self) -> &'static str {
        match self {
            FailureKind::ConnectionMissing => "account not connected",
            FailureKind::AdapterTransient => "temporary platform error",
            FailureKind::AdapterPermanent => "rejected by platform",
            FailureKind::UnsupportedPlatform => "platform not supported",
            FailureKind::Abandoned => "attempt abandoned",
        }
    }
}

/// Last classified error of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetError {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.describe(), self.message)
    }
}

/// Per-platform attempt state embedded in a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAttemptState {
    pub platform: Platform,
    pub state: TargetState,
    /// Number of attempts started so far.
    pub attempt_count: u32,
    /// When a `failed_retryable` target becomes due again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TargetError>,
    /// Set iff `state == Succeeded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
    pub updated_at: DateTime<Utc>,
}

impl TargetAttemptState {
    pub fn new(platform: Platform, now: DateTime<Utc>) -> Self {
        Self {
            platform,
            state: TargetState::Pending,
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
            external_ref: None,
            updated_at: now,
        }
    }

    /// Whether the dispatcher may start an attempt for this target now.
    ///
    /// Pending targets additionally depend on the job's scheduled time,
    /// which is checked by [`ScheduledJob::is_due`].
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            TargetState::Pending => true,
            TargetState::FailedRetryable => self.next_attempt_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }
}

/// A post scheduled for publication on one or more platforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub owner_id: String,
    pub title: String,
    pub payload: Payload,
    pub scheduled_time: DateTime<Utc>,
    /// Aggregate over `targets`, never set directly.
    pub status: JobStatus,
    pub targets: Vec<TargetAttemptState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped by every successful save.
    #[serde(default)]
    pub version: u64,
}

impl ScheduledJob {
    /// Create a new pending job targeting `platforms` (duplicates are dropped).
    pub fn new(
        owner_id: impl Into<String>,
        title: impl Into<String>,
        payload: Payload,
        scheduled_time: DateTime<Utc>,
        platforms: &[Platform],
    ) -> Self {
        let now = Utc::now();
        let mut targets: Vec<TargetAttemptState> = Vec::with_capacity(platforms.len());
        for platform in platforms {
            if !targets.iter().any(|t| t.platform == *platform) {
                targets.push(TargetAttemptState::new(*platform, now));
            }
        }

        let mut job = Self {
            id: JobId::new(),
            owner_id: owner_id.into(),
            title: title.into(),
            payload,
            scheduled_time,
            status: JobStatus::Pending,
            targets,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        job.refresh_status();
        job
    }

    /// Check if this job has work to dispatch at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.scheduled_time <= now,
            JobStatus::Processing => self
                .targets
                .iter()
                .any(|t| t.state == TargetState::FailedRetryable && t.is_eligible(now)),
            _ => false,
        }
    }

    pub fn target(&self, platform: Platform) -> Option<&TargetAttemptState> {
        self.targets.iter().find(|t| t.platform == platform)
    }

    pub fn target_mut(&mut self, platform: Platform) -> Option<&mut TargetAttemptState> {
        self.targets.iter_mut().find(|t| t.platform == platform)
    }

    pub fn platforms(&self) -> impl Iterator<Item = Platform> + '_ {
        self.targets.iter().map(|t| t.platform)
    }

    /// Recompute the aggregate status from the target states.
    pub fn refresh_status(&mut self) {
        let states: Vec<TargetState> = self.targets.iter().map(|t| t.state).collect();
        self.status = state::aggregate_status(&states);
    }

    /// Earliest retry time among waiting targets.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.targets
            .iter()
            .filter(|t| t.state == TargetState::FailedRetryable)
            .filter_map(|t| t.next_attempt_at)
            .min()
    }
}
