//! Read-only projections of jobs and their attempt history.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::attempt_log::{AttemptLogEntry, AttemptStatus};
use crate::{
    ExternalRef, JobId, JobStatus, Platform, ScheduledJob, TargetAttemptState, TargetState,
};

/// One target as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetView {
    pub platform: Platform,
    pub state: TargetState,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
    /// Human-readable reason for the last failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl From<&TargetAttemptState> for TargetView {
    fn from(target: &TargetAttemptState) -> Self {
        Self {
            platform: target.platform,
            state: target.state,
            attempt_count: target.attempt_count,
            next_attempt_at: target.next_attempt_at,
            external_ref: target.external_ref.clone(),
            // A succeeded target may carry an earlier attempt's error.
            failure_reason: match target.state {
                TargetState::Succeeded => None,
                _ => target.last_error.as_ref().map(ToString::to_string),
            },
        }
    }
}

/// Job status with a per-target breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub owner_id: String,
    pub title: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: JobStatus,
    /// Completed, but not on every platform.
    pub partial: bool,
    pub targets: Vec<TargetView>,
}

impl JobView {
    pub fn failed_targets(&self) -> impl Iterator<Item = &TargetView> {
        self.targets
            .iter()
            .filter(|t| t.state == TargetState::FailedPermanent)
    }
}

impl From<&ScheduledJob> for JobView {
    fn from(job: &ScheduledJob) -> Self {
        let partial = job.status == JobStatus::Completed
            && job.targets.iter().any(|t| t.state != TargetState::Succeeded);
        Self {
            id: job.id,
            owner_id: job.owner_id.clone(),
            title: job.title.clone(),
            scheduled_time: job.scheduled_time,
            status: job.status,
            partial,
            targets: job.targets.iter().map(TargetView::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimelineCounts {
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Ordered attempt history of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    pub job_id: JobId,
    pub entries: Vec<AttemptLogEntry>,
    pub counts: TimelineCounts,
}

impl Timeline {
    pub fn new(job_id: JobId, mut entries: Vec<AttemptLogEntry>) -> Self {
        entries.sort_by_key(|e| e.timestamp);
        let mut counts = TimelineCounts::default();
        for entry in &entries {
            match entry.status {
                AttemptStatus::Started => counts.started += 1,
                AttemptStatus::Success => counts.succeeded += 1,
                AttemptStatus::Failed => counts.failed += 1,
            }
        }
        Self {
            job_id,
            entries,
            counts,
        }
    }

    /// Entries for a single platform.
    pub fn for_platform(&self, platform: Platform) -> impl Iterator<Item = &AttemptLogEntry> {
        self.entries.iter().filter(move |e| e.platform == platform)
    }
}
