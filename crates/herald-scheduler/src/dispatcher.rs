//! Fan-out of one job to its platform adapters.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapter::{
    AdapterError, AdapterRegistry, AllowAll, ConnectionRegistry, PublishGuard, PublishRequest,
};
use crate::attempt_log::{AttemptLog, AttemptLogEntry, AttemptStatus, open_attempts};
use crate::locks::KeyedLocks;
use crate::state::{self, AttemptFailure, AttemptOutcome};
use crate::store::JobStore;
use crate::{
    ExternalRef, FailureKind, JobId, JobStatus, Platform, ScheduledJob, SchedulerConfig,
    SchedulerError, TargetAttemptState, TargetState,
};

/// Per-target states after a dispatch.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Platforms attempted by this invocation.
    pub attempted: Vec<Platform>,
    pub targets: Vec<TargetAttemptState>,
}

impl DispatchReport {
    fn new(job: &ScheduledJob, attempted: Vec<Platform>) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            attempted,
            targets: job.targets.clone(),
        }
    }
}

/// A claimed attempt: platform and its 1-based attempt number.
type Claim = (Platform, u32);

/// Publishes due targets of a job and folds the outcomes into its state.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    log: Arc<dyn AttemptLog>,
    connections: Arc<dyn ConnectionRegistry>,
    adapters: Arc<AdapterRegistry>,
    guard: Arc<dyn PublishGuard>,
    locks: KeyedLocks<JobId>,
    config: SchedulerConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        log: Arc<dyn AttemptLog>,
        connections: Arc<dyn ConnectionRegistry>,
        adapters: Arc<AdapterRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            log,
            connections,
            adapters,
            guard: Arc::new(AllowAll),
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// Replace the pre-dispatch guard.
    pub fn with_guard(mut self, guard: Arc<dyn PublishGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn attempt_log(&self) -> &Arc<dyn AttemptLog> {
        &self.log
    }

    pub(crate) fn locks(&self) -> &KeyedLocks<JobId> {
        &self.locks
    }

    pub(crate) fn lock_for(&self, job_id: JobId) -> Arc<Mutex<()>> {
        self.locks.get(&job_id)
    }

    /// Dispatch every eligible target of a job.
    ///
    /// Adapter failures are folded into target state; only store errors
    /// are returned.
    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    pub async fn dispatch(&self, job_id: JobId) -> Result<DispatchReport, SchedulerError> {
        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;

        // Claim eligible targets and persist them as processing before any
        // adapter is called.
        let mut claims: Vec<Claim> = Vec::new();
        let mut first_dispatch = false;
        let job = self
            .update_job(job_id, |job, now| {
                claims.clear();
                first_dispatch = job.status == JobStatus::Pending;
                if !job.is_due(now) {
                    return Ok(());
                }
                for target in job.targets.iter_mut().filter(|t| t.is_eligible(now)) {
                    let attempt = state::begin_attempt(target, now)?;
                    claims.push((target.platform, attempt));
                }
                Ok(())
            })
            .await?;

        if claims.is_empty() {
            debug!(status = %job.status, "nothing to dispatch");
            return Ok(DispatchReport::new(&job, Vec::new()));
        }

        let refusal = if first_dispatch {
            self.guard.admit(&job).await.err()
        } else {
            None
        };

        let outcomes: Vec<(Claim, AttemptOutcome)> = match refusal {
            Some(reason) => {
                warn!(reason = %reason, "publish guard refused job");
                self.refuse(&job, &claims, &reason).await
            }
            None => {
                let attempts = claims
                    .iter()
                    .map(|&(platform, attempt)| self.attempt(&job, platform, attempt));
                claims.iter().copied().zip(join_all(attempts).await).collect()
            }
        };

        let policy = &self.config.retry;
        let job = self
            .update_job(job_id, |job, now| {
                for ((platform, attempt), outcome) in &outcomes {
                    let Some(target) = job.target_mut(*platform) else {
                        continue;
                    };
                    // The sweep may have reclaimed this attempt in the meantime.
                    if target.state != TargetState::Processing || target.attempt_count != *attempt {
                        warn!(%platform, attempt, state = %target.state, "discarding outcome of reclaimed attempt");
                        continue;
                    }
                    state::apply_outcome(target, outcome, policy, now)?;
                }
                Ok(())
            })
            .await?;

        info!(
            status = %job.status,
            attempted = claims.len(),
            next_attempt_at = ?job.next_attempt_at(),
            "dispatch finished"
        );
        let attempted = claims.into_iter().map(|(platform, _)| platform).collect();
        Ok(DispatchReport::new(&job, attempted))
    }

    /// Run one attempt, logging `started` and exactly one terminal entry.
    async fn attempt(&self, job: &ScheduledJob, platform: Platform, attempt: u32) -> AttemptOutcome {
        self.record(AttemptLogEntry::started(job.id, platform, attempt))
            .await;

        let outcome = self.publish(job, platform, attempt).await;

        let entry = match &outcome {
            AttemptOutcome::Published(external_ref) => {
                info!(%platform, attempt, external_id = %external_ref.id, "published");
                AttemptLogEntry::success(job.id, platform, attempt, external_ref)
            }
            AttemptOutcome::Failed(failure) => {
                warn!(%platform, attempt, kind = ?failure.kind, error = %failure.message, "publish failed");
                failure_entry(job.id, platform, attempt, failure)
            }
        };
        self.record(entry).await;
        outcome
    }

    async fn publish(&self, job: &ScheduledJob, platform: Platform, attempt: u32) -> AttemptOutcome {
        let connection = match self.connections.resolve(&job.owner_id, platform).await {
            Ok(connection) => connection,
            Err(e) => {
                return AttemptOutcome::Failed(AttemptFailure::new(
                    FailureKind::ConnectionMissing,
                    e.to_string(),
                ));
            }
        };

        let Some(adapter) = self.adapters.get(platform) else {
            return AttemptOutcome::Failed(AttemptFailure::new(
                FailureKind::UnsupportedPlatform,
                format!("no adapter registered for {platform}"),
            ));
        };

        let request = PublishRequest {
            job_id: job.id,
            title: &job.title,
            payload: &job.payload,
            attempt,
        };
        let timeout = self.config.adapter_timeout();
        let call = AssertUnwindSafe(adapter.publish(&connection, &request, timeout)).catch_unwind();

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(external_ref))) => AttemptOutcome::Published(external_ref),
            Ok(Ok(Err(e))) => e.into(),
            Ok(Err(_)) => AttemptOutcome::Failed(AttemptFailure::new(
                FailureKind::AdapterTransient,
                "adapter panicked",
            )),
            Err(_) => AdapterError::Timeout(timeout).into(),
        }
    }

    /// Fail every claimed target permanently after a guard refusal.
    async fn refuse(
        &self,
        job: &ScheduledJob,
        claims: &[Claim],
        reason: &str,
    ) -> Vec<(Claim, AttemptOutcome)> {
        let mut outcomes = Vec::with_capacity(claims.len());
        for &(platform, attempt) in claims {
            let failure = AttemptFailure::new(FailureKind::AdapterPermanent, reason)
                .with_details(json!({ "refused_by": "publish_guard" }));
            self.record(AttemptLogEntry::started(job.id, platform, attempt))
                .await;
            self.record(failure_entry(job.id, platform, attempt, &failure))
                .await;
            outcomes.push(((platform, attempt), AttemptOutcome::Failed(failure)));
        }
        outcomes
    }

    /// Reclaim a processing job nobody has touched within the staleness window.
    ///
    /// Returns `Ok(false)` when the job is locked here, fresh, or no longer
    /// processing.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn reclaim_if_stale(
        &self,
        job: &ScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let lock = self.lock_for(job.id);
        let Ok(_guard) = lock.try_lock() else {
            debug!("job is in flight, skipping staleness check");
            return Ok(false);
        };

        let entries = self.log.list_for_job(job.id).await?;
        let last_log = entries.iter().map(|e| e.timestamp).max();
        let last_activity = last_log.map_or(job.updated_at, |at| at.max(job.updated_at));
        if now - last_activity < self.config.staleness_window() {
            return Ok(false);
        }

        let policy = &self.config.retry;
        let mut reclaimed: Vec<Claim> = Vec::new();
        let mut recovered: Vec<Claim> = Vec::new();
        let updated = self
            .update_job(job.id, |job, now| {
                reclaimed.clear();
                recovered.clear();
                for target in job
                    .targets
                    .iter_mut()
                    .filter(|t| t.state == TargetState::Processing)
                {
                    let claim = (target.platform, target.attempt_count);
                    // An outcome that was logged but never saved is applied
                    // as is, so a published target is not sent again.
                    match logged_outcome(&entries, claim.0, claim.1) {
                        Some(outcome) => {
                            recovered.push(claim);
                            state::apply_outcome(target, &outcome, policy, now)?;
                        }
                        None => {
                            reclaimed.push(claim);
                            state::reclaim_abandoned(target, policy, now)?;
                        }
                    }
                }
                Ok(())
            })
            .await?;

        if reclaimed.is_empty() && recovered.is_empty() {
            return Ok(false);
        }

        // Close the dangling `started` entries of the reclaimed attempts.
        for (platform, attempt) in open_attempts(&entries) {
            if !reclaimed.contains(&(platform, attempt)) {
                continue;
            }
            let Some(target) = updated.target(platform) else {
                continue;
            };
            let message = target
                .last_error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            self.record(AttemptLogEntry::failed(
                job.id,
                platform,
                attempt,
                message,
                json!({ "kind": FailureKind::Abandoned }),
            ))
            .await;
        }

        warn!(
            abandoned = reclaimed.len(),
            recovered = recovered.len(),
            status = %updated.status,
            "reclaimed stale job"
        );
        Ok(true)
    }

    /// Read-modify-write a job with optimistic concurrency.
    ///
    /// `apply` is re-run on a fresh copy after each store conflict, up to
    /// `store_conflict_retries` times. Unchanged jobs are not saved.
    pub(crate) async fn update_job<F>(
        &self,
        job_id: JobId,
        mut apply: F,
    ) -> Result<ScheduledJob, SchedulerError>
    where
        F: FnMut(&mut ScheduledJob, DateTime<Utc>) -> Result<(), SchedulerError> + Send,
    {
        let mut conflicts = 0;
        loop {
            let current = self
                .store
                .get(job_id)
                .await?
                .ok_or(SchedulerError::JobNotFound(job_id))?;

            let now = Utc::now();
            let mut job = current.clone();
            apply(&mut job, now)?;
            job.refresh_status();
            if job == current {
                return Ok(current);
            }
            job.updated_at = now;

            match self.store.save(&job).await {
                Ok(saved) => return Ok(saved),
                Err(SchedulerError::StoreConflict { found, .. })
                    if conflicts < self.config.store_conflict_retries =>
                {
                    conflicts += 1;
                    debug!(%job_id, found, conflicts, "store conflict, re-reading job");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record(&self, entry: AttemptLogEntry) {
        let (platform, attempt, status) = (entry.platform, entry.attempt, entry.status);
        if let Err(e) = self.log.append(entry).await {
            warn!(%platform, attempt, ?status, error = %e, "failed to append attempt log entry");
        }
    }
}

/// Outcome of an attempt as recorded by its terminal log entry, if any.
fn logged_outcome(
    entries: &[AttemptLogEntry],
    platform: Platform,
    attempt: u32,
) -> Option<AttemptOutcome> {
    let entry = entries
        .iter()
        .rev()
        .find(|e| e.is_terminal() && e.platform == platform && e.attempt == attempt)?;

    match entry.status {
        AttemptStatus::Success => {
            match serde_json::from_value::<ExternalRef>(entry.details.clone()) {
                Ok(external_ref) => Some(AttemptOutcome::Published(external_ref)),
                Err(e) => {
                    warn!(%platform, attempt, error = %e, "unreadable external ref in success entry");
                    None
                }
            }
        }
        AttemptStatus::Failed => {
            let kind = entry
                .details
                .get("kind")
                .cloned()
                .and_then(|kind| serde_json::from_value::<FailureKind>(kind).ok())?;
            Some(AttemptOutcome::Failed(
                AttemptFailure::new(kind, entry.message.clone()).with_details(entry.details.clone()),
            ))
        }
        AttemptStatus::Started => None,
    }
}

fn failure_entry(
    job_id: JobId,
    platform: Platform,
    attempt: u32,
    failure: &AttemptFailure,
) -> AttemptLogEntry {
    let mut details = match &failure.details {
        Value::Object(map) => Value::Object(map.clone()),
        Value::Null => json!({}),
        other => json!({ "raw": other }),
    };
    details["kind"] = json!(failure.kind);
    AttemptLogEntry::failed(job_id, platform, attempt, failure.message.clone(), details)
}
