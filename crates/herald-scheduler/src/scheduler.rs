//! Job scheduler implementation.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::state;
use crate::view::{JobView, Timeline};
use crate::{JobId, JobStatus, Payload, Platform, ScheduledJob, SchedulerError, TargetState};

/// Lock entries idle for this long are dropped at the end of a tick.
const LOCK_IDLE_SECS: u64 = 3600;

/// Upper bound for the pause after a loop-fatal tick.
const MAX_FATAL_BACKOFF_SECS: u64 = 300;

/// A post as submitted by the user.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub owner_id: String,
    pub title: String,
    pub payload: Payload,
    pub scheduled_time: DateTime<Utc>,
    pub platforms: Vec<Platform>,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Stale jobs reclaimed by the sweep.
    pub swept: usize,
    /// Jobs found due.
    pub due: usize,
    pub dispatched: usize,
    /// Dispatches that returned an error and were skipped.
    pub failed: usize,
}

/// The job scheduler.
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Validate and store a new job.
    #[tracing::instrument(skip(self, post), fields(owner_id = %post.owner_id))]
    pub async fn schedule_post(&self, post: NewPost) -> Result<ScheduledJob, SchedulerError> {
        let config = self.dispatcher.config();
        if post.owner_id.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("owner is required".to_string()));
        }
        if post.payload.text.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("post text is empty".to_string()));
        }
        if post.platforms.is_empty() {
            return Err(SchedulerError::InvalidJob(
                "at least one target platform is required".to_string(),
            ));
        }
        for (i, platform) in post.platforms.iter().enumerate() {
            if post.platforms[..i].contains(platform) {
                return Err(SchedulerError::InvalidJob(format!(
                    "duplicate target platform: {platform}"
                )));
            }
            if !config.is_enabled(*platform) {
                return Err(SchedulerError::InvalidJob(format!(
                    "platform {platform} is disabled"
                )));
            }
        }

        let job = ScheduledJob::new(
            post.owner_id,
            post.title,
            post.payload,
            post.scheduled_time,
            &post.platforms,
        );
        let job = self.dispatcher.store().insert(job).await?;
        info!(
            job_id = %job.id,
            scheduled_time = %job.scheduled_time,
            targets = job.targets.len(),
            "scheduled post"
        );
        Ok(job)
    }

    /// Cancel a job that has not started dispatching.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<ScheduledJob, SchedulerError> {
        let lock = self.dispatcher.lock_for(job_id);
        let _guard = lock.lock().await;

        let job = self
            .dispatcher
            .update_job(job_id, |job, now| {
                if job.status != JobStatus::Pending {
                    return Err(SchedulerError::CancelRefused {
                        id: job.id,
                        status: job.status,
                    });
                }
                for target in &mut job.targets {
                    state::cancel(target, now)?;
                }
                Ok(())
            })
            .await?;

        info!(%job_id, "cancelled job");
        Ok(job)
    }

    /// Make every `failed_retryable` target due immediately.
    ///
    /// Returns the number of targets rescheduled.
    #[tracing::instrument(skip(self))]
    pub async fn retry_now(&self, job_id: JobId) -> Result<usize, SchedulerError> {
        let lock = self.dispatcher.lock_for(job_id);
        let _guard = lock.lock().await;

        let mut rescheduled = 0;
        self.dispatcher
            .update_job(job_id, |job, now| {
                rescheduled = 0;
                if job.status.is_terminal() {
                    return Err(SchedulerError::JobFinalized {
                        id: job.id,
                        status: job.status,
                    });
                }
                for target in job
                    .targets
                    .iter_mut()
                    .filter(|t| t.state == TargetState::FailedRetryable)
                {
                    target.next_attempt_at = Some(now);
                    target.updated_at = now;
                    rescheduled += 1;
                }
                Ok(())
            })
            .await?;

        info!(%job_id, rescheduled, "retry requested");
        Ok(rescheduled)
    }

    /// Dispatch one job now, outside the tick.
    pub async fn dispatch_now(&self, job_id: JobId) -> Result<DispatchReport, SchedulerError> {
        self.dispatcher.dispatch(job_id).await
    }

    /// Get a job by id.
    pub async fn get_job(&self, job_id: JobId) -> Result<ScheduledJob, SchedulerError> {
        self.dispatcher
            .store()
            .get(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    pub async fn job_view(&self, job_id: JobId) -> Result<JobView, SchedulerError> {
        Ok(JobView::from(&self.get_job(job_id).await?))
    }

    pub async fn timeline(&self, job_id: JobId) -> Result<Timeline, SchedulerError> {
        // Surface unknown ids instead of an empty timeline.
        self.get_job(job_id).await?;
        let entries = self.dispatcher.attempt_log().list_for_job(job_id).await?;
        Ok(Timeline::new(job_id, entries))
    }

    /// List jobs, optionally for a single owner.
    pub async fn list_jobs(&self, owner_id: Option<&str>) -> Result<Vec<JobView>, SchedulerError> {
        let jobs = self.dispatcher.store().list_for_owner(owner_id).await?;
        Ok(jobs.iter().map(JobView::from).collect())
    }

    /// Reclaim processing jobs with no recent activity.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let processing = self
            .dispatcher
            .store()
            .list_processing()
            .await
            .map_err(|e| SchedulerError::LoopFatal(e.to_string()))?;

        let mut reclaimed = 0;
        for job in &processing {
            match self.dispatcher.reclaim_if_stale(job, now).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to reclaim stale job"),
            }
        }
        Ok(reclaimed)
    }

    /// Run one scheduler pass: sweep, then dispatch every due job.
    ///
    /// Individual dispatch failures are logged and counted; only a failure
    /// to read the job store is returned.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let now = Utc::now();
        let swept = self.sweep_stale(now).await?;

        let due = self
            .dispatcher
            .store()
            .list_due(now)
            .await
            .map_err(|e| SchedulerError::LoopFatal(e.to_string()))?;

        let mut report = TickReport {
            swept,
            due: due.len(),
            ..TickReport::default()
        };

        let permits = Arc::new(Semaphore::new(
            self.dispatcher.config().max_concurrent_jobs.max(1),
        ));
        let mut tasks = JoinSet::new();
        for job in due {
            let dispatcher = Arc::clone(&self.dispatcher);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                (job.id, dispatcher.dispatch(job.id).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((job_id, Ok(dispatch))) => {
                    report.dispatched += 1;
                    debug!(%job_id, status = %dispatch.status, "job dispatched");
                }
                Ok((job_id, Err(e))) => {
                    report.failed += 1;
                    error!(%job_id, error = %e, "dispatch failed, skipping job");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "dispatch task aborted");
                }
            }
        }

        self.dispatcher
            .locks()
            .cleanup_stale(Duration::from_secs(LOCK_IDLE_SECS));
        Ok(report)
    }

    /// Run the scheduler loop until `shutdown_rx` flips to true.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let tick_interval = self.dispatcher.config().tick_interval();
        info!(tick_secs = tick_interval.as_secs(), "scheduler starting");

        let mut backoff = ExponentialBackoff {
            initial_interval: tick_interval,
            max_interval: Duration::from_secs(MAX_FATAL_BACKOFF_SECS).max(tick_interval),
            max_elapsed_time: None, // Retry forever
            ..Default::default()
        };

        loop {
            // Check for shutdown
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            let sleep_duration = match self.tick().await {
                Ok(report) => {
                    backoff.reset();
                    if report.due > 0 || report.swept > 0 {
                        info!(
                            due = report.due,
                            dispatched = report.dispatched,
                            failed = report.failed,
                            swept = report.swept,
                            "tick finished"
                        );
                    }
                    tick_interval
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    error!(error = %e, retry_in_secs = delay.as_secs(), "scheduler tick failed");
                    delay
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                    }
                }
                _ = sleep(sleep_duration) => {}
            }
        }

        info!("scheduler shut down gracefully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchedulerConfig;
    use crate::adapter::{AdapterRegistry, MemoryConnectionRegistry};
    use crate::attempt_log::MemoryAttemptLog;
    use crate::store::MemoryJobStore;

    fn scheduler(config: SchedulerConfig) -> Scheduler {
        let dispatcher = Dispatcher::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryAttemptLog::new()),
            Arc::new(MemoryConnectionRegistry::new()),
            Arc::new(AdapterRegistry::new()),
            config,
        );
        Scheduler::new(Arc::new(dispatcher))
    }

    fn post(platforms: Vec<Platform>) -> NewPost {
        NewPost {
            owner_id: "user-1".to_string(),
            title: "Launch".to_string(),
            payload: Payload {
                text: "We shipped".to_string(),
                ..Default::default()
            },
            scheduled_time: Utc::now() + chrono::Duration::hours(1),
            platforms,
        }
    }

    #[tokio::test]
    async fn test_schedule_post_validation() {
        let mut config = SchedulerConfig::default();
        config.enabled_platforms.remove(&Platform::Linkedin);
        let scheduler = scheduler(config);

        for (platforms, expected) in [
            (vec![], "at least one target"),
            (vec![Platform::X, Platform::X], "duplicate target platform: x"),
            (vec![Platform::Linkedin], "platform linkedin is disabled"),
        ] {
            match scheduler.schedule_post(post(platforms)).await {
                Err(SchedulerError::InvalidJob(msg)) => assert!(msg.contains(expected), "{msg}"),
                other => panic!("expected InvalidJob, got {other:?}"),
            }
        }

        let mut empty = post(vec![Platform::X]);
        empty.payload.text = "   ".to_string();
        assert!(matches!(
            scheduler.schedule_post(empty).await,
            Err(SchedulerError::InvalidJob(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let scheduler = scheduler(SchedulerConfig::default());
        let job = scheduler
            .schedule_post(post(vec![Platform::Bluesky, Platform::Mastodon]))
            .await
            .unwrap();

        let cancelled = scheduler.cancel_job(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.targets.iter().all(|t| t.state == TargetState::Cancelled));

        // Terminal now, so a second cancel is refused
        assert!(matches!(
            scheduler.cancel_job(job.id).await,
            Err(SchedulerError::CancelRefused { status: JobStatus::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn test_timeline_unknown_job() {
        let scheduler = scheduler(SchedulerConfig::default());
        assert!(matches!(
            scheduler.timeline(JobId::new()).await,
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tick_with_nothing_due() {
        let scheduler = scheduler(SchedulerConfig::default());
        scheduler.schedule_post(post(vec![Platform::X])).await.unwrap();
        assert_eq!(scheduler.tick().await.unwrap(), TickReport::default());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let scheduler = scheduler(SchedulerConfig::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
