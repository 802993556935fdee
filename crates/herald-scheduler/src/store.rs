//! Durable job storage with optimistic concurrency.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::StorageError;
use crate::{JobId, JobStatus, ScheduledJob, SchedulerError};

/// Storage for scheduled jobs and their embedded targets.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job.
    async fn insert(&self, job: ScheduledJob) -> Result<ScheduledJob, SchedulerError>;

    async fn get(&self, id: JobId) -> Result<Option<ScheduledJob>, SchedulerError>;

    /// Persist `job` if its version matches the stored one.
    ///
    /// Returns the stored copy with the bumped version, or
    /// [`SchedulerError::StoreConflict`] if someone else saved first.
    async fn save(&self, job: &ScheduledJob) -> Result<ScheduledJob, SchedulerError>;

    /// Jobs with work to dispatch at `now`, oldest schedule first.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError>;

    /// Jobs whose aggregate status is `processing`.
    async fn list_processing(&self) -> Result<Vec<ScheduledJob>, SchedulerError>;

    /// Jobs of one owner (or all jobs), ordered by scheduled time.
    async fn list_for_owner(&self, owner_id: Option<&str>)
    -> Result<Vec<ScheduledJob>, SchedulerError>;
}

/// Validate an optimistic save against the currently stored copy.
fn next_version(current: &ScheduledJob, job: &ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
    if current.version != job.version {
        return Err(SchedulerError::StoreConflict {
            id: job.id,
            expected: job.version,
            found: current.version,
        });
    }
    if current.status.is_terminal() {
        return Err(SchedulerError::JobFinalized {
            id: job.id,
            status: current.status,
        });
    }
    let mut saved = job.clone();
    saved.version += 1;
    Ok(saved)
}

fn select(
    jobs: impl IntoIterator<Item = ScheduledJob>,
    filter: impl Fn(&ScheduledJob) -> bool,
) -> Vec<ScheduledJob> {
    let mut selected: Vec<ScheduledJob> = jobs.into_iter().filter(|j| filter(j)).collect();
    selected.sort_by(|a, b| {
        a.scheduled_time
            .cmp(&b.scheduled_time)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    selected
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, ScheduledJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(SchedulerError::JobExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn save(&self, job: &ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(&job.id)
            .ok_or(SchedulerError::JobNotFound(job.id))?;
        let saved = next_version(current, job)?;
        jobs.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let jobs = self.jobs.read().await;
        Ok(select(jobs.values().cloned(), |j| j.is_due(now)))
    }

    async fn list_processing(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let jobs = self.jobs.read().await;
        Ok(select(jobs.values().cloned(), |j| {
            j.status == JobStatus::Processing
        }))
    }

    async fn list_for_owner(
        &self,
        owner_id: Option<&str>,
    ) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let jobs = self.jobs.read().await;
        Ok(select(jobs.values().cloned(), |j| {
            owner_id.is_none_or(|owner| j.owner_id == owner)
        }))
    }
}

/// File-backed job store.
///
/// Each job is one JSON document at `{dir}/{job_id}.json`, rewritten
/// atomically on save. Reads always go to disk so separate processes (the
/// daemon and the CLI) see each other's writes.
///
/// Every read-check-write cycle holds an exclusive advisory lock on
/// `{dir}/{job_id}.lock`, so version checks stay atomic across processes
/// sharing the directory.
pub struct FileJobStore {
    dir: PathBuf,
    /// Serializes cycles within this process before taking the file lock.
    write_lock: Mutex<()>,
}

/// Held advisory lock on one job's lock file. Closing the file releases it.
struct JobFileLock {
    _file: std::fs::File,
}

impl FileJobStore {
    /// Open (and create if needed) a job directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn job_path(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    /// Block (off the runtime) until this job's lock file is ours.
    async fn lock_job(&self, id: JobId) -> Result<JobFileLock, StorageError> {
        let path = self.lock_path(id);
        let lock_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .map_err(|e| StorageError::io(&lock_path, e))?;
            FileExt::lock_exclusive(&file).map_err(|e| StorageError::io(&lock_path, e))?;
            Ok(JobFileLock { _file: file })
        })
        .await
        .map_err(|e| StorageError::Lock {
            path,
            message: e.to_string(),
        })?
    }

    async fn read_job(&self, path: &Path) -> Result<Option<ScheduledJob>, StorageError> {
        let content = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StorageError::deserialization(path, e.to_string()))
    }

    async fn write_job(&self, job: &ScheduledJob) -> Result<(), StorageError> {
        let path = self.job_path(job.id);
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(job)?;

        fs::write(&temp_path, content)
            .await
            .map_err(|e| StorageError::io(&temp_path, e))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ScheduledJob>, StorageError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?;

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_job(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn insert(&self, job: ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = self.lock_job(job.id).await?;
        if self.read_job(&self.job_path(job.id)).await?.is_some() {
            return Err(SchedulerError::JobExists(job.id));
        }
        self.write_job(&job).await?;
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.read_job(&self.job_path(id)).await?)
    }

    async fn save(&self, job: &ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = self.lock_job(job.id).await?;
        let current = self
            .read_job(&self.job_path(job.id))
            .await?
            .ok_or(SchedulerError::JobNotFound(job.id))?;
        let saved = next_version(&current, job)?;
        self.write_job(&saved).await?;
        Ok(saved)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
        Ok(select(self.load_all().await?, |j| j.is_due(now)))
    }

    async fn list_processing(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        Ok(select(self.load_all().await?, |j| {
            j.status == JobStatus::Processing
        }))
    }

    async fn list_for_owner(
        &self,
        owner_id: Option<&str>,
    ) -> Result<Vec<ScheduledJob>, SchedulerError> {
        Ok(select(self.load_all().await?, |j| {
            owner_id.is_none_or(|owner| j.owner_id == owner)
        }))
    }
}
