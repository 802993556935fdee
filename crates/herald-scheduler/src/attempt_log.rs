//! Append-only log of dispatch attempts.
//!
//! The log is the audit trail of what happened to each target, independent
//! of the mutable target state that retries overwrite.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::locks::KeyedLocks;
use crate::{ExternalRef, JobId, Platform};

/// Status recorded by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Started,
    Success,
    Failed,
}

/// One immutable record in the attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptLogEntry {
    pub job_id: JobId,
    pub platform: Platform,
    /// Attempt number of the target this entry belongs to.
    pub attempt: u32,
    pub status: AttemptStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AttemptLogEntry {
    pub fn started(job_id: JobId, platform: Platform, attempt: u32) -> Self {
        Self {
            job_id,
            platform,
            attempt,
            status: AttemptStatus::Started,
            message: format!("publishing to {platform} (attempt {attempt})"),
            details: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn success(job_id: JobId, platform: Platform, attempt: u32, external_ref: &ExternalRef) -> Self {
        Self {
            job_id,
            platform,
            attempt,
            status: AttemptStatus::Success,
            message: format!("published to {platform}"),
            details: serde_json::to_value(external_ref).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        job_id: JobId,
        platform: Platform,
        attempt: u32,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            job_id,
            platform,
            attempt,
            status: AttemptStatus::Failed,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }

    /// Whether this entry closes an attempt.
    pub fn is_terminal(&self) -> bool {
        self.status != AttemptStatus::Started
    }
}

/// Append-only attempt log.
#[async_trait]
pub trait AttemptLog: Send + Sync {
    /// Append an entry. This is the only mutation.
    async fn append(&self, entry: AttemptLogEntry) -> Result<(), StorageError>;

    /// All entries for a job, ordered by timestamp.
    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<AttemptLogEntry>, StorageError>;
}

/// Attempts that were started but never closed by a terminal entry.
pub fn open_attempts(entries: &[AttemptLogEntry]) -> Vec<(Platform, u32)> {
    let mut open: Vec<(Platform, u32)> = entries
        .iter()
        .filter(|e| e.status == AttemptStatus::Started)
        .map(|e| (e.platform, e.attempt))
        .collect();
    open.retain(|(platform, attempt)| {
        !entries
            .iter()
            .any(|e| e.is_terminal() && e.platform == *platform && e.attempt == *attempt)
    });
    open.sort();
    open.dedup();
    open
}

fn sort_by_timestamp(entries: &mut [AttemptLogEntry]) {
    // Stable, so entries with equal timestamps keep append order.
    entries.sort_by_key(|e| e.timestamp);
}

/// In-memory attempt log.
#[derive(Debug, Default)]
pub struct MemoryAttemptLog {
    entries: RwLock<HashMap<JobId, Vec<AttemptLogEntry>>>,
}

impl MemoryAttemptLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptLog for MemoryAttemptLog {
    async fn append(&self, entry: AttemptLogEntry) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .entry(entry.job_id)
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<AttemptLogEntry>, StorageError> {
        let mut entries = self
            .entries
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        sort_by_timestamp(&mut entries);
        Ok(entries)
    }
}

/// Per-job file locks idle for this long are dropped.
const LOCK_IDLE: Duration = Duration::from_secs(300);

/// File-backed attempt log.
///
/// Stores entries as JSONL at `{dir}/{job_id}.jsonl`.
#[derive(Clone)]
pub struct FileAttemptLog {
    dir: PathBuf,
    locks: KeyedLocks<JobId>,
}

impl FileAttemptLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.jsonl"))
    }
}

#[async_trait]
impl AttemptLog for FileAttemptLog {
    async fn append(&self, entry: AttemptLogEntry) -> Result<(), StorageError> {
        let lock = self.locks.get(&entry.job_id);
        let guard = lock.lock().await;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?;

        let path = self.log_path(entry.job_id);
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&path, e))?;
        drop(guard);

        self.locks.cleanup_stale(LOCK_IDLE);
        Ok(())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<AttemptLogEntry>, StorageError> {
        let lock = self.locks.get(&job_id);
        let _guard = lock.lock().await;

        let path = self.log_path(job_id);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AttemptLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    // A torn final line from a crash mid-append is skipped.
                    tracing::warn!(path = %path.display(), line = index + 1, error = %e, "skipping unreadable attempt log line");
                }
            }
        }
        sort_by_timestamp(&mut entries);
        Ok(entries)
    }
}
