//! Scheduled multi-platform publishing for Herald.
//!
//! This crate provides the publishing pipeline core:
//! - Durable jobs with one independently tracked target per platform
//! - Concurrent dispatch to platform adapters under a bounded timeout
//! - Exponential backoff for transient failures, never re-sending a
//!   target that already succeeded
//! - An append-only attempt log for auditing every dispatch
//! - A polling scheduler loop with a staleness sweep for crashed attempts

pub mod adapter;
pub mod attempt_log;
mod config;
mod dispatcher;
mod error;
mod locks;
mod scheduler;
pub mod state;
pub mod store;
mod types;
pub mod view;

pub use adapter::{
    AdapterError, AdapterRegistry, AllowAll, Connection, ConnectionError, ConnectionRegistry,
    MemoryConnectionRegistry, PlatformAdapter, PublishGuard, PublishRequest,
};
pub use attempt_log::{AttemptLog, AttemptLogEntry, AttemptStatus, FileAttemptLog, MemoryAttemptLog};
pub use config::{RetryPolicy, SchedulerConfig};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::{SchedulerError, StorageError};
pub use locks::KeyedLocks;
pub use scheduler::{NewPost, Scheduler, TickReport};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
pub use types::{
    ExternalRef, FailureKind, JobId, JobStatus, MediaRef, Payload, Platform, ScheduledJob,
    TargetAttemptState, TargetError, TargetState, UnknownPlatform,
};
pub use view::{JobView, TargetView, Timeline, TimelineCounts};
