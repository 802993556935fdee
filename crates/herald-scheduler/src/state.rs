//! Per-target state machine and aggregate job status.
//!
//! Transitions:
//!
//! ```text
//! pending ──► processing ──► succeeded
//!    │            │   ▲
//!    │            │   └──────── failed_retryable (when due)
//!    │            ├──► failed_retryable (transient, attempts left)
//!    │            └──► failed_permanent (fatal, or attempts exhausted)
//!    └──► cancelled (job cancelled before dispatch)
//! ```
//!
//! No transition returns to `pending` and nothing leaves `succeeded`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::{
    ExternalRef, FailureKind, JobStatus, RetryPolicy, TargetAttemptState, TargetError, TargetState,
};

/// A transition the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot move target from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TargetState,
    pub to: TargetState,
}

/// Classified failure of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Platform hint for how long to wait before retrying.
    pub retry_after: Option<Duration>,
    /// Raw adapter error or response, kept for the attempt log.
    pub details: Value,
}

impl AttemptFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Result of one adapter call, as folded into target state.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Published(ExternalRef),
    Failed(AttemptFailure),
}

/// Aggregate job status as a pure function of target states.
pub fn aggregate_status(states: &[TargetState]) -> JobStatus {
    if states.iter().all(|s| *s == TargetState::Pending) {
        return JobStatus::Pending;
    }
    if states.iter().all(|s| *s == TargetState::Cancelled) {
        return JobStatus::Cancelled;
    }
    if states.iter().all(TargetState::is_terminal) {
        // Partial success still counts as completed; the failures are
        // reported per target.
        return if states.contains(&TargetState::Succeeded) {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
    }
    JobStatus::Processing
}

/// Start a new attempt: `pending | failed_retryable -> processing`.
///
/// Returns the 1-based attempt number.
pub fn begin_attempt(
    target: &mut TargetAttemptState,
    now: DateTime<Utc>,
) -> Result<u32, InvalidTransition> {
    match target.state {
        TargetState::Pending | TargetState::FailedRetryable => {
            target.state = TargetState::Processing;
            target.attempt_count += 1;
            target.next_attempt_at = None;
            target.updated_at = now;
            Ok(target.attempt_count)
        }
        from => Err(InvalidTransition {
            from,
            to: TargetState::Processing,
        }),
    }
}

/// Fold an attempt outcome into a processing target.
pub fn apply_outcome(
    target: &mut TargetAttemptState,
    outcome: &AttemptOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<(), InvalidTransition> {
    if target.state != TargetState::Processing {
        return Err(InvalidTransition {
            from: target.state,
            to: match outcome {
                AttemptOutcome::Published(_) => TargetState::Succeeded,
                AttemptOutcome::Failed(_) => TargetState::FailedPermanent,
            },
        });
    }

    target.updated_at = now;
    match outcome {
        AttemptOutcome::Published(external_ref) => {
            target.state = TargetState::Succeeded;
            target.external_ref = Some(external_ref.clone());
            target.next_attempt_at = None;
            target.last_error = None;
        }
        AttemptOutcome::Failed(failure) => {
            let retry = failure.kind.is_retryable() && policy.has_attempts_left(target.attempt_count);
            let message = if failure.kind.is_retryable() && !retry {
                format!(
                    "{} (gave up after {} attempts)",
                    failure.message, target.attempt_count
                )
            } else {
                failure.message.clone()
            };

            target.last_error = Some(TargetError {
                kind: failure.kind,
                message,
            });
            if retry {
                target.state = TargetState::FailedRetryable;
                target.next_attempt_at =
                    Some(now + policy.delay_for(target.attempt_count, failure.retry_after));
            } else {
                target.state = TargetState::FailedPermanent;
                target.next_attempt_at = None;
            }
        }
    }
    Ok(())
}

/// Reclaim a target whose attempt was abandoned mid-flight.
pub fn reclaim_abandoned(
    target: &mut TargetAttemptState,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<(), InvalidTransition> {
    let failure = AttemptFailure::new(
        FailureKind::Abandoned,
        "no activity within the staleness window",
    );
    apply_outcome(target, &AttemptOutcome::Failed(failure), policy, now)
}

/// Cancel a target that has not been dispatched yet.
pub fn cancel(target: &mut TargetAttemptState, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
    if target.state != TargetState::Pending {
        return Err(InvalidTransition {
            from: target.state,
            to: TargetState::Cancelled,
        });
    }
    target.state = TargetState::Cancelled;
    target.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Platform;
    use proptest::prelude::*;

    fn target() -> TargetAttemptState {
        TargetAttemptState::new(Platform::Mastodon, Utc::now())
    }

    fn transient() -> AttemptOutcome {
        AttemptOutcome::Failed(AttemptFailure::new(
            FailureKind::AdapterTransient,
            "timed out after 30s",
        ))
    }

    fn permanent() -> AttemptOutcome {
        AttemptOutcome::Failed(AttemptFailure::new(
            FailureKind::AdapterPermanent,
            "authentication failed: 401",
        ))
    }

    // === Unit Tests ===

    #[test]
    fn test_begin_attempt_counts() {
        let mut t = target();
        assert_eq!(begin_attempt(&mut t, Utc::now()).unwrap(), 1);
        assert_eq!(t.state, TargetState::Processing);
        assert!(begin_attempt(&mut t, Utc::now()).is_err());
    }

    #[test]
    fn test_success_sets_external_ref() {
        let mut t = target();
        let now = Utc::now();
        begin_attempt(&mut t, now).unwrap();
        let published = AttemptOutcome::Published(ExternalRef::new("abc123"));
        apply_outcome(&mut t, &published, &RetryPolicy::default(), now).unwrap();

        assert_eq!(t.state, TargetState::Succeeded);
        assert_eq!(t.external_ref.as_ref().unwrap().id, "abc123");
        assert!(t.last_error.is_none());
        assert!(t.next_attempt_at.is_none());
    }

    #[test]
    fn test_succeeded_never_changes() {
        let mut t = target();
        let now = Utc::now();
        begin_attempt(&mut t, now).unwrap();
        let published = AttemptOutcome::Published(ExternalRef::new("abc123"));
        apply_outcome(&mut t, &published, &RetryPolicy::default(), now).unwrap();

        assert!(begin_attempt(&mut t, now).is_err());
        assert!(apply_outcome(&mut t, &permanent(), &RetryPolicy::default(), now).is_err());
        assert!(cancel(&mut t, now).is_err());
        assert_eq!(t.external_ref.as_ref().unwrap().id, "abc123");
    }

    #[test]
    fn test_transient_failure_schedules_retry() {
        let mut t = target();
        let now = Utc::now();
        begin_attempt(&mut t, now).unwrap();
        apply_outcome(&mut t, &transient(), &RetryPolicy::default(), now).unwrap();

        assert_eq!(t.state, TargetState::FailedRetryable);
        assert_eq!(t.attempt_count, 1);
        assert_eq!(t.next_attempt_at, Some(now + chrono::Duration::seconds(60)));
        assert_eq!(t.last_error.as_ref().unwrap().kind, FailureKind::AdapterTransient);
    }

    #[test]
    fn test_permanent_failure_is_terminal() {
        let mut t = target();
        let now = Utc::now();
        begin_attempt(&mut t, now).unwrap();
        apply_outcome(&mut t, &permanent(), &RetryPolicy::default(), now).unwrap();

        assert_eq!(t.state, TargetState::FailedPermanent);
        assert!(t.next_attempt_at.is_none());
        assert!(begin_attempt(&mut t, now).is_err());
    }

    #[test]
    fn test_exhaustion_converts_transient_to_permanent() {
        let policy = RetryPolicy::default();
        let mut t = target();
        let now = Utc::now();
        for _ in 0..policy.max_attempts {
            begin_attempt(&mut t, now).unwrap();
            apply_outcome(&mut t, &transient(), &policy, now).unwrap();
        }

        assert_eq!(t.state, TargetState::FailedPermanent);
        assert_eq!(t.attempt_count, policy.max_attempts);
        assert!(t.next_attempt_at.is_none());
        assert!(t.last_error.as_ref().unwrap().message.contains("gave up after 5"));
    }

    #[test]
    fn test_rate_limit_hint_respected() {
        let mut t = target();
        let now = Utc::now();
        begin_attempt(&mut t, now).unwrap();
        let outcome = AttemptOutcome::Failed(
            AttemptFailure::new(FailureKind::AdapterTransient, "rate limited")
                .with_retry_after(Some(Duration::from_secs(600))),
        );
        apply_outcome(&mut t, &outcome, &RetryPolicy::default(), now).unwrap();
        assert_eq!(t.next_attempt_at, Some(now + chrono::Duration::seconds(600)));
    }

    #[test]
    fn test_reclaim_abandoned() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        let mut t = target();
        begin_attempt(&mut t, now).unwrap();
        reclaim_abandoned(&mut t, &policy, now).unwrap();
        assert_eq!(t.state, TargetState::FailedRetryable);
        assert_eq!(t.last_error.as_ref().unwrap().kind, FailureKind::Abandoned);

        let mut t = target();
        t.attempt_count = policy.max_attempts - 1;
        begin_attempt(&mut t, now).unwrap();
        reclaim_abandoned(&mut t, &policy, now).unwrap();
        assert_eq!(t.state, TargetState::FailedPermanent);
    }

    #[test]
    fn test_cancel_only_from_pending() {
        let now = Utc::now();
        let mut t = target();
        cancel(&mut t, now).unwrap();
        assert_eq!(t.state, TargetState::Cancelled);

        let mut t = target();
        begin_attempt(&mut t, now).unwrap();
        assert!(cancel(&mut t, now).is_err());
    }

    #[test]
    fn test_aggregate_examples() {
        use TargetState::*;
        assert_eq!(aggregate_status(&[Pending, Pending]), JobStatus::Pending);
        assert_eq!(aggregate_status(&[Succeeded, Succeeded]), JobStatus::Completed);
        assert_eq!(
            aggregate_status(&[Succeeded, FailedPermanent]),
            JobStatus::Completed
        );
        assert_eq!(
            aggregate_status(&[FailedPermanent, FailedPermanent]),
            JobStatus::Failed
        );
        assert_eq!(
            aggregate_status(&[Succeeded, FailedRetryable, FailedPermanent]),
            JobStatus::Processing
        );
        assert_eq!(aggregate_status(&[Cancelled, Cancelled]), JobStatus::Cancelled);
        assert_eq!(aggregate_status(&[Pending, Succeeded]), JobStatus::Processing);
    }

    // === Property-Based Tests ===

    /// Reference definition, written independently of `aggregate_status`.
    fn expected_status(states: &[TargetState]) -> JobStatus {
        use TargetState::*;
        let count = |s: TargetState| states.iter().filter(|x| **x == s).count();
        let n = states.len();
        if count(Pending) == n {
            JobStatus::Pending
        } else if count(Cancelled) == n {
            JobStatus::Cancelled
        } else if count(Succeeded) == n {
            JobStatus::Completed
        } else if count(FailedPermanent) + count(Cancelled) == n {
            JobStatus::Failed
        } else if count(Succeeded) > 0
            && count(Succeeded) + count(FailedPermanent) + count(Cancelled) == n
        {
            JobStatus::Completed
        } else {
            JobStatus::Processing
        }
    }

    #[test]
    fn aggregate_matches_reference_for_full_cartesian_product() {
        // Every combination of up to three targets.
        let all = TargetState::ALL;
        for a in all {
            assert_eq!(aggregate_status(&[a]), expected_status(&[a]));
            for b in all {
                assert_eq!(aggregate_status(&[a, b]), expected_status(&[a, b]));
                for c in all {
                    let states = [a, b, c];
                    assert_eq!(
                        aggregate_status(&states),
                        expected_status(&states),
                        "states: {states:?}"
                    );
                }
            }
        }
    }

    fn target_state() -> impl Strategy<Value = TargetState> {
        prop::sample::select(TargetState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn aggregate_matches_reference(states in prop::collection::vec(target_state(), 1..8)) {
            prop_assert_eq!(aggregate_status(&states), expected_status(&states));
        }

        #[test]
        fn aggregate_is_order_independent(mut states in prop::collection::vec(target_state(), 1..8)) {
            let before = aggregate_status(&states);
            states.reverse();
            prop_assert_eq!(aggregate_status(&states), before);
        }

        #[test]
        fn any_in_flight_target_keeps_job_processing(
            states in prop::collection::vec(target_state(), 0..6),
            in_flight in prop::sample::select(vec![TargetState::Processing, TargetState::FailedRetryable]),
        ) {
            let mut states = states;
            states.push(in_flight);
            prop_assert_eq!(aggregate_status(&states), JobStatus::Processing);
        }

        #[test]
        fn transient_failures_never_exceed_budget(max_attempts in 1u32..10, failures in 1usize..20) {
            let policy = RetryPolicy { max_attempts, ..RetryPolicy::default() };
            let mut t = target();
            let now = Utc::now();
            for _ in 0..failures {
                if begin_attempt(&mut t, now).is_err() {
                    break;
                }
                apply_outcome(&mut t, &transient(), &policy, now).unwrap();
            }
            prop_assert!(t.attempt_count <= max_attempts);
            if t.attempt_count == max_attempts {
                prop_assert_eq!(t.state, TargetState::FailedPermanent);
                prop_assert!(t.next_attempt_at.is_none());
            }
        }
    }
}
