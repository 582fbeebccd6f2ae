//! Schedule records — the scheduler's per-workflow bookkeeping and its state machine.
//!
//! ```text
//! NotStarted → Queued → InProgress → { Suspended, Completed, Failed }
//!                 ↑                        │
//!                 └────────────────────────┘ (resume)
//! ```

use chrono::{DateTime, Utc};
use faultlens_core::{FaultLensError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::continuation::Continuation;

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleStatus {
    NotStarted,
    Queued,
    InProgress,
    Suspended,
    Completed,
    Failed,
}

impl ScheduleStatus {
    /// The only legal edges of the state machine.
    pub fn can_transition_to(self, next: ScheduleStatus) -> bool {
        use ScheduleStatus::*;
        matches!(
            (self, next),
            (NotStarted, Queued)
                | (Queued, InProgress)
                | (InProgress, Suspended)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Suspended, Queued)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScheduleStatus::Completed | ScheduleStatus::Failed)
    }

    /// States a previous process may have left behind mid-flight.
    pub fn is_interrupted(self) -> bool {
        matches!(
            self,
            ScheduleStatus::NotStarted | ScheduleStatus::Queued | ScheduleStatus::InProgress
        )
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Timing and attempt bookkeeping embedded in a [`ScheduleRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingInfo {
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_activation: Option<DateTime<Utc>>,
    pub continuation: Option<Continuation>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set while a step for this workflow is queued or running. Never persisted.
    #[serde(skip)]
    pub in_use: bool,
}

/// Result of reconciling an interrupted record at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Suspended with `ResumeImmediately`; the next activation pass picks it up.
    Resumable,
    /// Attempts used up; the record is now `Failed`.
    Exhausted,
}

/// One record per workflow, keyed by the workflow id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub workflow_id: Uuid,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub last_invoked_at: Option<DateTime<Utc>>,
    pub has_registered_interest: bool,
    pub scheduling: SchedulingInfo,
}

impl ScheduleRecord {
    /// Create a fresh record; `max_attempts` must be in [1, 3].
    pub fn new(workflow_id: Uuid, max_attempts: u32) -> Result<Self> {
        if !(1..=3).contains(&max_attempts) {
            return Err(FaultLensError::invalid_argument(format!(
                "max_attempts must be in [1, 3], got {max_attempts}"
            )));
        }
        Ok(Self {
            workflow_id,
            status: ScheduleStatus::NotStarted,
            created_at: Utc::now(),
            last_invoked_at: None,
            has_registered_interest: false,
            scheduling: SchedulingInfo {
                attempts: 0,
                max_attempts,
                next_activation: None,
                continuation: None,
                started_at: None,
                ended_at: None,
                in_use: false,
            },
        })
    }

    fn transition(&mut self, next: ScheduleStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FaultLensError::IllegalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::trace!("workflow {} {} -> {}", self.workflow_id, self.status, next);
        self.status = next;
        Ok(())
    }

    /// NotStarted/Suspended → Queued.
    pub fn mark_queued(&mut self) -> Result<()> {
        self.transition(ScheduleStatus::Queued)
    }

    /// Queued → InProgress. Requires attempts remaining.
    pub fn mark_started(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.has_attempts_remaining() {
            return Err(FaultLensError::OutOfAttempts(self.workflow_id));
        }
        self.transition(ScheduleStatus::InProgress)?;
        self.last_invoked_at = Some(now);
        if self.scheduling.started_at.is_none() {
            self.scheduling.started_at = Some(now);
        }
        Ok(())
    }

    /// Apply the directive returned by a step. Only valid while InProgress.
    ///
    /// A completed step clears the attempt counter, so attempts bound consecutive
    /// interrupted runs rather than interruptions over the workflow's lifetime.
    pub fn set_continuation(&mut self, continuation: Continuation, now: DateTime<Utc>) -> Result<()> {
        match &continuation {
            Continuation::Done => {
                self.transition(ScheduleStatus::Completed)?;
                self.scheduling.next_activation = None;
                self.scheduling.ended_at = Some(now);
            }
            Continuation::WaitForTime(delay) => {
                self.transition(ScheduleStatus::Suspended)?;
                self.scheduling.next_activation = Some(deadline(now, *delay));
            }
            Continuation::WaitForFabricEvent(_)
            | Continuation::WaitForScenario(_)
            | Continuation::WaitForInterest => {
                self.transition(ScheduleStatus::Suspended)?;
                self.scheduling.next_activation = None;
            }
        }
        self.scheduling.continuation = Some(continuation);
        self.scheduling.attempts = 0;
        Ok(())
    }

    /// InProgress → Failed.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ScheduleStatus::Failed)?;
        self.scheduling.next_activation = None;
        self.scheduling.ended_at = Some(now);
        Ok(())
    }

    pub fn increment_attempt(&mut self) {
        self.scheduling.attempts += 1;
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.scheduling.attempts < self.scheduling.max_attempts
    }

    /// Claim the in-memory guard. Claiming twice is a contract violation.
    pub fn start_use(&mut self) -> Result<()> {
        if self.scheduling.in_use {
            return Err(FaultLensError::GuardAlreadySet(self.workflow_id));
        }
        self.scheduling.in_use = true;
        Ok(())
    }

    pub fn stop_use(&mut self) {
        self.scheduling.in_use = false;
    }

    pub fn in_use(&self) -> bool {
        self.scheduling.in_use
    }

    pub fn continuation(&self) -> Option<&Continuation> {
        self.scheduling.continuation.as_ref()
    }

    /// Reconcile a record left NotStarted/Queued/InProgress by a previous process.
    ///
    /// This is the one edge outside the regular table: every interrupted run costs an
    /// attempt, and a record out of attempts is failed instead of resumed.
    pub fn recover_for_resume(&mut self, now: DateTime<Utc>) -> Result<RecoveryOutcome> {
        if !self.status.is_interrupted() {
            return Err(FaultLensError::IllegalTransition {
                from: self.status.to_string(),
                to: ScheduleStatus::Suspended.to_string(),
            });
        }
        self.scheduling.in_use = false;
        self.increment_attempt();
        if !self.has_attempts_remaining() {
            self.status = ScheduleStatus::Failed;
            self.scheduling.next_activation = None;
            self.scheduling.ended_at = Some(now);
            return Ok(RecoveryOutcome::Exhausted);
        }
        self.status = ScheduleStatus::Suspended;
        self.scheduling.continuation = Some(Continuation::resume_immediately());
        self.scheduling.next_activation = Some(now);
        Ok(RecoveryOutcome::Resumable)
    }

    /// Suspended on a timer whose deadline has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Suspended
            && matches!(self.scheduling.continuation, Some(Continuation::WaitForTime(_)))
            && self.scheduling.next_activation.is_some_and(|at| at <= now)
    }

    /// Suspended on a signal-style directive and not currently claimed.
    ///
    /// Callers check this and then claim the guard separately, so the answer can be
    /// stale by the time it is acted on.
    pub fn is_ready_to_accept_signal(&self) -> bool {
        self.status == ScheduleStatus::Suspended
            && !self.scheduling.in_use
            && self
                .scheduling
                .continuation
                .as_ref()
                .is_some_and(Continuation::waits_for_signal)
    }
}

fn deadline(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Heap entry ordering records for the activation loop: earliest next-activation
/// first, records without a timer last, ties broken by newest creation time.
#[derive(Debug, Clone)]
pub struct ActivationCandidate(pub ScheduleRecord);

impl ActivationCandidate {
    fn priority(&self, other: &Self) -> Ordering {
        let a = &self.0;
        let b = &other.0;
        let by_time = match (a.scheduling.next_activation, b.scheduling.next_activation) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        by_time.then_with(|| a.created_at.cmp(&b.created_at))
    }
}

impl PartialEq for ActivationCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.priority(other) == Ordering::Equal
    }
}

impl Eq for ActivationCandidate {}

impl PartialOrd for ActivationCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActivationCandidate {
    /// Greater means "activate sooner", so a `BinaryHeap` pops in activation order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;
    use std::time::Duration;

    fn record() -> ScheduleRecord {
        ScheduleRecord::new(Uuid::new_v4(), 2).unwrap()
    }

    #[test]
    fn test_max_attempts_bounds() {
        assert!(ScheduleRecord::new(Uuid::new_v4(), 0).is_err());
        assert!(ScheduleRecord::new(Uuid::new_v4(), 4).is_err());
        assert!(ScheduleRecord::new(Uuid::new_v4(), 3).is_ok());
    }

    #[test]
    fn test_legal_edges_only() {
        use ScheduleStatus::*;
        let all = [NotStarted, Queued, InProgress, Suspended, Completed, Failed];
        let legal = [
            (NotStarted, Queued),
            (Queued, InProgress),
            (InProgress, Suspended),
            (InProgress, Completed),
            (InProgress, Failed),
            (Suspended, Queued),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_happy_path_to_completed() {
        let now = Utc::now();
        let mut r = record();
        r.mark_queued().unwrap();
        r.mark_started(now).unwrap();
        assert_eq!(r.status, ScheduleStatus::InProgress);
        assert_eq!(r.last_invoked_at, Some(now));

        r.set_continuation(Continuation::done(), now).unwrap();
        assert_eq!(r.status, ScheduleStatus::Completed);
        assert_eq!(r.scheduling.ended_at, Some(now));
        assert!(r.status.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_fail() {
        let now = Utc::now();
        let mut r = record();
        // NotStarted -> InProgress skips Queued.
        assert!(matches!(
            r.mark_started(now),
            Err(FaultLensError::IllegalTransition { .. })
        ));
        assert!(r.set_continuation(Continuation::done(), now).is_err());
        assert!(r.mark_failed(now).is_err());

        r.mark_queued().unwrap();
        assert!(r.mark_queued().is_err());
        r.mark_started(now).unwrap();
        r.set_continuation(Continuation::done(), now).unwrap();
        // Completed is terminal.
        assert!(r.mark_queued().is_err());
        assert_eq!(r.status, ScheduleStatus::Completed);
    }

    #[test]
    fn test_wait_for_time_sets_deadline() {
        let now = Utc::now();
        let mut r = record();
        r.mark_queued().unwrap();
        r.mark_started(now).unwrap();
        r.set_continuation(Continuation::resume_after(Duration::from_secs(5)), now)
            .unwrap();
        assert_eq!(r.status, ScheduleStatus::Suspended);
        assert_eq!(
            r.scheduling.next_activation,
            Some(now + chrono::Duration::seconds(5))
        );
        assert!(!r.is_due(now));
        assert!(r.is_due(now + chrono::Duration::seconds(5)));
        assert!(!r.is_ready_to_accept_signal());
    }

    #[test]
    fn test_signal_waits_have_no_timer() {
        let now = Utc::now();
        let mut r = record();
        r.mark_queued().unwrap();
        r.mark_started(now).unwrap();
        r.set_continuation(Continuation::wait_for_interest(), now).unwrap();
        assert_eq!(r.status, ScheduleStatus::Suspended);
        assert!(r.scheduling.next_activation.is_none());
        assert!(r.is_ready_to_accept_signal());

        r.start_use().unwrap();
        assert!(!r.is_ready_to_accept_signal());

        // Resume edge.
        r.mark_queued().unwrap();
        assert_eq!(r.status, ScheduleStatus::Queued);
    }

    #[test]
    fn test_guard_never_double_set() {
        let mut r = record();
        r.start_use().unwrap();
        assert!(matches!(r.start_use(), Err(FaultLensError::GuardAlreadySet(_))));
        r.stop_use();
        assert!(r.start_use().is_ok());
    }

    #[test]
    fn test_mark_started_requires_attempts() {
        let mut r = ScheduleRecord::new(Uuid::new_v4(), 1).unwrap();
        r.mark_queued().unwrap();
        r.increment_attempt();
        assert!(matches!(
            r.mark_started(Utc::now()),
            Err(FaultLensError::OutOfAttempts(_))
        ));
        assert_eq!(r.status, ScheduleStatus::Queued);
    }

    #[test]
    fn test_recover_for_resume() {
        let now = Utc::now();
        let mut r = record();
        r.mark_queued().unwrap();
        r.mark_started(now).unwrap();
        r.start_use().unwrap();

        assert_eq!(r.recover_for_resume(now).unwrap(), RecoveryOutcome::Resumable);
        assert_eq!(r.status, ScheduleStatus::Suspended);
        assert_eq!(r.continuation(), Some(&Continuation::resume_immediately()));
        assert!(r.is_due(now));
        assert!(!r.in_use());
        assert_eq!(r.scheduling.attempts, 1);

        // Interrupted again: second attempt used up.
        r.mark_queued().unwrap();
        assert_eq!(r.recover_for_resume(now).unwrap(), RecoveryOutcome::Exhausted);
        assert_eq!(r.status, ScheduleStatus::Failed);

        // Terminal records are not interrupted.
        assert!(r.recover_for_resume(now).is_err());
    }

    #[test]
    fn test_completed_step_resets_attempts() {
        let now = Utc::now();
        let mut r = record();
        r.mark_queued().unwrap();
        r.mark_started(now).unwrap();
        assert_eq!(r.recover_for_resume(now).unwrap(), RecoveryOutcome::Resumable);
        assert_eq!(r.scheduling.attempts, 1);

        // Many healthy steps after the first interruption.
        for _ in 0..100 {
            r.mark_queued().unwrap();
            r.mark_started(now).unwrap();
            r.set_continuation(Continuation::resume_after(Duration::from_secs(1)), now)
                .unwrap();
        }
        assert_eq!(r.scheduling.attempts, 0);

        // A later interruption is survivable again.
        r.mark_queued().unwrap();
        r.mark_started(now).unwrap();
        assert_eq!(r.recover_for_resume(now).unwrap(), RecoveryOutcome::Resumable);
        assert_eq!(r.status, ScheduleStatus::Suspended);
    }

    #[test]
    fn test_serde_skips_guard() {
        let mut r = record();
        r.start_use().unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("in_use"));
        let back: ScheduleRecord = serde_json::from_str(&json).unwrap();
        assert!(!back.in_use());
    }

    #[test]
    fn test_activation_order() {
        let now = Utc::now();
        let mut late = record();
        late.scheduling.next_activation = Some(now + chrono::Duration::seconds(10));
        let mut early = record();
        early.scheduling.next_activation = Some(now);
        let mut untimed_old = record();
        untimed_old.created_at = now - chrono::Duration::seconds(60);
        let mut untimed_new = record();
        untimed_new.created_at = now;

        let mut heap: BinaryHeap<ActivationCandidate> = [
            untimed_old.clone(),
            late.clone(),
            untimed_new.clone(),
            early.clone(),
        ]
        .into_iter()
        .map(ActivationCandidate)
        .collect();

        let order: Vec<Uuid> = std::iter::from_fn(|| heap.pop())
            .map(|c| c.0.workflow_id)
            .collect();
        assert_eq!(
            order,
            vec![
                early.workflow_id,
                late.workflow_id,
                untimed_new.workflow_id,
                untimed_old.workflow_id
            ]
        );
    }
}
