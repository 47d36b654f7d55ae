//! When the next periodic job runs.
//!
//! Each periodic job has a [`Scheduler`] with two observable states, `Idle`
//! and `Scheduled`. Scheduling hands out a ticket that the queued job must
//! present when it fires; a job whose ticket was superseded (by a manual
//! trigger or a shutdown) is dropped, so there is never more than one live
//! schedule chain per job.

use crate::types::BatchOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Exponential backoff with a hard cap: `min(cap, base * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        BackoffPolicy { base, cap }
    }

    /// Delay after the failure of 0-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

/// Fixed polling intervals used after a successful tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Nothing left to ship.
    pub success: Duration,
    /// Backlog remains after the batch.
    pub drain: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Intervals {
            success: Duration::from_secs(30),
            drain: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub delay: Duration,
    /// Attempt number the next tick runs as.
    pub attempt: u32,
}

/// Transition table for the replication job.
///
/// | outcome                 | delay                       | next attempt |
/// |-------------------------|-----------------------------|--------------|
/// | failed at attempt `n`   | `min(cap, base * 2^n)`      | `n + 1`      |
/// | replicated, backlog     | `drain`                     | 0            |
/// | replicated, no backlog  | `success`                   | 0            |
/// | idle                    | `success`                   | 0            |
pub fn next_tick(
    outcome: &BatchOutcome,
    intervals: &Intervals,
    backoff: &BackoffPolicy,
) -> Decision {
    match outcome {
        BatchOutcome::Failed { attempt, .. } => Decision {
            delay: backoff.delay(*attempt),
            attempt: attempt.saturating_add(1),
        },
        BatchOutcome::Replicated { remaining, .. } if *remaining > 0 => Decision {
            delay: intervals.drain,
            attempt: 0,
        },
        BatchOutcome::Replicated { .. } | BatchOutcome::Idle => Decision {
            delay: intervals.success,
            attempt: 0,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Scheduled {
        attempt: u32,
        delay_ms: u64,
        due_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub job: String,
    #[serde(flatten)]
    pub state: SchedulerState,
    pub runs: u64,
}

struct Inner {
    state: SchedulerState,
    ticket: u64,
    stopped: bool,
    runs: u64,
}

pub struct Scheduler {
    job: &'static str,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(job: &'static str) -> Self {
        Scheduler {
            job,
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                ticket: 0,
                stopped: false,
                runs: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `Scheduled`, superseding any earlier ticket. Returns the
    /// ticket the queued job carries, or `None` once stopped.
    pub fn schedule(&self, delay: Duration, attempt: u32) -> Option<u64> {
        let mut inner = self.lock();
        if inner.stopped {
            return None;
        }
        inner.ticket += 1;
        let due_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        inner.state = SchedulerState::Scheduled {
            attempt,
            delay_ms: delay.as_millis().min(u64::MAX as u128) as u64,
            due_at,
        };
        Some(inner.ticket)
    }

    /// Called when a queued job fires. Returns the attempt to run, or `None`
    /// for a superseded ticket. A claimed job leaves the scheduler `Idle`
    /// until the job reschedules itself.
    pub fn claim(&self, ticket: u64) -> Option<u32> {
        let mut inner = self.lock();
        if inner.stopped || ticket != inner.ticket {
            return None;
        }
        let SchedulerState::Scheduled { attempt, .. } = inner.state else {
            return None;
        };
        inner.state = SchedulerState::Idle;
        inner.runs += 1;
        Some(attempt)
    }

    /// Invalidate any queued ticket without stopping.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        inner.ticket += 1;
        inner.state = SchedulerState::Idle;
    }

    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.stopped = true;
        inner.ticket += 1;
        inner.state = SchedulerState::Idle;
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self.lock().state, SchedulerState::Scheduled { .. })
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = self.lock();
        SchedulerSnapshot {
            job: self.job.to_string(),
            state: inner.state.clone(),
            runs: inner.runs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn failed(attempt: u32) -> BatchOutcome {
        BatchOutcome::Failed {
            attempt,
            reason: "connection refused".into(),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..8).map(|a| policy.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn test_backoff_never_overflows() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(31), secs(60));
        assert_eq!(policy.delay(32), secs(60));
        assert_eq!(policy.delay(u32::MAX), secs(60));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let policy = BackoffPolicy::new(Duration::from_millis(300), secs(45));
        let mut last = Duration::ZERO;
        for attempt in 0..40 {
            let d = policy.delay(attempt);
            assert!(d >= last);
            assert!(d <= secs(45));
            last = d;
        }
    }

    #[test]
    fn test_transitions() {
        let intervals = Intervals::default();
        let backoff = BackoffPolicy::default();

        let d = next_tick(&failed(0), &intervals, &backoff);
        assert_eq!(d, Decision { delay: secs(2), attempt: 1 });
        let d = next_tick(&failed(2), &intervals, &backoff);
        assert_eq!(d, Decision { delay: secs(8), attempt: 3 });

        let drain = BatchOutcome::Replicated {
            replicated: 10,
            rejected: 0,
            remaining: 5,
        };
        assert_eq!(
            next_tick(&drain, &intervals, &backoff),
            Decision { delay: secs(2), attempt: 0 }
        );

        let done = BatchOutcome::Replicated {
            replicated: 5,
            rejected: 0,
            remaining: 0,
        };
        assert_eq!(
            next_tick(&done, &intervals, &backoff),
            Decision { delay: secs(30), attempt: 0 }
        );
        assert_eq!(
            next_tick(&BatchOutcome::Idle, &intervals, &backoff),
            Decision { delay: secs(30), attempt: 0 }
        );
    }

    #[test]
    fn test_ticket_lifecycle() {
        let s = Scheduler::new("replicate");
        assert!(!s.is_scheduled());

        let first = s.schedule(secs(30), 0).unwrap();
        let second = s.schedule(Duration::ZERO, 0).unwrap();
        assert!(s.is_scheduled());

        // The superseded job is dropped when it fires.
        assert_eq!(s.claim(first), None);
        assert_eq!(s.claim(second), Some(0));
        assert!(!s.is_scheduled());
        // A ticket is single-use.
        assert_eq!(s.claim(second), None);
        assert_eq!(s.snapshot().runs, 1);
    }

    #[test]
    fn test_stop_refuses_everything() {
        let s = Scheduler::new("reap");
        let ticket = s.schedule(secs(5), 2).unwrap();
        s.stop();
        assert_eq!(s.claim(ticket), None);
        assert_eq!(s.schedule(secs(5), 0), None);
        assert_eq!(s.snapshot().state, SchedulerState::Idle);
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let s = Scheduler::new("replicate");
        s.schedule(secs(4), 1);
        let v = serde_json::to_value(s.snapshot()).unwrap();
        assert_eq!(v["job"], "replicate");
        assert_eq!(v["state"], "scheduled");
        assert_eq!(v["attempt"], 1);
        assert_eq!(v["delay_ms"], 4000);
    }
}
