//! Reconciliation loop primitives.
//!
//! Helpers shared by everything that pushes desired routing state into a
//! load-balancer backend:
//!
//! - **Job tracking**: mutations on job-based backends return identifiers that
//!   must be polled to a terminal state within a wait budget.
//! - **Checkpoint**: the last acknowledged event, for at-least-once delivery.
//! - **Retry tracking**: how often the same event has failed in a row.
//!
//! # Invariants
//!
//! - A job set is complete only when every job has succeeded
//! - The first failed job, or the first deadline overrun, ends the wait
//! - Checkpoints never move backwards

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// The backend reported the job as failed.
    #[error("job {job_id} failed")]
    JobFailed { job_id: String },

    /// The job did not reach a terminal state within the wait budget.
    #[error("timeout after {elapsed:?} waiting for job {job_id}")]
    JobTimeout { job_id: String, elapsed: Duration },
}

/// State of an asynchronous backend job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted but not finished.
    Pending,

    /// Applied by the backend.
    Succeeded,

    /// Rejected or aborted by the backend.
    Failed,
}

/// How long and how often to poll a job set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    /// Delay between polling rounds.
    pub interval: Duration,

    /// Maximum time to wait for the whole job set.
    pub max_wait: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            interval: DEFAULT_JOB_POLL_INTERVAL,
            max_wait: DEFAULT_JOB_TIMEOUT,
        }
    }
}

/// Tracks a set of jobs issued by one mutation until all are terminal.
///
/// The tracker does no I/O; the caller polls the backend and feeds the
/// observed states in, then sleeps for [`PollBudget::interval`] between
/// rounds.
#[derive(Debug, Clone)]
pub struct JobTracker {
    budget: PollBudget,
    started: Instant,
    pending: BTreeSet<String>,
}

impl JobTracker {
    /// Start tracking `jobs`, with the wait budget starting at `now`.
    pub fn new<I>(jobs: I, budget: PollBudget, now: Instant) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            budget,
            started: now,
            pending: jobs.into_iter().collect(),
        }
    }

    /// Jobs still waiting on a terminal state, in stable order.
    pub fn pending(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// Returns true once every job has succeeded.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Delay before the next polling round.
    pub fn interval(&self) -> Duration {
        self.budget.interval
    }

    /// Record an observed job state.
    ///
    /// Succeeded jobs leave the wait set; a failed job aborts the wait.
    pub fn observe(&mut self, job_id: &str, state: JobState) -> Result<(), ReconcileError> {
        match state {
            JobState::Pending => Ok(()),
            JobState::Succeeded => {
                self.pending.remove(job_id);
                Ok(())
            }
            JobState::Failed => Err(ReconcileError::JobFailed {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Fail with [`ReconcileError::JobTimeout`] if the budget is spent and
    /// jobs are still pending.
    pub fn check_deadline(&self, now: Instant) -> Result<(), ReconcileError> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.budget.max_wait {
            return Ok(());
        }

        match self.pending.iter().next() {
            Some(job_id) => Err(ReconcileError::JobTimeout {
                job_id: job_id.clone(),
                elapsed,
            }),
            None => Ok(()),
        }
    }
}

/// Checkpoint of the delivery stream.
///
/// Tracks the last acknowledged event for at-least-once consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last acknowledged event ID.
    pub last_event_id: i64,

    /// Timestamp of last checkpoint update.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Create a new checkpoint.
    pub fn new(last_event_id: i64) -> Self {
        Self {
            last_event_id,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Check if an event has already been acknowledged.
    pub fn is_processed(&self, event_id: i64) -> bool {
        event_id <= self.last_event_id
    }

    /// Advance the checkpoint to a new event.
    pub fn advance(&mut self, event_id: i64) {
        if event_id > self.last_event_id {
            self.last_event_id = event_id;
            self.updated_at = chrono::Utc::now();
        }
    }
}

/// Retry tracker for repeatedly failing work items.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Failures tolerated before a key counts as exhausted.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Number of failures currently counted for `key`.
    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    /// Clear failure tracking (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default delay between job polling rounds.
pub const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default wait budget for a job set.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Default failures per event before operator attention is requested.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
