//! Job queue state machine
//!
//! Pure transition rules for outbox jobs. Repositories persist the jobs and
//! guarantee claim atomicity; every status change is decided here so the SQL
//! and in-memory stores behave identically.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::domain::job::{IdempotencyKey, Job, JobId, JobStatus, JobType};

/// Exponent ceiling for retry backoff, roughly 34 years of delay.
const MAX_BACKOFF_EXPONENT: u32 = 30;

#[derive(Clone, Debug)]
pub struct JobQueueConfig {
    /// Attempts allowed when the enqueuer does not specify a limit
    pub default_max_attempts: u32,
    /// Base of the exponential backoff, in seconds
    pub backoff_base_seconds: i64,
    /// How long a job may stay claimed before the stale sweep releases it
    pub processing_timeout_seconds: i64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self { default_max_attempts: 3, backoff_base_seconds: 2, processing_timeout_seconds: 900 }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobQueueError {
    #[error("invalid job transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: JobStatus, to: JobStatus, reason: String },
}

/// What `fail` decided for a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailOutcome {
    Retry { next_attempt_at: DateTime<Utc> },
    Exhausted,
}

/// Result of `complete`: a second completion leaves the job as it was.
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    Completed(Job),
    AlreadyCompleted(Job),
}

#[derive(Clone, Debug, Default)]
pub struct JobQueueEngine {
    config: JobQueueConfig,
}

impl JobQueueEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: JobQueueConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn new_job(
        &self,
        idempotency_key: IdempotencyKey,
        job_type: JobType,
        payload: Value,
        max_attempts: Option<u32>,
        now: DateTime<Utc>,
    ) -> Job {
        Job {
            id: JobId::generate(),
            idempotency_key,
            job_type,
            payload_hash: hash_payload(&payload),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.unwrap_or(self.config.default_max_attempts).max(1),
            next_attempt_at: now,
            claimed_at: None,
            last_error: None,
            result: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Whether `job` may be claimed right now by a worker asking for `job_type`.
    pub fn is_claimable(job: &Job, job_type: Option<JobType>, now: DateTime<Utc>) -> bool {
        job.status == JobStatus::Pending
            && job.next_attempt_at <= now
            && job_type.map_or(true, |wanted| wanted == job.job_type)
    }

    /// Pending -> Processing. Each claim counts as one attempt.
    pub fn claim(&self, mut job: Job, now: DateTime<Utc>) -> Result<Job, JobQueueError> {
        if job.status != JobStatus::Pending {
            return Err(JobQueueError::InvalidTransition {
                from: job.status,
                to: JobStatus::Processing,
                reason: "only pending jobs can be claimed".to_owned(),
            });
        }

        job.status = JobStatus::Processing;
        job.attempts = job.attempts.saturating_add(1);
        job.claimed_at = Some(now);
        Ok(job)
    }

    pub fn complete(
        &self,
        mut job: Job,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<Completion, JobQueueError> {
        match job.status {
            JobStatus::Completed => Ok(Completion::AlreadyCompleted(job)),
            JobStatus::Failed => Err(JobQueueError::InvalidTransition {
                from: job.status,
                to: JobStatus::Completed,
                reason: "job already failed terminally".to_owned(),
            }),
            JobStatus::Pending | JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.result = result;
                job.completed_at = Some(now);
                job.claimed_at = None;
                Ok(Completion::Completed(job))
            }
        }
    }

    /// Records a failed attempt. `attempts` and `max_attempts` come from the
    /// caller, which read them off the claimed job.
    pub fn fail(
        &self,
        mut job: Job,
        error: impl Into<String>,
        attempts: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(Job, FailOutcome), JobQueueError> {
        if job.status.is_terminal() {
            return Err(JobQueueError::InvalidTransition {
                from: job.status,
                to: JobStatus::Failed,
                reason: "job already in terminal state".to_owned(),
            });
        }

        job.last_error = Some(error.into());
        job.claimed_at = None;

        if attempts < max_attempts {
            let next_attempt_at =
                now.checked_add_signed(self.backoff(attempts)).unwrap_or(DateTime::<Utc>::MAX_UTC);
            job.status = JobStatus::Pending;
            job.next_attempt_at = next_attempt_at;
            Ok((job, FailOutcome::Retry { next_attempt_at }))
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            Ok((job, FailOutcome::Exhausted))
        }
    }

    /// Delay before the next attempt after `attempts` failures: base^attempts seconds.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(MAX_BACKOFF_EXPONENT);
        let base = self.config.backoff_base_seconds.max(1);
        let seconds = base.checked_pow(exponent).unwrap_or(i64::MAX / 1000);
        Duration::try_seconds(seconds).unwrap_or(Duration::MAX)
    }

    pub fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.processing_timeout_seconds)
    }

    pub fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.status == JobStatus::Processing
            && job.claimed_at.is_some_and(|claimed_at| claimed_at < self.stale_cutoff(now))
    }

    /// Releases a job whose worker vanished. The abandoned claim counts as a
    /// failed attempt.
    pub fn release_stale(
        &self,
        job: Job,
        now: DateTime<Utc>,
    ) -> Result<(Job, FailOutcome), JobQueueError> {
        if !self.is_stale(&job, now) {
            return Err(JobQueueError::InvalidTransition {
                from: job.status,
                to: JobStatus::Pending,
                reason: "job is not a stale claim".to_owned(),
            });
        }
        let attempts = job.attempts;
        let max_attempts = job.max_attempts;
        self.fail(job, "processing timed out", attempts, max_attempts, now)
    }

    /// Operator replay of a terminally failed job.
    pub fn replay(&self, mut job: Job, now: DateTime<Utc>) -> Result<Job, JobQueueError> {
        if job.status != JobStatus::Failed {
            return Err(JobQueueError::InvalidTransition {
                from: job.status,
                to: JobStatus::Pending,
                reason: "only failed jobs can be replayed".to_owned(),
            });
        }

        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.next_attempt_at = now;
        job.completed_at = None;
        job.claimed_at = None;
        Ok(job)
    }
}

/// sha256 of the payload's JSON encoding, hex encoded.
pub fn hash_payload(payload: &Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Current time truncated to millisecond precision, the resolution jobs are stored at.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
