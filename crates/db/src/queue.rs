//! Outbox job queue service
//!
//! Wraps a [`JobRepository`] with the transition rules from
//! [`JobQueueEngine`]. Every write after a load is a compare-and-set on the
//! status that was loaded, so two workers racing on one job cannot both win.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use carelink_core::chrono::{DateTime, Utc};
use carelink_core::domain::job::{IdempotencyKey, Job, JobId, JobStats, JobStatus, JobType};
use carelink_core::job_queue::{
    hash_payload, now_millis, Completion, FailOutcome, JobQueueConfig, JobQueueEngine,
    JobQueueError,
};

use crate::repositories::{JobRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("job `{0}` not found")]
    NotFound(JobId),
    #[error("job `{0}` was modified concurrently")]
    Conflict(JobId),
    #[error(transparent)]
    Transition(#[from] JobQueueError),
}

#[derive(Clone)]
pub struct JobQueue {
    repo: Arc<dyn JobRepository>,
    engine: JobQueueEngine,
}

impl JobQueue {
    pub fn new(repo: Arc<dyn JobRepository>, config: JobQueueConfig) -> Self {
        Self { repo, engine: JobQueueEngine::with_config(config) }
    }

    pub fn engine(&self) -> &JobQueueEngine {
        &self.engine
    }

    /// Enqueues at most one job per idempotency key. A duplicate returns the
    /// id of the job already holding the key and leaves it untouched.
    pub async fn ensure_unique_job(
        &self,
        key: IdempotencyKey,
        job_type: JobType,
        payload: Value,
        max_attempts: Option<u32>,
    ) -> Result<JobId, QueueError> {
        self.schedule_unique_job(key, job_type, payload, max_attempts, now_millis()).await
    }

    /// Like [`JobQueue::ensure_unique_job`], but the job is not claimable
    /// before `run_at`.
    pub async fn schedule_unique_job(
        &self,
        key: IdempotencyKey,
        job_type: JobType,
        payload: Value,
        max_attempts: Option<u32>,
        run_at: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        let now = now_millis();
        let mut candidate = self.engine.new_job(key, job_type, payload, max_attempts, now);
        let run_at = DateTime::from_timestamp_millis(run_at.timestamp_millis()).unwrap_or(run_at);
        candidate.next_attempt_at = run_at.max(now);
        let candidate_id = candidate.id.clone();
        let candidate_hash = candidate.payload_hash.clone();

        let stored = self.repo.insert_if_absent(candidate).await?;

        if stored.id == candidate_id {
            info!(
                event_name = "queue.job_enqueued",
                job_id = %stored.id,
                idempotency_key = %stored.idempotency_key,
                job_type = stored.job_type.as_str(),
                "job enqueued"
            );
        } else if stored.payload_hash != candidate_hash {
            warn!(
                event_name = "queue.duplicate_payload_mismatch",
                job_id = %stored.id,
                idempotency_key = %stored.idempotency_key,
                job_type = stored.job_type.as_str(),
                "duplicate enqueue carried a different payload; keeping the original"
            );
        }

        Ok(stored.id)
    }

    pub async fn claim_next_job(&self, job_type: Option<JobType>) -> Result<Option<Job>, QueueError> {
        let claimed = self.repo.claim_next(job_type, now_millis()).await?;
        if let Some(job) = &claimed {
            info!(
                event_name = "queue.job_claimed",
                job_id = %job.id,
                idempotency_key = %job.idempotency_key,
                job_type = job.job_type.as_str(),
                attempts = job.attempts,
                "job claimed"
            );
        }
        Ok(claimed)
    }

    /// Marks the job completed. `claimed_attempts` is the attempt count the
    /// worker saw when it claimed the job; a claim that was swept and handed to
    /// another worker gets `Conflict`. Completing an already completed job is a
    /// no-op and returns it unchanged.
    pub async fn complete_job(
        &self,
        id: &JobId,
        claimed_attempts: u32,
        result: Option<Value>,
    ) -> Result<Job, QueueError> {
        let loaded = self.load(id).await?;
        if !loaded.status.is_terminal() {
            ensure_claim_held(&loaded, claimed_attempts)?;
        }

        match self.engine.complete(loaded, result, now_millis())? {
            Completion::AlreadyCompleted(job) => Ok(job),
            Completion::Completed(job) => {
                self.write(&job, JobStatus::Processing, claimed_attempts).await?;
                info!(
                    event_name = "queue.job_completed",
                    job_id = %job.id,
                    idempotency_key = %job.idempotency_key,
                    attempts = job.attempts,
                    "job completed"
                );
                Ok(job)
            }
        }
    }

    pub async fn fail_job(
        &self,
        id: &JobId,
        error: &str,
        attempts: u32,
        max_attempts: u32,
    ) -> Result<FailOutcome, QueueError> {
        let loaded = self.load(id).await?;
        if !loaded.status.is_terminal() {
            ensure_claim_held(&loaded, attempts)?;
        }

        let (job, outcome) = self.engine.fail(loaded, error, attempts, max_attempts, now_millis())?;
        self.write(&job, JobStatus::Processing, attempts).await?;

        match &outcome {
            FailOutcome::Retry { next_attempt_at } => warn!(
                event_name = "queue.job_retry_scheduled",
                job_id = %job.id,
                idempotency_key = %job.idempotency_key,
                attempts,
                next_attempt_at = %next_attempt_at.to_rfc3339(),
                error,
                "job attempt failed; retry scheduled"
            ),
            FailOutcome::Exhausted => warn!(
                event_name = "queue.job_failed",
                job_id = %job.id,
                idempotency_key = %job.idempotency_key,
                attempts,
                error,
                "job failed permanently"
            ),
        }

        Ok(outcome)
    }

    /// Releases claims older than the processing timeout. Returns how many
    /// jobs were released; jobs another worker touched meanwhile are skipped.
    pub async fn requeue_stale(&self) -> Result<usize, QueueError> {
        let now = now_millis();
        let stale = self.repo.list_claimed_before(self.engine.stale_cutoff(now)).await?;

        let mut released = 0;
        for job in stale {
            let job_id = job.id.clone();
            let claimed_attempts = job.attempts;
            let (updated, outcome) = match self.engine.release_stale(job, now) {
                Ok(result) => result,
                Err(_) => continue,
            };
            if self
                .repo
                .update_if_current(&updated, JobStatus::Processing, claimed_attempts)
                .await?
            {
                released += 1;
                warn!(
                    event_name = "queue.stale_claim_released",
                    job_id = %job_id,
                    exhausted = matches!(outcome, FailOutcome::Exhausted),
                    "released stale processing claim"
                );
            }
        }

        Ok(released)
    }

    /// Operator replay: a failed job goes back to pending with a fresh attempt count.
    pub async fn replay_failed(&self, id: &JobId) -> Result<Job, QueueError> {
        let loaded = self.load(id).await?;
        let (expected_status, expected_attempts) = (loaded.status, loaded.attempts);

        let job = self.engine.replay(loaded, now_millis())?;
        self.write(&job, expected_status, expected_attempts).await?;
        info!(
            event_name = "queue.job_replayed",
            job_id = %job.id,
            idempotency_key = %job.idempotency_key,
            "failed job replayed"
        );
        Ok(job)
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        let counts = self.repo.counts().await?;

        let mut by_status: BTreeMap<String, u64> =
            JobStatus::ALL.iter().map(|status| (status.as_str().to_owned(), 0)).collect();
        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut total = 0;

        for (status, job_type, count) in counts.by_status_and_type {
            total += count;
            *by_status.entry(status.as_str().to_owned()).or_default() += count;
            *by_type.entry(job_type.as_str().to_owned()).or_default() += count;
        }

        let oldest_pending_age_seconds = counts
            .oldest_pending_created_at
            .map(|created_at| (now_millis() - created_at).num_seconds().max(0));

        let mut stats = JobStats {
            total,
            by_status,
            by_type,
            pending_count: 0,
            failed_count: 0,
            oldest_pending_age_seconds,
        };
        stats.pending_count = stats.count_for(JobStatus::Pending);
        stats.failed_count = stats.count_for(JobStatus::Failed);
        Ok(stats)
    }

    pub async fn find(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.repo.find_by_id(id).await?)
    }

    pub async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Job>, QueueError> {
        Ok(self.repo.find_by_key(key).await?)
    }

    pub async fn list_by_status(&self, status: JobStatus, limit: u32) -> Result<Vec<Job>, QueueError> {
        Ok(self.repo.list_by_status(status, limit).await?)
    }

    /// Whether `payload` hashes the same as what is stored under `key`.
    pub async fn payload_matches(
        &self,
        key: &IdempotencyKey,
        payload: &Value,
    ) -> Result<bool, QueueError> {
        Ok(self
            .repo
            .find_by_key(key)
            .await?
            .is_some_and(|job| job.payload_hash == hash_payload(payload)))
    }

    async fn load(&self, id: &JobId) -> Result<Job, QueueError> {
        self.repo.find_by_id(id).await?.ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    async fn write(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_attempts: u32,
    ) -> Result<(), QueueError> {
        if self.repo.update_if_current(job, expected_status, expected_attempts).await? {
            Ok(())
        } else {
            Err(QueueError::Conflict(job.id.clone()))
        }
    }
}

/// The stored job must still be processing under the claim that produced
/// `claimed_attempts`.
fn ensure_claim_held(stored: &Job, claimed_attempts: u32) -> Result<(), QueueError> {
    if stored.status == JobStatus::Processing && stored.attempts == claimed_attempts {
        Ok(())
    } else {
        Err(QueueError::Conflict(stored.id.clone()))
    }
}
