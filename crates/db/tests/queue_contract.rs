use std::collections::HashSet;
use std::sync::Arc;

use carelink_core::domain::job::{IdempotencyKey, JobId, JobStatus, JobType};
use carelink_core::job_queue::{FailOutcome, JobQueueConfig, JobQueueEngine};
use carelink_db::repositories::{InMemoryJobRepository, SqlJobRepository};
use carelink_db::{connect_with_settings, migrations, JobQueue, QueueError};
use serde_json::json;

type QueueContractResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
}

const JOB_COUNT: usize = 40;
const WORKER_COUNT: usize = 6;

async fn sqlite_queue(dir: &tempfile::TempDir) -> QueueContractResult<JobQueue> {
    sqlite_queue_with(dir, JobQueueConfig::default()).await
}

async fn sqlite_queue_with(
    dir: &tempfile::TempDir,
    config: JobQueueConfig,
) -> QueueContractResult<JobQueue> {
    let path = dir.path().join("queue.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = connect_with_settings(&url, WORKER_COUNT as u32, 30)
        .await
        .map_err(|error| format!("connect: {error}"))?;
    migrations::run_pending(&pool).await.map_err(|error| format!("migrate: {error}"))?;
    Ok(JobQueue::new(Arc::new(SqlJobRepository::new(pool)), config))
}

fn memory_queue() -> JobQueue {
    JobQueue::new(Arc::new(InMemoryJobRepository::default()), JobQueueConfig::default())
}

async fn enqueue_batch(queue: &JobQueue) -> QueueContractResult<HashSet<JobId>> {
    let mut ids = HashSet::new();
    for index in 0..JOB_COUNT {
        let id = queue
            .ensure_unique_job(
                IdempotencyKey::new(format!("batch:{index}")),
                JobType::OutboundMessage,
                json!({ "to": "+15550000000", "body": format!("message {index}") }),
                None,
            )
            .await
            .map_err(|error| format!("enqueue: {error}"))?;
        ids.insert(id);
    }
    Ok(ids)
}

/// Drains the queue from several tasks at once and returns every claimed id
/// in claim order, duplicates included.
async fn drain_concurrently(queue: &JobQueue) -> QueueContractResult<Vec<JobId>> {
    let mut handles = Vec::with_capacity(WORKER_COUNT);
    for _ in 0..WORKER_COUNT {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = queue.claim_next_job(None).await.map_err(|e| e.to_string())? {
                claimed.push(job.id);
                tokio::task::yield_now().await;
            }
            Ok::<_, String>(claimed)
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        let claimed = handle.await.map_err(|error| format!("join: {error}"))??;
        all.extend(claimed);
    }
    Ok(all)
}

async fn assert_exclusive_claims(queue: JobQueue) -> QueueContractResult {
    let enqueued = enqueue_batch(&queue).await?;
    let claimed = drain_concurrently(&queue).await?;

    let unique: HashSet<JobId> = claimed.iter().cloned().collect();
    require_eq!(claimed.len(), JOB_COUNT);
    require_eq!(unique.len(), JOB_COUNT);
    require!(unique == enqueued, "claimed ids differ from enqueued ids");

    let stats = queue.stats().await.map_err(|error| error.to_string())?;
    require_eq!(stats.count_for(JobStatus::Processing), JOB_COUNT as u64);
    require_eq!(stats.pending_count, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_memory_claims_are_exclusive_under_concurrency() -> QueueContractResult {
    assert_exclusive_claims(memory_queue()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_claims_are_exclusive_under_concurrency() -> QueueContractResult {
    let dir = tempfile::tempdir().map_err(|error| error.to_string())?;
    let queue = sqlite_queue(&dir).await?;
    assert_exclusive_claims(queue).await
}

#[tokio::test]
async fn duplicate_webhook_delivery_yields_one_job() -> QueueContractResult {
    let dir = tempfile::tempdir().map_err(|error| error.to_string())?;
    let queue = sqlite_queue(&dir).await?;
    let key = IdempotencyKey::twilio("SM-dup");
    let payload = json!({ "from": "+15551234567", "body": "hi", "message_sid": "SM-dup" });

    let mut ids = HashSet::new();
    for _ in 0..3 {
        let id = queue
            .ensure_unique_job(key.clone(), JobType::InboundMessageProcessing, payload.clone(), None)
            .await
            .map_err(|error| error.to_string())?;
        ids.insert(id);
    }

    require_eq!(ids.len(), 1);
    let stats = queue.stats().await.map_err(|error| error.to_string())?;
    require_eq!(stats.total, 1);
    require_eq!(stats.by_type.get("process_inbound_sms").copied(), Some(1));
    Ok(())
}

#[tokio::test]
async fn retry_boundary_matches_max_attempts() -> QueueContractResult {
    let dir = tempfile::tempdir().map_err(|error| error.to_string())?;
    let queue = sqlite_queue(&dir).await?;

    let retrying = queue
        .ensure_unique_job(IdempotencyKey::new("boundary:2"), JobType::OutboundEmail, json!({}), Some(2))
        .await
        .map_err(|error| error.to_string())?;
    let claimed = queue
        .claim_next_job(None)
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| "first job should be claimable".to_string())?;
    require_eq!(claimed.id, retrying);
    let outcome = queue
        .fail_job(&claimed.id, "smtp timeout", claimed.attempts, claimed.max_attempts)
        .await
        .map_err(|error| error.to_string())?;
    require!(matches!(outcome, FailOutcome::Retry { .. }), "attempt 1 of 2 should retry, got {outcome:?}");

    let exhausted = queue
        .ensure_unique_job(IdempotencyKey::new("boundary:1"), JobType::OutboundEmail, json!({}), Some(1))
        .await
        .map_err(|error| error.to_string())?;
    let claimed = queue
        .claim_next_job(None)
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| "second job should be claimable".to_string())?;
    require_eq!(claimed.id, exhausted);
    let outcome = queue
        .fail_job(&claimed.id, "smtp timeout", claimed.attempts, claimed.max_attempts)
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(outcome, FailOutcome::Exhausted);

    let job = queue
        .find(&exhausted)
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| "job should still be queryable".to_string())?;
    require_eq!(job.status, JobStatus::Failed);
    require!(job.completed_at.is_some(), "failed job records completed_at");

    let job = queue
        .find(&retrying)
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| "job should still be queryable".to_string())?;
    require_eq!(job.status, JobStatus::Pending);
    require_eq!(job.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn swept_claim_cannot_be_finished_by_its_original_worker() -> QueueContractResult {
    let dir = tempfile::tempdir().map_err(|error| error.to_string())?;
    let config = JobQueueConfig {
        processing_timeout_seconds: -1,
        backoff_base_seconds: 1,
        ..JobQueueConfig::default()
    };
    let queue = sqlite_queue_with(&dir, config).await?;
    let id = queue
        .ensure_unique_job(IdempotencyKey::new("sweep"), JobType::OutboundMessage, json!({}), Some(5))
        .await
        .map_err(|error| error.to_string())?;

    let first = queue
        .claim_next_job(None)
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| "job should be claimable".to_string())?;
    require_eq!(queue.requeue_stale().await.map_err(|error| error.to_string())?, 1);

    let mut second = None;
    for _ in 0..40 {
        second = queue.claim_next_job(None).await.map_err(|error| error.to_string())?;
        if second.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    let second = second.ok_or_else(|| "released job never became due".to_string())?;
    require_eq!(second.id, id);
    require_eq!(second.attempts, first.attempts + 1);

    let late = queue.fail_job(&id, "late failure", first.attempts, first.max_attempts).await;
    require!(matches!(late, Err(QueueError::Conflict(_))), "late fail should conflict, got {late:?}");
    let late = queue.complete_job(&id, first.attempts, None).await;
    require!(matches!(late, Err(QueueError::Conflict(_))), "late complete should conflict, got {late:?}");

    let stored = queue
        .find(&id)
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| "job should still be queryable".to_string())?;
    require_eq!(stored.status, JobStatus::Processing);
    require!(
        queue.claim_next_job(None).await.map_err(|error| error.to_string())?.is_none(),
        "a held claim must not be handed out again"
    );
    Ok(())
}

#[test]
fn backoff_grows_with_each_attempt() -> QueueContractResult {
    let engine = JobQueueEngine::new();
    let delays: Vec<i64> = (0..8).map(|attempts| engine.backoff(attempts).num_seconds()).collect();

    require_eq!(delays[0], 1);
    require_eq!(delays[3], 8);
    require!(delays.windows(2).all(|pair| pair[1] > pair[0]), "delays not increasing: {delays:?}");
    Ok(())
}
