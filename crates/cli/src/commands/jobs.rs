//! Operator views over the outbox: counts, the failed list and manual replay.

use carelink_core::domain::job::{Job, JobId, JobStatus};
use carelink_db::{connect_from_config, QueueError, Store};
use serde_json::{json, Value};

use crate::commands::{
    prepare, CommandResult, EXIT_DATABASE, EXIT_INVALID_TRANSITION, EXIT_NOT_FOUND, EXIT_QUEUE,
};

type Failure = (&'static str, String, u8);

pub fn stats() -> CommandResult {
    let (config, runtime) = match prepare("jobs stats") {
        Ok(prepared) => prepared,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DATABASE))?;
        let store = Store::sqlite(pool.clone(), config.worker.queue_config());
        let stats = store.jobs.stats().await.map_err(queue_failure);
        pool.close().await;
        stats
    });

    match result {
        Ok(stats) => CommandResult::success_with_data(
            "jobs stats",
            format!(
                "{} jobs, {} pending, {} failed",
                stats.total, stats.pending_count, stats.failed_count
            ),
            serde_json::to_value(&stats).ok(),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("jobs stats", error_class, message, exit_code)
        }
    }
}

pub fn failed(limit: u32) -> CommandResult {
    let (config, runtime) = match prepare("jobs failed") {
        Ok(prepared) => prepared,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DATABASE))?;
        let store = Store::sqlite(pool.clone(), config.worker.queue_config());
        let jobs = store.jobs.list_by_status(JobStatus::Failed, limit.max(1)).await.map_err(queue_failure);
        pool.close().await;
        jobs
    });

    match result {
        Ok(jobs) => CommandResult::success_with_data(
            "jobs failed",
            format!("{} failed jobs", jobs.len()),
            Some(Value::Array(jobs.iter().map(summarize).collect())),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("jobs failed", error_class, message, exit_code)
        }
    }
}

pub fn replay(job_id: &str) -> CommandResult {
    let (config, runtime) = match prepare("jobs replay") {
        Ok(prepared) => prepared,
        Err(result) => return result,
    };

    let id = JobId(job_id.trim().to_owned());
    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DATABASE))?;
        let store = Store::sqlite(pool.clone(), config.worker.queue_config());
        let replayed = store.jobs.replay_failed(&id).await.map_err(queue_failure);
        pool.close().await;
        replayed
    });

    match result {
        Ok(job) => CommandResult::success_with_data(
            "jobs replay",
            format!("job {} returned to pending", job.id),
            Some(summarize(&job)),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("jobs replay", error_class, message, exit_code)
        }
    }
}

fn queue_failure(error: QueueError) -> Failure {
    match error {
        QueueError::NotFound(_) => ("not_found", error.to_string(), EXIT_NOT_FOUND),
        QueueError::Transition(_) | QueueError::Conflict(_) => {
            ("invalid_transition", error.to_string(), EXIT_INVALID_TRANSITION)
        }
        QueueError::Repository(_) => ("queue", error.to_string(), EXIT_QUEUE),
    }
}

fn summarize(job: &Job) -> Value {
    json!({
        "id": job.id.0,
        "idempotency_key": job.idempotency_key.0,
        "job_type": job.job_type.as_str(),
        "status": job.status.as_str(),
        "attempts": job.attempts,
        "max_attempts": job.max_attempts,
        "last_error": job.last_error,
        "created_at": job.created_at.to_rfc3339(),
        "completed_at": job.completed_at.map(|at| at.to_rfc3339()),
    })
}
