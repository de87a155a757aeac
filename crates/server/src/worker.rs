//! Outbox worker: claims jobs, dispatches them by type and records the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use carelink_core::config::WorkerConfig;
use carelink_core::domain::job::{Job, JobType};
use carelink_core::job_queue::FailOutcome;
use carelink_db::{QueueError, Store};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::handlers::{JobHandler, JobHandlerError};

#[derive(Clone, Default)]
pub struct JobDispatcher {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    async fn dispatch(&self, job: &Job) -> Result<Option<serde_json::Value>, JobHandlerError> {
        match self.handlers.get(&job.job_type) {
            Some(handler) => handler.handle(job).await,
            None => Err(JobHandlerError::Unhandled(job.job_type.as_str().to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: usize,
    pub failed: usize,
}

impl WorkerReport {
    pub fn is_idle(&self) -> bool {
        self.processed == 0 && self.failed == 0
    }
}

pub struct JobWorker {
    store: Store,
    dispatcher: JobDispatcher,
    batch_size: u32,
    poll_interval: Duration,
    only: Option<JobType>,
}

impl JobWorker {
    pub fn new(store: Store, dispatcher: JobDispatcher, config: &WorkerConfig) -> Self {
        Self {
            store,
            dispatcher,
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            only: None,
        }
    }

    /// Restricts claims to one job type.
    pub fn only(mut self, job_type: JobType) -> Self {
        self.only = Some(job_type);
        self
    }

    /// Claims and runs up to one batch of due jobs. A handler error fails the
    /// job (with backoff or permanently) and never aborts the batch. Only a
    /// claim failure ends the batch early.
    pub async fn run_batch(&self) -> Result<WorkerReport, QueueError> {
        let mut report = WorkerReport::default();

        for _ in 0..self.batch_size {
            let Some(job) = self.store.jobs.claim_next_job(self.only).await? else {
                break;
            };

            match self.dispatcher.dispatch(&job).await {
                Ok(result) => match self
                    .store
                    .jobs
                    .complete_job(&job.id, job.attempts, result)
                    .await
                {
                    Ok(_) => report.processed += 1,
                    Err(error) => {
                        bookkeeping_failed(&job, "complete", &error);
                        report.failed += 1;
                    }
                },
                Err(handler_error) => {
                    let message = handler_error.to_string();
                    match self
                        .store
                        .jobs
                        .fail_job(&job.id, &message, job.attempts, job.max_attempts)
                        .await
                    {
                        Ok(FailOutcome::Exhausted) => error!(
                            event_name = "worker.job_exhausted",
                            job_id = %job.id,
                            job_type = job.job_type.as_str(),
                            error = %message,
                            "job exhausted its attempts"
                        ),
                        Ok(FailOutcome::Retry { .. }) => {}
                        Err(error) => bookkeeping_failed(&job, "fail", &error),
                    }
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Polls until `shutdown` flips to true. Each tick releases stale claims
    /// and then runs one batch.
    pub async fn run_until_shutdown(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            event_name = "worker.started",
            batch_size = self.batch_size,
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "outbox worker started"
        );

        while !*shutdown.borrow() {
            match self.store.jobs.requeue_stale().await {
                Ok(0) => {}
                Ok(released) => info!(event_name = "worker.stale_released", released, "stale claims released"),
                Err(error) => warn!(event_name = "worker.stale_sweep_failed", error = %error, "stale sweep failed"),
            }

            match self.run_batch().await {
                Ok(report) if report.is_idle() => {}
                Ok(report) => info!(
                    event_name = "worker.batch_finished",
                    processed = report.processed,
                    failed = report.failed,
                    "worker batch finished"
                ),
                Err(error) => warn!(event_name = "worker.batch_aborted", error = %error, "worker batch aborted"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(event_name = "worker.stopped", "outbox worker stopped");
    }
}

fn bookkeeping_failed(job: &Job, step: &'static str, error: &QueueError) {
    warn!(
        event_name = "worker.bookkeeping_failed",
        job_id = %job.id,
        idempotency_key = %job.idempotency_key,
        step,
        error = %error,
        "could not record job outcome; the stale sweep will release the claim"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use carelink_core::config::WorkerConfig;
    use carelink_core::domain::job::{IdempotencyKey, Job, JobStatus, JobType};
    use carelink_core::job_queue::JobQueueConfig;
    use carelink_db::Store;
    use serde_json::{json, Value};
    use tokio::sync::watch;

    use super::{JobDispatcher, JobWorker, WorkerReport};
    use crate::handlers::{JobHandler, JobHandlerError, SendSmsHandler};
    use crate::messaging::{LogOnlyMessagingProvider, MessagingError};

    struct AlwaysFails;

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn handle(&self, _job: &Job) -> Result<Option<Value>, JobHandlerError> {
            Err(JobHandlerError::Messaging(MessagingError::Transport("connection reset".to_string())))
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            enabled: true,
            batch_size: 10,
            poll_interval_ms: 10,
            default_max_attempts: 3,
            processing_timeout_secs: 900,
        }
    }

    async fn enqueue(store: &Store, key: &str, job_type: JobType, max_attempts: Option<u32>) {
        store
            .jobs
            .ensure_unique_job(
                IdempotencyKey::new(key),
                job_type,
                json!({ "to": "+15550100", "body": "hello" }),
                max_attempts,
            )
            .await
            .expect("enqueue");
    }

    #[tokio::test]
    async fn batch_completes_jobs_with_handler_results() {
        let store = Store::in_memory(JobQueueConfig::default());
        let provider = Arc::new(LogOnlyMessagingProvider::default());
        let dispatcher = JobDispatcher::new()
            .register(JobType::OutboundMessage, Arc::new(SendSmsHandler::new(provider.clone())));
        let worker = JobWorker::new(store.clone(), dispatcher, &worker_config());
        enqueue(&store, "reply:twilio:SM1", JobType::OutboundMessage, None).await;
        enqueue(&store, "reply:twilio:SM1", JobType::OutboundMessage, None).await;

        let report = worker.run_batch().await.expect("batch");

        assert_eq!(report, WorkerReport { processed: 1, failed: 0 });
        assert_eq!(provider.sent().len(), 1);
        let job = store
            .jobs
            .find_by_key(&IdempotencyKey::new("reply:twilio:SM1"))
            .await
            .expect("find")
            .expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.as_ref().map(|value| value["provider"].clone()), Some(json!("log")));
    }

    #[tokio::test]
    async fn failing_handler_exhausts_single_attempt_job() {
        let store = Store::in_memory(JobQueueConfig::default());
        let dispatcher =
            JobDispatcher::new().register(JobType::OutboundMessage, Arc::new(AlwaysFails));
        let worker = JobWorker::new(store.clone(), dispatcher, &worker_config());
        enqueue(&store, "reply:twilio:SM2", JobType::OutboundMessage, Some(1)).await;

        let report = worker.run_batch().await.expect("batch");

        assert_eq!(report, WorkerReport { processed: 0, failed: 1 });
        let failed = store.jobs.list_by_status(JobStatus::Failed, 10).await.expect("list");
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().is_some_and(|error| error.contains("connection reset")));
    }

    #[tokio::test]
    async fn failing_handler_schedules_retry_when_attempts_remain() {
        let store = Store::in_memory(JobQueueConfig::default());
        let dispatcher =
            JobDispatcher::new().register(JobType::OutboundMessage, Arc::new(AlwaysFails));
        let worker = JobWorker::new(store.clone(), dispatcher, &worker_config());
        enqueue(&store, "reply:twilio:SM3", JobType::OutboundMessage, None).await;

        worker.run_batch().await.expect("batch");

        let pending = store.jobs.list_by_status(JobStatus::Pending, 10).await.expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(worker.run_batch().await.expect("second batch").is_idle());
    }

    #[tokio::test]
    async fn unregistered_job_type_fails_instead_of_stalling() {
        let store = Store::in_memory(JobQueueConfig::default());
        let worker = JobWorker::new(store.clone(), JobDispatcher::new(), &worker_config());
        enqueue(&store, "summary:u1", JobType::GenerateSummary, Some(1)).await;

        let report = worker.run_batch().await.expect("batch");

        assert_eq!(report.failed, 1);
        let failed = store.jobs.list_by_status(JobStatus::Failed, 10).await.expect("list");
        assert!(failed[0].last_error.as_deref().is_some_and(|error| error.contains("generate_summary")));
    }

    #[tokio::test]
    async fn type_filter_leaves_other_jobs_pending() {
        let store = Store::in_memory(JobQueueConfig::default());
        let provider = Arc::new(LogOnlyMessagingProvider::default());
        let dispatcher = JobDispatcher::new()
            .register(JobType::OutboundMessage, Arc::new(SendSmsHandler::new(provider)));
        let worker = JobWorker::new(store.clone(), dispatcher, &worker_config())
            .only(JobType::OutboundMessage);
        enqueue(&store, "summary:u1", JobType::GenerateSummary, None).await;
        enqueue(&store, "reply:twilio:SM4", JobType::OutboundMessage, None).await;

        let report = worker.run_batch().await.expect("batch");

        assert_eq!(report, WorkerReport { processed: 1, failed: 0 });
        let pending = store.jobs.list_by_status(JobStatus::Pending, 10).await.expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_type, JobType::GenerateSummary);
    }

    #[tokio::test]
    async fn worker_stops_when_shutdown_is_signalled() {
        let store = Store::in_memory(JobQueueConfig::default());
        let worker = JobWorker::new(store, JobDispatcher::new(), &worker_config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run_until_shutdown(shutdown_rx).await });
        shutdown_tx.send_replace(true);

        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("worker stopped in time")
            .expect("worker task");
    }
}
