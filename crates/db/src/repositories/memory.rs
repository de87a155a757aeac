use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use carelink_core::chrono::{DateTime, Utc};
use carelink_core::domain::context::HydratedContext;
use carelink_core::domain::job::{IdempotencyKey, Job, JobId, JobStatus, JobType};
use carelink_core::domain::message::{InboundRecord, OutboundMessage};
use carelink_core::domain::turn::{AgentRunRecord, GuardrailEvent};
use carelink_core::job_queue::JobQueueEngine;
use carelink_core::trace::TraceId;

use super::{
    ContextRepository, JobCounts, JobRepository, MessageRepository, RepositoryError,
    TurnLogRepository,
};

/// Jobs kept in insertion order; the index doubles as the tie-breaker for claims.
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<Vec<Job>>,
    engine: JobQueueEngine,
}

#[async_trait::async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert_if_absent(&self, job: Job) -> Result<Job, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.iter().find(|stored| stored.idempotency_key == job.idempotency_key)
        {
            return Ok(existing.clone());
        }
        jobs.push(job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().find(|job| &job.id == id).cloned())
    }

    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Job>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().find(|job| &job.idempotency_key == key).cloned())
    }

    async fn claim_next(
        &self,
        job_type: Option<JobType>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let Some(index) = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| JobQueueEngine::is_claimable(job, job_type, now))
            .min_by_key(|(index, job)| (job.next_attempt_at, *index))
            .map(|(index, _)| index)
        else {
            return Ok(None);
        };

        let claimed = self
            .engine
            .claim(jobs[index].clone(), now)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        jobs[index] = claimed.clone();
        Ok(Some(claimed))
    }

    async fn update_if_current(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_attempts: u32,
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        match jobs.iter_mut().find(|stored| stored.id == job.id) {
            Some(stored)
                if stored.status == expected_status && stored.attempts == expected_attempts =>
            {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<Job>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().filter(|job| job.status == status).take(limit as usize).cloned().collect())
    }

    async fn list_claimed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .iter()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.claimed_at.is_some_and(|claimed_at| claimed_at < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<JobCounts, RepositoryError> {
        let jobs = self.jobs.read().await;
        let mut grouped: BTreeMap<(&'static str, &'static str), (JobStatus, JobType, u64)> =
            BTreeMap::new();
        for job in jobs.iter() {
            grouped
                .entry((job.status.as_str(), job.job_type.as_str()))
                .or_insert((job.status, job.job_type, 0))
                .2 += 1;
        }

        Ok(JobCounts {
            by_status_and_type: grouped.into_values().collect(),
            oldest_pending_created_at: jobs
                .iter()
                .find(|job| job.status == JobStatus::Pending)
                .map(|job| job.created_at),
        })
    }
}

/// Context store with a switch that makes every call fail, for exercising
/// the pipeline's fallback path.
#[derive(Default)]
pub struct InMemoryContextRepository {
    contexts: RwLock<HashMap<String, HydratedContext>>,
    unavailable: AtomicBool,
}

impl InMemoryContextRepository {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("context store offline".to_owned()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContextRepository for InMemoryContextRepository {
    async fn load(&self, user_id: &str) -> Result<Option<HydratedContext>, RepositoryError> {
        self.check_available()?;
        let contexts = self.contexts.read().await;
        Ok(contexts.get(user_id).cloned())
    }

    async fn save(&self, context: &HydratedContext) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut contexts = self.contexts.write().await;
        contexts.insert(context.user_id.clone(), context.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    inbound: RwLock<Vec<InboundRecord>>,
    outbound: RwLock<Vec<OutboundMessage>>,
    unavailable: AtomicBool,
}

impl InMemoryMessageRepository {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn inbound(&self) -> Vec<InboundRecord> {
        self.inbound.read().await.clone()
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("message store offline".to_owned()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn save_inbound(&self, record: InboundRecord) -> Result<(), RepositoryError> {
        self.check_available()?;
        self.inbound.write().await.push(record);
        Ok(())
    }

    async fn save_outbound(&self, message: OutboundMessage) -> Result<(), RepositoryError> {
        self.check_available()?;
        self.outbound.write().await.push(message);
        Ok(())
    }

    async fn list_outbound(
        &self,
        trace_id: &TraceId,
    ) -> Result<Vec<OutboundMessage>, RepositoryError> {
        self.check_available()?;
        let outbound = self.outbound.read().await;
        let mut messages: Vec<OutboundMessage> =
            outbound.iter().filter(|message| &message.trace_id == trace_id).cloned().collect();
        messages.sort_by_key(|message| message.sequence);
        Ok(messages)
    }
}

#[derive(Default)]
pub struct InMemoryTurnLogRepository {
    runs: RwLock<Vec<AgentRunRecord>>,
    guardrails: RwLock<Vec<GuardrailEvent>>,
}

#[async_trait::async_trait]
impl TurnLogRepository for InMemoryTurnLogRepository {
    async fn log_agent_run(&self, record: AgentRunRecord) -> Result<(), RepositoryError> {
        self.runs.write().await.push(record);
        Ok(())
    }

    async fn log_guardrail(&self, event: GuardrailEvent) -> Result<(), RepositoryError> {
        self.guardrails.write().await.push(event);
        Ok(())
    }

    async fn list_agent_runs(
        &self,
        user_id: &str,
    ) -> Result<Vec<AgentRunRecord>, RepositoryError> {
        let runs = self.runs.read().await;
        Ok(runs.iter().filter(|run| run.user_id == user_id).cloned().collect())
    }

    async fn list_guardrails(
        &self,
        user_id: &str,
    ) -> Result<Vec<GuardrailEvent>, RepositoryError> {
        let guardrails = self.guardrails.read().await;
        Ok(guardrails.iter().filter(|event| event.user_id == user_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use carelink_core::chrono::Duration;
    use carelink_core::domain::context::HydratedContext;
    use carelink_core::domain::job::{IdempotencyKey, JobStatus, JobType};
    use carelink_core::job_queue::{now_millis, JobQueueEngine};
    use serde_json::json;

    use super::{InMemoryContextRepository, InMemoryJobRepository};
    use crate::repositories::{ContextRepository, JobRepository, RepositoryError};

    #[tokio::test]
    async fn in_memory_claims_follow_due_time_then_insertion_order() {
        let repo = InMemoryJobRepository::default();
        let engine = JobQueueEngine::new();
        let now = now_millis();

        let mut late = engine.new_job(
            IdempotencyKey::new("late"),
            JobType::OutboundMessage,
            json!({}),
            None,
            now,
        );
        late.next_attempt_at = now - Duration::seconds(1);
        let early = engine.new_job(
            IdempotencyKey::new("early"),
            JobType::OutboundMessage,
            json!({}),
            None,
            now - Duration::seconds(5),
        );
        let tie = engine.new_job(
            IdempotencyKey::new("tie"),
            JobType::OutboundMessage,
            json!({}),
            None,
            now - Duration::seconds(5),
        );
        for job in [late.clone(), early.clone(), tie.clone()] {
            repo.insert_if_absent(job).await.expect("insert");
        }

        let order: Vec<String> = [
            repo.claim_next(None, now).await.expect("claim"),
            repo.claim_next(None, now).await.expect("claim"),
            repo.claim_next(None, now).await.expect("claim"),
        ]
        .into_iter()
        .map(|job| job.expect("job due").idempotency_key.0)
        .collect();

        assert_eq!(order, vec!["early", "tie", "late"]);
        assert!(repo.claim_next(None, now).await.expect("claim").is_none());

        let counts = repo.counts().await.expect("counts");
        assert_eq!(
            counts.by_status_and_type,
            vec![(JobStatus::Processing, JobType::OutboundMessage, 3)]
        );
        assert_eq!(counts.oldest_pending_created_at, None);
    }

    #[tokio::test]
    async fn unavailable_context_store_reports_errors() {
        let repo = InMemoryContextRepository::default();
        repo.save(&HydratedContext::fallback("user-1")).await.expect("save");

        repo.set_unavailable(true);
        let error = repo.load("user-1").await.expect_err("store offline");
        assert!(matches!(error, RepositoryError::Unavailable(_)));

        repo.set_unavailable(false);
        assert!(repo.load("user-1").await.expect("load").is_some());
    }
}
