use async_trait::async_trait;
use thiserror::Error;

use carelink_core::chrono::{DateTime, Utc};
use carelink_core::domain::context::HydratedContext;
use carelink_core::domain::job::{IdempotencyKey, Job, JobId, JobStatus, JobType};
use carelink_core::domain::message::{InboundRecord, OutboundMessage};
use carelink_core::domain::turn::{AgentRunRecord, GuardrailEvent};
use carelink_core::trace::TraceId;

mod decode;

pub mod context;
pub mod job;
pub mod memory;
pub mod message;
pub mod turn_log;

pub use context::SqlContextRepository;
pub use job::SqlJobRepository;
pub use memory::{
    InMemoryContextRepository, InMemoryJobRepository, InMemoryMessageRepository,
    InMemoryTurnLogRepository,
};
pub use message::SqlMessageRepository;
pub use turn_log::SqlTurnLogRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Raw counts the queue service folds into `JobStats`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub by_status_and_type: Vec<(JobStatus, JobType, u64)>,
    pub oldest_pending_created_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Stores `job` unless a job with the same idempotency key exists, and
    /// returns whichever job now owns the key.
    async fn insert_if_absent(&self, job: Job) -> Result<Job, RepositoryError>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepositoryError>;

    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Job>, RepositoryError>;

    /// Atomically moves the earliest due pending job to processing. Two
    /// concurrent callers never receive the same job.
    async fn claim_next(
        &self,
        job_type: Option<JobType>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError>;

    /// Writes `job` only if the stored row still has `expected_status` and
    /// `expected_attempts`. Every claim bumps the attempt count, so the pair
    /// identifies one claim. Returns false when another writer got there first.
    async fn update_if_current(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_attempts: u32,
    ) -> Result<bool, RepositoryError>;

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<Job>, RepositoryError>;

    async fn list_claimed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, RepositoryError>;

    async fn counts(&self) -> Result<JobCounts, RepositoryError>;
}

#[async_trait]
pub trait ContextRepository: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<HydratedContext>, RepositoryError>;
    async fn save(&self, context: &HydratedContext) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn save_inbound(&self, record: InboundRecord) -> Result<(), RepositoryError>;
    async fn save_outbound(&self, message: OutboundMessage) -> Result<(), RepositoryError>;
    async fn list_outbound(
        &self,
        trace_id: &TraceId,
    ) -> Result<Vec<OutboundMessage>, RepositoryError>;
}

#[async_trait]
pub trait TurnLogRepository: Send + Sync {
    async fn log_agent_run(&self, record: AgentRunRecord) -> Result<(), RepositoryError>;
    async fn log_guardrail(&self, event: GuardrailEvent) -> Result<(), RepositoryError>;
    async fn list_agent_runs(&self, user_id: &str)
        -> Result<Vec<AgentRunRecord>, RepositoryError>;
    async fn list_guardrails(&self, user_id: &str)
        -> Result<Vec<GuardrailEvent>, RepositoryError>;
}
