use std::sync::Arc;

use carelink_core::job_queue::JobQueueConfig;

use crate::queue::JobQueue;
use crate::repositories::{
    ContextRepository, InMemoryContextRepository, InMemoryJobRepository,
    InMemoryMessageRepository, InMemoryTurnLogRepository, MessageRepository,
    SqlContextRepository, SqlJobRepository, SqlMessageRepository, SqlTurnLogRepository,
    TurnLogRepository,
};
use crate::DbPool;

/// Every persistence seam a turn or a worker needs, behind trait objects.
#[derive(Clone)]
pub struct Store {
    pub contexts: Arc<dyn ContextRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub turn_logs: Arc<dyn TurnLogRepository>,
    pub jobs: JobQueue,
}

impl Store {
    pub fn sqlite(pool: DbPool, queue_config: JobQueueConfig) -> Self {
        Self {
            contexts: Arc::new(SqlContextRepository::new(pool.clone())),
            messages: Arc::new(SqlMessageRepository::new(pool.clone())),
            turn_logs: Arc::new(SqlTurnLogRepository::new(pool.clone())),
            jobs: JobQueue::new(Arc::new(SqlJobRepository::new(pool)), queue_config),
        }
    }

    pub fn in_memory(queue_config: JobQueueConfig) -> Self {
        InMemoryStore::new(queue_config).store()
    }
}

/// In-memory store that keeps concrete handles so tests can inspect state
/// or take a repository offline.
#[derive(Clone)]
pub struct InMemoryStore {
    pub contexts: Arc<InMemoryContextRepository>,
    pub messages: Arc<InMemoryMessageRepository>,
    pub turn_logs: Arc<InMemoryTurnLogRepository>,
    pub jobs: Arc<InMemoryJobRepository>,
    queue_config: JobQueueConfig,
}

impl InMemoryStore {
    pub fn new(queue_config: JobQueueConfig) -> Self {
        Self {
            contexts: Arc::new(InMemoryContextRepository::default()),
            messages: Arc::new(InMemoryMessageRepository::default()),
            turn_logs: Arc::new(InMemoryTurnLogRepository::default()),
            jobs: Arc::new(InMemoryJobRepository::default()),
            queue_config,
        }
    }

    pub fn store(&self) -> Store {
        Store {
            contexts: self.contexts.clone(),
            messages: self.messages.clone(),
            turn_logs: self.turn_logs.clone(),
            jobs: JobQueue::new(self.jobs.clone(), self.queue_config.clone()),
        }
    }
}
