pub use chrono;

pub mod budget;
pub mod config;
pub mod domain;
pub mod errors;
pub mod job_queue;
pub mod trace;
pub mod webhook_signature;

pub use budget::{estimate_units, Budget, BudgetTable};
pub use domain::context::{
    AssessmentPointer, Channel, ConsentFlags, CrisisFlags, HydratedContext, Inbound, PromptEntry,
};
pub use domain::job::{
    IdempotencyKey, InboundMessagePayload, Job, JobId, JobStats, JobStatus, JobType,
    OutboundEmailPayload, OutboundMessagePayload, PaymentEventPayload,
};
pub use domain::message::{InboundRecord, MessageId, OutboundMessage};
pub use domain::turn::{AgentRunRecord, GuardrailEvent, GuardrailPhase, RunOutcome, UsageCounters};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use job_queue::{Completion, FailOutcome, JobQueueConfig, JobQueueEngine, JobQueueError};
pub use trace::{Trace, TraceId, TraceStep};
