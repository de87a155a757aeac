//! Job handlers, one per job type the worker knows how to run.

use std::sync::Arc;

use async_trait::async_trait;
use carelink_agent::{TurnError, TurnPipeline};
use carelink_core::chrono::Utc;
use carelink_core::domain::context::{Channel, HydratedContext, Inbound};
use carelink_core::domain::job::{
    IdempotencyKey, InboundMessagePayload, Job, JobType, OutboundEmailPayload,
    OutboundMessagePayload, PaymentEventPayload,
};
use carelink_db::{QueueError, RepositoryError, Store};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::messaging::{MessagingError, MessagingProvider};

#[derive(Debug, Error)]
pub enum JobHandlerError {
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("no handler registered for job type `{0}`")]
    Unhandled(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Option<Value>, JobHandlerError>;
}

pub struct SendSmsHandler {
    provider: Arc<dyn MessagingProvider>,
}

impl SendSmsHandler {
    pub fn new(provider: Arc<dyn MessagingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for SendSmsHandler {
    async fn handle(&self, job: &Job) -> Result<Option<Value>, JobHandlerError> {
        let payload: OutboundMessagePayload = job.payload_as()?;
        let receipt = self.provider.send_sms(&payload.to, &payload.body).await?;
        Ok(Some(json!({
            "provider": receipt.provider,
            "provider_message_id": receipt.provider_message_id,
        })))
    }
}

pub struct SendEmailHandler {
    provider: Arc<dyn MessagingProvider>,
}

impl SendEmailHandler {
    pub fn new(provider: Arc<dyn MessagingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for SendEmailHandler {
    async fn handle(&self, job: &Job) -> Result<Option<Value>, JobHandlerError> {
        let payload: OutboundEmailPayload = job.payload_as()?;
        let receipt =
            self.provider.send_email(&payload.to, &payload.subject, &payload.body).await?;
        Ok(Some(json!({
            "provider": receipt.provider,
            "provider_message_id": receipt.provider_message_id,
        })))
    }
}

/// Runs a turn for an inbound text and queues the reply.
pub struct InboundMessageHandler {
    pipeline: Arc<TurnPipeline>,
    store: Store,
}

impl InboundMessageHandler {
    pub fn new(pipeline: Arc<TurnPipeline>, store: Store) -> Self {
        Self { pipeline, store }
    }
}

#[async_trait]
impl JobHandler for InboundMessageHandler {
    async fn handle(&self, job: &Job) -> Result<Option<Value>, JobHandlerError> {
        let payload: InboundMessagePayload = job.payload_as()?;
        let channel = Channel::parse(&payload.channel).unwrap_or(Channel::Sms);
        let input = Inbound::new(channel, payload.from.clone(), payload.body)
            .with_meta("messageSid", json!(payload.message_sid))
            .with_meta("jobId", json!(job.id.0));

        let result = self.pipeline.handle(input).await?;

        let reply = match result.outcome.chunks() {
            [] => result.outcome.user_message().unwrap_or_default().to_owned(),
            chunks => chunks.concat(),
        };
        let reply_job = if reply.trim().is_empty() {
            None
        } else {
            let outbound = OutboundMessagePayload {
                to: payload.from.clone(),
                body: reply,
                user_id: Some(payload.from),
            };
            Some(
                self.store
                    .jobs
                    .ensure_unique_job(
                        IdempotencyKey::derived("reply", &job.idempotency_key),
                        JobType::OutboundMessage,
                        serde_json::to_value(outbound)?,
                        None,
                    )
                    .await?,
            )
        };

        Ok(Some(json!({
            "trace_id": result.trace_id.0,
            "agent": result.agent.map(|agent| agent.as_str()),
            "outcome": result.outcome.kind(),
            "reply_job_id": reply_job.map(|id| id.0),
        })))
    }
}

/// Records the subscription state carried by a payment event on the user's
/// context.
pub struct PaymentEventHandler {
    store: Store,
}

impl PaymentEventHandler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for PaymentEventHandler {
    async fn handle(&self, job: &Job) -> Result<Option<Value>, JobHandlerError> {
        let payload: PaymentEventPayload = job.payload_as()?;
        let Some(user_id) = payload.user_id.as_deref().filter(|id| !id.trim().is_empty()) else {
            info!(
                event_name = "worker.payment_event_ignored",
                job_id = %job.id,
                event_id = %payload.event_id,
                "payment event carries no user id"
            );
            return Ok(Some(json!({ "ignored": true, "reason": "missing user id" })));
        };

        let mut context = self
            .store
            .contexts
            .load(user_id)
            .await?
            .unwrap_or_else(|| HydratedContext::fallback(user_id));
        let status = subscription_status(&payload.event_type, payload.status.as_deref());
        context.metadata.insert(
            "subscription".to_owned(),
            json!({
                "status": status,
                "event_type": payload.event_type,
                "event_id": payload.event_id,
                "updated_at": Utc::now().to_rfc3339(),
            }),
        );
        self.store.contexts.save(&context).await?;

        Ok(Some(json!({ "user_id": user_id, "status": status })))
    }
}

/// Maps a provider status onto the statuses the product understands.
/// Unknown or missing statuses count as active unless the subscription was
/// deleted.
pub fn subscription_status(event_type: &str, status: Option<&str>) -> &'static str {
    if event_type == "customer.subscription.deleted" {
        return "canceled";
    }
    match status.map(str::trim) {
        Some("trialing") => "trialing",
        Some("past_due") => "past_due",
        Some("canceled") => "canceled",
        Some("unpaid") => "unpaid",
        Some("paused") => "paused",
        _ => "active",
    }
}
