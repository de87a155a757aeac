use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(format!("job-{}", uuid::Uuid::new_v4()))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied key that makes an enqueue safe to repeat. Two enqueues with
/// the same key always resolve to the same job.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Key for an event delivered by an external provider, e.g. `twilio:SM123`.
    pub fn provider_event(provider: &str, event_id: &str) -> Self {
        Self(format!("{}:{}", provider.trim(), event_id.trim()))
    }

    pub fn twilio(message_sid: &str) -> Self {
        Self::provider_event("twilio", message_sid)
    }

    pub fn stripe(event_id: &str) -> Self {
        Self::provider_event("stripe", event_id)
    }

    /// Key for work the system originates on behalf of a user at a point in time.
    pub fn user_scoped(kind: &str, user_id: &str, at: DateTime<Utc>) -> Self {
        Self(format!("{kind}:{user_id}:{}", at.timestamp_millis()))
    }

    /// Key for a follow-up job derived from an earlier one.
    pub fn derived(prefix: &str, parent: &IdempotencyKey) -> Self {
        Self(format!("{prefix}:{}", parent.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    #[serde(rename = "send_sms")]
    OutboundMessage,
    #[serde(rename = "send_email")]
    OutboundEmail,
    #[serde(rename = "process_inbound_sms")]
    InboundMessageProcessing,
    #[serde(rename = "process_stripe_webhook")]
    PaymentEventProcessing,
    RunAgent,
    GenerateSummary,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::OutboundMessage,
        JobType::OutboundEmail,
        JobType::InboundMessageProcessing,
        JobType::PaymentEventProcessing,
        JobType::RunAgent,
        JobType::GenerateSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutboundMessage => "send_sms",
            Self::OutboundEmail => "send_email",
            Self::InboundMessageProcessing => "process_inbound_sms",
            Self::PaymentEventProcessing => "process_stripe_webhook",
            Self::RunAgent => "run_agent",
            Self::GenerateSummary => "generate_summary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "send_sms" => Some(Self::OutboundMessage),
            "send_email" => Some(Self::OutboundEmail),
            "process_inbound_sms" => Some(Self::InboundMessageProcessing),
            "process_stripe_webhook" => Some(Self::PaymentEventProcessing),
            "run_agent" => Some(Self::RunAgent),
            "generate_summary" => Some(Self::GenerateSummary),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] =
        [JobStatus::Pending, JobStatus::Processing, JobStatus::Completed, JobStatus::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub idempotency_key: IdempotencyKey,
    pub job_type: JobType,
    pub payload: Value,
    pub payload_hash: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Deserializes the payload into the typed contract for this job type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub pending_count: u64,
    pub failed_count: u64,
    pub oldest_pending_age_seconds: Option<i64>,
}

impl JobStats {
    pub fn count_for(&self, status: JobStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessagePayload {
    pub to: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmailPayload {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessagePayload {
    pub from: String,
    pub body: String,
    pub message_sid: String,
    #[serde(default = "default_inbound_channel")]
    pub channel: String,
}

fn default_inbound_channel() -> String {
    "sms".to_owned()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEventPayload {
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}
