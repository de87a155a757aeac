use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trace::{TraceId, TraceStep};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub input_units: u32,
    pub output_units: u32,
    pub tool_calls: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    ResourceLimit,
    Cancelled,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ResourceLimit => "resource_limit",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "completed" => Some(Self::Completed),
            "resource_limit" => Some(Self::ResourceLimit),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRunRecord {
    pub id: String,
    pub agent: String,
    pub user_id: String,
    pub policy_bundle: String,
    pub usage: UsageCounters,
    pub trace_id: TraceId,
    pub latency_ms: u64,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub trace: Vec<TraceStep>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailPhase {
    Pre,
    Post,
}

impl GuardrailPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pre" => Some(Self::Pre),
            "post" => Some(Self::Post),
            _ => None,
        }
    }
}

/// Audit record written whenever a policy check disallows a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailEvent {
    pub id: String,
    pub rule_id: String,
    pub action: String,
    pub phase: GuardrailPhase,
    pub message: Option<String>,
    pub trace_id: TraceId,
    pub user_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{GuardrailPhase, RunOutcome};

    #[test]
    fn run_outcome_round_trips_from_storage_encoding() {
        for outcome in [
            RunOutcome::Completed,
            RunOutcome::ResourceLimit,
            RunOutcome::Cancelled,
            RunOutcome::Failed,
        ] {
            assert_eq!(RunOutcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(GuardrailPhase::parse("POST"), Some(GuardrailPhase::Post));
        assert_eq!(GuardrailPhase::parse("mid"), None);
    }
}
