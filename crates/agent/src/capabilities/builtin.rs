use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use carelink_core::chrono::{Duration, Utc};
use carelink_core::domain::job::{IdempotencyKey, JobType, OutboundMessagePayload};

use super::registry::{Capability, CapabilityContext, CapabilityHandler, CapabilityRegistry, Hint};
use super::schema::{FieldKind, InputSchema};

pub const ASSESSMENT_SCORE: &str = "assessment.score";
pub const INTERVENTIONS_SUGGEST: &str = "interventions.suggest";
pub const CHECKIN_SCHEDULE: &str = "checkin.schedule";
pub const CRISIS_ESCALATE: &str = "crisis.escalate";

const MAX_ANSWER: f64 = 5.0;
const DEFAULT_CHECKIN_DELAY_MINUTES: i64 = 24 * 60;

/// The capabilities every deployment ships with.
pub fn default_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    let builtins = [
        Capability::new(
            ASSESSMENT_SCORE,
            "Score a completed caregiver assessment and band the result.",
            AssessmentScore,
        )
        .with_schema(
            InputSchema::new()
                .required("definition_id", FieldKind::String, "assessment definition id")
                .required_non_empty(
                    "answers",
                    FieldKind::Array(Box::new(FieldKind::Number)),
                    "one answer per item on a 0-5 scale",
                ),
        ),
        Capability::new(
            INTERVENTIONS_SUGGEST,
            "Suggest supportive interventions for a pressure zone.",
            InterventionsSuggest,
        )
        .with_schema(InputSchema::new().required(
            "pressure_zone",
            FieldKind::String,
            "zone such as emotional_wellbeing or financial_concerns",
        )),
        Capability::new(
            CHECKIN_SCHEDULE,
            "Schedule a follow-up check-in text message.",
            CheckinSchedule,
        )
        .with_hints(Hint::Low, Hint::Medium)
        .with_schema(
            InputSchema::new()
                .required_non_empty("message", FieldKind::String, "text to send")
                .optional("delay_minutes", FieldKind::Integer, "minutes from now, default 1440"),
        ),
        Capability::new(
            CRISIS_ESCALATE,
            "Notify the user's emergency contact.",
            CrisisEscalate,
        )
        .with_hints(Hint::Medium, Hint::Medium)
        .requiring_consent()
        .with_schema(InputSchema::new().required_non_empty(
            "summary",
            FieldKind::String,
            "short description of the situation",
        )),
    ];

    for capability in builtins {
        if let Err(error) = registry.register(capability) {
            warn!(
                event_name = "capabilities.builtin_skipped",
                error = %error,
                "built-in capability not registered"
            );
        }
    }
    registry
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBand {
    Low,
    Moderate,
    High,
}

impl ScoreBand {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 0.35 {
            Self::Low
        } else if ratio < 0.70 {
            Self::Moderate
        } else {
            Self::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
        }
    }

    fn explanation(&self) -> &'static str {
        match self {
            Self::Low => "Your answers suggest you are managing well right now.",
            Self::Moderate => {
                "Your answers suggest real strain. Small, regular breaks can make a difference."
            }
            Self::High => {
                "Your answers suggest you are carrying a heavy load. You deserve support too."
            }
        }
    }
}

#[derive(Deserialize)]
struct ScoreInput {
    definition_id: String,
    answers: Vec<f64>,
}

struct AssessmentScore;

#[async_trait]
impl CapabilityHandler for AssessmentScore {
    async fn call(&self, input: Value, _ctx: CapabilityContext<'_>) -> anyhow::Result<Value> {
        let input: ScoreInput = serde_json::from_value(input)?;
        if let Some(bad) = input.answers.iter().find(|answer| !(0.0..=MAX_ANSWER).contains(*answer)) {
            anyhow::bail!("answer {bad} is outside the 0-5 scale");
        }

        let total: f64 = input.answers.iter().sum();
        let max = MAX_ANSWER * input.answers.len() as f64;
        let band = if max > 0.0 { ScoreBand::from_ratio(total / max) } else { ScoreBand::Low };

        Ok(json!({
            "definition_id": input.definition_id,
            "total": total,
            "max": max,
            "band": band.as_str(),
            "explanation": band.explanation(),
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Intervention {
    pub title: &'static str,
    pub description: &'static str,
}

const fn intervention(title: &'static str, description: &'static str) -> Intervention {
    Intervention { title, description }
}

const EMOTIONAL: &[Intervention] = &[
    intervention("Name the feeling", "Write down one feeling and what triggered it today."),
    intervention("Caregiver support group", "Join a peer group that meets weekly online."),
];
const PHYSICAL: &[Intervention] = &[
    intervention("Protect your sleep", "Pick a fixed wind-down time and keep screens away."),
    intervention("Ten-minute walk", "A short walk outside resets energy and mood."),
];
const SOCIAL: &[Intervention] = &[
    intervention("Ask for one thing", "Ask a friend or relative for one specific, small task."),
    intervention("Respite care", "Look into local respite services for a few hours off."),
];
const FINANCIAL: &[Intervention] = &[
    intervention("Benefits check", "Review caregiver benefits and tax credits you may qualify for."),
    intervention("Bill triage", "List fixed costs and call providers about hardship plans."),
];
const TIME: &[Intervention] = &[
    intervention("Shared calendar", "Put care tasks in one calendar others can see."),
    intervention("Drop one task", "Choose one weekly task to delegate or stop doing."),
];
const GENERAL: &[Intervention] = &[
    intervention("Breathing break", "Try four slow breaths: in for four, out for six."),
    intervention("One kind thing", "Do one small thing today that is just for you."),
];

pub fn interventions_for(zone: &str) -> &'static [Intervention] {
    match zone {
        "emotional_wellbeing" | "emotional" => EMOTIONAL,
        "physical_health" | "physical" | "sleep" => PHYSICAL,
        "social_support" | "social" => SOCIAL,
        "financial_concerns" | "financial" => FINANCIAL,
        "time_management" => TIME,
        _ => GENERAL,
    }
}

struct InterventionsSuggest;

#[async_trait]
impl CapabilityHandler for InterventionsSuggest {
    async fn call(&self, input: Value, _ctx: CapabilityContext<'_>) -> anyhow::Result<Value> {
        let zone = input.get("pressure_zone").and_then(Value::as_str).unwrap_or("general");
        Ok(serde_json::to_value(interventions_for(zone.trim()))?)
    }
}

#[derive(Deserialize)]
struct CheckinInput {
    message: String,
    #[serde(default)]
    delay_minutes: Option<i64>,
}

struct CheckinSchedule;

#[async_trait]
impl CapabilityHandler for CheckinSchedule {
    async fn call(&self, input: Value, ctx: CapabilityContext<'_>) -> anyhow::Result<Value> {
        let input: CheckinInput = serde_json::from_value(input)?;
        let delay = input.delay_minutes.unwrap_or(DEFAULT_CHECKIN_DELAY_MINUTES).max(0);
        let run_at = Utc::now() + Duration::minutes(delay);
        let to = ctx.context.metadata_str("phoneNumber").unwrap_or(ctx.user_id);

        let key = IdempotencyKey::new(format!(
            "checkin:{}:{}",
            ctx.user_id,
            run_at.format("%Y-%m-%d")
        ));
        let payload = OutboundMessagePayload {
            to: to.to_owned(),
            body: input.message,
            user_id: Some(ctx.user_id.to_owned()),
        };
        let job_id = ctx
            .store
            .jobs
            .schedule_unique_job(key, JobType::OutboundMessage, serde_json::to_value(payload)?, None, run_at)
            .await?;

        Ok(json!({ "job_id": job_id.0, "run_at": run_at.to_rfc3339() }))
    }
}

struct CrisisEscalate;

#[async_trait]
impl CapabilityHandler for CrisisEscalate {
    async fn call(&self, input: Value, ctx: CapabilityContext<'_>) -> anyhow::Result<Value> {
        let summary = input.get("summary").and_then(Value::as_str).unwrap_or_default();
        let Some(contact) = ctx.context.metadata_str("emergencyContact") else {
            anyhow::bail!("no emergency contact on file");
        };

        let key = IdempotencyKey::new(format!("crisis:{}:{}", ctx.user_id, ctx.trace.id()));
        let payload = OutboundMessagePayload {
            to: contact.to_owned(),
            body: format!("CareLink alert: someone you support may need you now. {summary}"),
            user_id: Some(ctx.user_id.to_owned()),
        };
        let job_id = ctx
            .store
            .jobs
            .ensure_unique_job(key, JobType::OutboundMessage, serde_json::to_value(payload)?, None)
            .await?;

        Ok(json!({ "job_id": job_id.0, "notified": contact }))
    }
}
