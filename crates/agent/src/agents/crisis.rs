use serde_json::json;
use tracing::warn;

use carelink_core::domain::context::Inbound;

use super::{stream_model, AgentDeps, AgentError, FragmentSink};
use crate::capabilities::builtin::CRISIS_ESCALATE;
use crate::capabilities::{CapabilityError, CapabilityRuntime};
use crate::llm::StreamRequest;

pub const SAFETY_FRAGMENT: &str = "I'm really glad you told me. If you are in immediate danger, \
call 911. You can call or text 988 (Suicide & Crisis Lifeline) any time, or text HOME to 741741. ";

const CRISIS_INSTRUCTION: &str = "The user may be in crisis. Stay calm and present, keep sentences \
short, do not problem-solve, and encourage them to reach the resources already shared.";

pub(super) async fn run(
    input: &Inbound,
    runtime: &mut CapabilityRuntime,
    deps: &AgentDeps,
    sink: &mut dyn FragmentSink,
) -> Result<(), AgentError> {
    sink.emit(SAFETY_FRAGMENT.to_owned()).await?;

    match runtime.invoke(CRISIS_ESCALATE, json!({ "summary": summary(&input.text) })).await {
        Ok(_) => {}
        Err(error @ CapabilityError::BudgetExceeded { .. }) => return Err(error.into()),
        Err(error) => {
            warn!(
                event_name = "agent.crisis.escalation_skipped",
                trace_id = %runtime.trace().id(),
                user_id = %runtime.context().user_id,
                error = %error,
                "emergency contact not notified"
            );
        }
    }

    let context = runtime.context();
    let request = StreamRequest {
        system_prompt: format!("{}\n\n{}", deps.policy.tone(context), CRISIS_INSTRUCTION),
        user_prompt: input.text.clone(),
        max_output_units: runtime.budget().max_output_units,
        tools: Vec::new(),
    };
    stream_model(deps, request, sink).await
}

fn summary(text: &str) -> String {
    const MAX_CHARS: usize = 160;
    let mut summary: String = text.chars().take(MAX_CHARS).collect();
    if text.chars().count() > MAX_CHARS {
        summary.push_str("...");
    }
    if summary.trim().is_empty() {
        summary = "Crisis language detected.".to_owned();
    }
    summary
}
