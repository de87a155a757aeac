use serde_json::{json, Value};

use carelink_core::domain::context::{AssessmentPointer, HydratedContext, Inbound};

use super::{AgentDeps, AgentError, FragmentSink};
use crate::capabilities::builtin::{ASSESSMENT_SCORE, INTERVENTIONS_SUGGEST};
use crate::capabilities::CapabilityRuntime;

pub const DEFAULT_DEFINITION: &str = "burnout_v1";

const GUIDANCE: &str = "Let's do a quick check-in. Rate each statement from 0 (never) to 5 \
(always) and send your answers when you're ready.";

pub(super) async fn run(
    _input: &Inbound,
    runtime: &mut CapabilityRuntime,
    _deps: &AgentDeps,
    sink: &mut dyn FragmentSink,
) -> Result<(), AgentError> {
    let answers = answers(runtime.context());
    if answers.is_empty() {
        return sink.emit(GUIDANCE.to_owned()).await;
    }

    let definition_id = runtime
        .context()
        .last_assessment
        .as_ref()
        .map_or_else(|| DEFAULT_DEFINITION.to_owned(), |pointer| pointer.definition_id.clone());

    let score = runtime
        .invoke(ASSESSMENT_SCORE, json!({ "definition_id": definition_id, "answers": answers }))
        .await?;
    let total = score.get("total").and_then(Value::as_f64).unwrap_or_default();
    let band = score.get("band").and_then(Value::as_str).unwrap_or("low").to_owned();
    let explanation = score.get("explanation").and_then(Value::as_str).unwrap_or_default();

    sink.emit(format!("Your score is {} ({band}). {explanation}", format_total(total))).await?;
    runtime.context_mut().last_assessment =
        Some(AssessmentPointer { definition_id, score: Some(total) });

    if band == "low" {
        return Ok(());
    }

    let zone = runtime.context().metadata_str("pressureZone").unwrap_or("general").to_owned();
    let suggestions = runtime.invoke(INTERVENTIONS_SUGGEST, json!({ "pressure_zone": zone })).await?;
    if let Some(fragment) = render_suggestions(&suggestions) {
        sink.emit(fragment).await?;
    }
    Ok(())
}

fn answers(context: &HydratedContext) -> Vec<f64> {
    context
        .metadata
        .get("assessmentAnswers")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

fn format_total(total: f64) -> String {
    if total.fract() == 0.0 {
        format!("{total:.0}")
    } else {
        format!("{total:.1}")
    }
}

fn render_suggestions(suggestions: &Value) -> Option<String> {
    let lines: Vec<String> = suggestions
        .as_array()?
        .iter()
        .filter_map(|item| {
            let title = item.get("title")?.as_str()?;
            let description = item.get("description")?.as_str()?;
            Some(format!("- {title}: {description}"))
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!("A few things that might help:\n{}", lines.join("\n")))
}
