use carelink_core::domain::context::{HydratedContext, Inbound, PromptEntry};

use super::{stream_model, tool_list, AgentDeps, AgentError, FragmentSink};
use crate::capabilities::CapabilityRuntime;
use crate::llm::StreamRequest;

const HISTORY_IN_PROMPT: usize = 5;
const HISTORY_RETAINED: usize = 20;

pub(super) async fn run(
    input: &Inbound,
    runtime: &mut CapabilityRuntime,
    deps: &AgentDeps,
    sink: &mut dyn FragmentSink,
) -> Result<(), AgentError> {
    let request = StreamRequest {
        system_prompt: system_prompt(deps, runtime.context()),
        user_prompt: user_prompt(runtime.context(), &input.text),
        max_output_units: runtime.budget().max_output_units,
        tools: deps.tools.clone(),
    };

    remember(runtime.context_mut(), &input.text);
    stream_model(deps, request, sink).await
}

fn system_prompt(deps: &AgentDeps, context: &HydratedContext) -> String {
    let mut prompt = deps.policy.tone(context);
    if !deps.tools.is_empty() {
        prompt.push_str("\n\nAvailable tools:\n");
        prompt.push_str(&tool_list(&deps.tools));
    }
    prompt.push_str(&format!("\n\nReply in locale `{}`.", context.locale));
    prompt
}

fn user_prompt(context: &HydratedContext, text: &str) -> String {
    let skip = context.prompt_history.len().saturating_sub(HISTORY_IN_PROMPT);
    let mut prompt = String::new();
    for entry in context.prompt_history.iter().skip(skip) {
        prompt.push_str(&format!("[{}] {}\n", entry.field_id, entry.text));
    }
    prompt.push_str(text);
    prompt
}

fn remember(context: &mut HydratedContext, text: &str) {
    context.prompt_history.push(PromptEntry { field_id: "user".to_owned(), text: text.to_owned() });
    let excess = context.prompt_history.len().saturating_sub(HISTORY_RETAINED);
    context.prompt_history.drain(..excess);
}

#[cfg(test)]
mod tests {
    use carelink_core::domain::context::{HydratedContext, PromptEntry};

    use super::{remember, user_prompt};

    #[test]
    fn prompt_carries_only_the_last_five_history_entries() {
        let mut context = HydratedContext::fallback("u1");
        for n in 0..8 {
            context
                .prompt_history
                .push(PromptEntry { field_id: "user".to_string(), text: format!("turn {n}") });
        }

        let prompt = user_prompt(&context, "today");

        assert!(!prompt.contains("turn 2"));
        assert!(prompt.contains("turn 3"));
        assert!(prompt.ends_with("today"));
    }

    #[test]
    fn history_is_capped() {
        let mut context = HydratedContext::fallback("u1");
        for n in 0..25 {
            remember(&mut context, &format!("turn {n}"));
        }

        assert_eq!(context.prompt_history.len(), 20);
        assert_eq!(context.prompt_history[0].text, "turn 5");
    }
}
