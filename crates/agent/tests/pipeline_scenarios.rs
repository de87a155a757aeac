use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use carelink_agent::agents::SAFETY_FRAGMENT;
use carelink_agent::pipeline::RESOURCE_LIMIT_MESSAGE;
use carelink_agent::{
    default_registry, CancelSignal, InvocationRecord, InvokeObserver, ModelDriver,
    PolicyEngine, RuleBasedPolicy, ScriptedModelDriver, TurnError, TurnOutcome, TurnPipeline,
};
use carelink_agent::AgentKind;
use carelink_core::budget::{Budget, BudgetTable};
use carelink_core::domain::context::{Channel, CrisisFlags, HydratedContext, Inbound};
use carelink_core::domain::turn::{GuardrailPhase, RunOutcome};
use carelink_core::job_queue::JobQueueConfig;
use carelink_db::repositories::{ContextRepository, MessageRepository, TurnLogRepository};
use carelink_db::InMemoryStore;
use serde_json::json;

type ScenarioResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
}

const USER: &str = "caregiver-1";

struct Harness {
    store: InMemoryStore,
    driver: Arc<ScriptedModelDriver>,
    invoked: Arc<Mutex<Vec<String>>>,
    pipeline: TurnPipeline,
}

fn harness_with(driver: ScriptedModelDriver, budgets: BudgetTable) -> Harness {
    let store = InMemoryStore::new(JobQueueConfig::default());
    let driver = Arc::new(driver);
    let invoked = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&invoked);
    let observer: InvokeObserver = Arc::new(move |record: &InvocationRecord| {
        if let Ok(mut names) = seen.lock() {
            names.push(record.name.clone());
        }
    });
    let policy: Arc<dyn PolicyEngine> = Arc::new(RuleBasedPolicy::default());
    let model: Arc<dyn ModelDriver> = driver.clone();
    let pipeline = TurnPipeline::new(store.store(), policy, model, Arc::new(default_registry()))
        .with_budgets(budgets)
        .with_observer(observer);

    Harness { store, driver, invoked, pipeline }
}

fn harness() -> Harness {
    harness_with(ScriptedModelDriver::default(), BudgetTable::default())
}

fn sms(text: &str) -> Inbound {
    Inbound::new(Channel::Sms, USER, text)
}

fn invoked(harness: &Harness) -> Vec<String> {
    harness.invoked.lock().map(|names| names.clone()).unwrap_or_default()
}

async fn seed_context(harness: &Harness, context: HydratedContext) -> ScenarioResult {
    harness.store.contexts.save(&context).await.map_err(|error| format!("seed: {error}"))
}

#[tokio::test]
async fn happy_path_streams_and_persists_once() -> ScenarioResult {
    let harness = harness();

    let result = harness
        .pipeline
        .handle(sms("I need help finding a support group"))
        .await
        .map_err(|error| format!("turn: {error}"))?;

    require_eq!(result.agent, Some(AgentKind::Main));
    let TurnOutcome::Stream { chunks } = &result.outcome else {
        return Err(format!("expected stream, got {:?}", result.outcome));
    };
    require_eq!(chunks.len(), 2);
    require_eq!(harness.driver.calls(), 1);

    let outbound = harness
        .store
        .messages
        .list_outbound(&result.trace_id)
        .await
        .map_err(|error| format!("outbound: {error}"))?;
    require_eq!(outbound.iter().map(|message| message.sequence).collect::<Vec<_>>(), vec![0, 1]);
    require_eq!(harness.store.messages.inbound().await.len(), 1);

    let stored = harness
        .store
        .contexts
        .load(USER)
        .await
        .map_err(|error| format!("load: {error}"))?
        .ok_or("context was not persisted")?;
    require_eq!(stored.prompt_history.len(), 1);

    let runs = harness
        .store
        .turn_logs
        .list_agent_runs(USER)
        .await
        .map_err(|error| format!("runs: {error}"))?;
    require_eq!(runs.len(), 1);
    require_eq!(runs[0].agent, "main");
    require_eq!(runs[0].outcome, RunOutcome::Completed);
    require!(runs[0].usage.output_units > 0, "output units should be counted");
    require!(
        runs[0].trace.iter().filter(|step| step.event == "stream.chunk").count() == 2,
        "each chunk should be traced"
    );
    Ok(())
}

#[tokio::test]
async fn pre_check_block_short_circuits_the_turn() -> ScenarioResult {
    let harness = harness();

    let result = harness
        .pipeline
        .handle(sms("Buy now, limited time offer"))
        .await
        .map_err(|error| format!("turn: {error}"))?;

    require!(result.agent.is_none(), "a blocked turn selects no agent");
    require_eq!(
        result.outcome.user_message(),
        Some("I'm here to support caregivers. How can I help you today?")
    );
    require_eq!(harness.driver.calls(), 0);
    require!(invoked(&harness).is_empty(), "no capability may run after a block");

    let guardrails = harness
        .store
        .turn_logs
        .list_guardrails(USER)
        .await
        .map_err(|error| format!("guardrails: {error}"))?;
    require_eq!(guardrails.len(), 1);
    require_eq!(guardrails[0].phase, GuardrailPhase::Pre);
    require_eq!(guardrails[0].rule_id, "spam");
    require_eq!(guardrails[0].trace_id, result.trace_id);

    let runs = harness.store.turn_logs.list_agent_runs(USER).await.map_err(|e| e.to_string())?;
    require!(runs.is_empty(), "blocked turns never reach an agent");
    Ok(())
}

#[tokio::test]
async fn active_crisis_flag_overrides_main_agent() -> ScenarioResult {
    let harness = harness();
    let mut context = HydratedContext::fallback(USER);
    context.crisis_flags = Some(CrisisFlags { active: true, terms: vec!["end it all".to_string()] });
    seed_context(&harness, context).await?;

    let result = harness
        .pipeline
        .handle(sms("I need help finding a support group"))
        .await
        .map_err(|error| format!("turn: {error}"))?;

    require_eq!(result.agent, Some(AgentKind::Crisis));
    require_eq!(result.outcome.chunks().first().map(String::as_str), Some(SAFETY_FRAGMENT));
    // no emergency consent, so escalation is routed around
    require!(invoked(&harness).is_empty(), "escalation must not run without consent");
    let stats = harness.pipeline.store().jobs.stats().await.map_err(|e| e.to_string())?;
    require_eq!(stats.total, 0);
    Ok(())
}

#[tokio::test]
async fn crisis_with_consent_enqueues_one_contact_message() -> ScenarioResult {
    let harness = harness();
    let mut context = HydratedContext::fallback(USER);
    context.consent.emergency = true;
    context.metadata.insert("emergencyContact".to_string(), json!("+15550142"));
    seed_context(&harness, context).await?;

    let result = harness
        .pipeline
        .handle(sms("I want to end it all"))
        .await
        .map_err(|error| format!("turn: {error}"))?;

    require_eq!(result.agent, Some(AgentKind::Crisis));
    require_eq!(invoked(&harness), vec!["crisis.escalate".to_string()]);
    let stats = harness.pipeline.store().jobs.stats().await.map_err(|e| e.to_string())?;
    require_eq!(stats.pending_count, 1);
    Ok(())
}

#[tokio::test]
async fn low_assessment_score_skips_interventions() -> ScenarioResult {
    let harness = harness();
    let mut context = HydratedContext::fallback(USER);
    context.metadata.insert("assessmentAnswers".to_string(), json!([0, 1, 1, 0]));
    seed_context(&harness, context).await?;

    let result = harness
        .pipeline
        .handle(sms("here are my assessment answers"))
        .await
        .map_err(|error| format!("turn: {error}"))?;

    require_eq!(result.agent, Some(AgentKind::Assessment));
    require_eq!(result.usage.tool_calls, 1);
    require_eq!(invoked(&harness), vec!["assessment.score".to_string()]);
    require!(
        result.outcome.chunks().first().is_some_and(|chunk| chunk.starts_with("Your score is 2 (low).")),
        "unexpected chunks {:?}",
        result.outcome.chunks()
    );
    require_eq!(harness.driver.calls(), 0);

    let stored = harness.store.contexts.load(USER).await.map_err(|e| e.to_string())?;
    let pointer = stored.and_then(|context| context.last_assessment).ok_or("score not recorded")?;
    require_eq!(pointer.definition_id, "burnout_v1");
    require_eq!(pointer.score, Some(2.0));
    Ok(())
}

#[tokio::test]
async fn exhausted_tool_budget_ends_in_resource_limit() -> ScenarioResult {
    let budgets = BudgetTable::default().with_agent("assessment", Budget::new(1000, 800, 1));
    let harness = harness_with(ScriptedModelDriver::default(), budgets);
    let mut context = HydratedContext::fallback(USER);
    context.metadata.insert("assessmentAnswers".to_string(), json!([5, 4, 5]));
    seed_context(&harness, context).await?;

    let result = harness
        .pipeline
        .handle(sms("assessment"))
        .await
        .map_err(|error| format!("turn: {error}"))?;

    let TurnOutcome::ResourceLimit { chunks, message } = &result.outcome else {
        return Err(format!("expected resource limit, got {:?}", result.outcome));
    };
    require_eq!(chunks.len(), 1);
    require_eq!(message.as_str(), RESOURCE_LIMIT_MESSAGE);
    require_eq!(invoked(&harness), vec!["assessment.score".to_string()]);

    let runs = harness.store.turn_logs.list_agent_runs(USER).await.map_err(|e| e.to_string())?;
    require_eq!(runs.len(), 1);
    require_eq!(runs[0].outcome, RunOutcome::ResourceLimit);
    let stored = harness.store.contexts.load(USER).await.map_err(|e| e.to_string())?;
    require!(
        stored.is_some_and(|context| context.last_assessment.is_some()),
        "context must be persisted even when the budget runs out"
    );
    Ok(())
}

#[tokio::test]
async fn store_outage_degrades_hydration_but_surfaces_on_persist() -> ScenarioResult {
    let harness = harness();
    harness.store.contexts.set_unavailable(true);

    let error = match harness.pipeline.handle(sms("hello")).await {
        Ok(result) => return Err(format!("expected persistence error, got {:?}", result.outcome)),
        Err(error) => error,
    };

    require!(matches!(error, TurnError::Persistence(_)), "unexpected error {error}");
    // streaming still ran on the fallback context
    require_eq!(harness.driver.calls(), 1);
    let runs = harness.store.turn_logs.list_agent_runs(USER).await.map_err(|e| e.to_string())?;
    require_eq!(runs.len(), 1);
    Ok(())
}

#[tokio::test]
async fn cancellation_keeps_persisted_fragments() -> ScenarioResult {
    let driver = ScriptedModelDriver::new(vec!["Still here. ".to_string()]).stalling();
    let harness = harness_with(driver, BudgetTable::default());
    let (handle, signal) = CancelSignal::pair();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let result = harness
        .pipeline
        .handle_cancellable(sms("hello"), signal)
        .await
        .map_err(|error| format!("turn: {error}"))?;
    canceller.await.map_err(|error| format!("canceller: {error}"))?;

    require_eq!(result.outcome, TurnOutcome::Cancelled { chunks: vec!["Still here. ".to_string()] });
    let outbound = harness
        .store
        .messages
        .list_outbound(&result.trace_id)
        .await
        .map_err(|e| e.to_string())?;
    require_eq!(outbound.len(), 1);

    let runs = harness.store.turn_logs.list_agent_runs(USER).await.map_err(|e| e.to_string())?;
    require_eq!(runs[0].outcome, RunOutcome::Cancelled);
    let stored = harness.store.contexts.load(USER).await.map_err(|e| e.to_string())?;
    require!(stored.is_some(), "context must be persisted after cancellation");
    Ok(())
}

#[tokio::test]
async fn dropped_caller_still_persists_the_turn() -> ScenarioResult {
    let driver = ScriptedModelDriver::new(vec!["Still here. ".to_string()]).stalling();
    let harness = harness_with(driver, BudgetTable::default());

    let timed_out =
        tokio::time::timeout(Duration::from_millis(50), harness.pipeline.handle(sms("hello"))).await;
    require!(timed_out.is_err(), "a stalled turn should outlive the caller's timeout");

    let mut runs = Vec::new();
    for _ in 0..50 {
        runs = harness.store.turn_logs.list_agent_runs(USER).await.map_err(|e| e.to_string())?;
        if !runs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    require_eq!(runs.len(), 1);
    require_eq!(runs[0].outcome, RunOutcome::Cancelled);

    let stored = harness.store.contexts.load(USER).await.map_err(|e| e.to_string())?;
    require!(stored.is_some(), "context must be persisted after the caller went away");
    let outbound = harness
        .store
        .messages
        .list_outbound(&runs[0].trace_id)
        .await
        .map_err(|e| e.to_string())?;
    require_eq!(outbound.len(), 1);
    Ok(())
}

#[tokio::test]
async fn post_check_is_advisory() -> ScenarioResult {
    let driver = ScriptedModelDriver::new(vec!["You should take 20 mg of melatonin.".to_string()]);
    let harness = harness_with(driver, BudgetTable::default());

    let result = harness
        .pipeline
        .handle(sms("I can't sleep"))
        .await
        .map_err(|error| format!("turn: {error}"))?;

    require_eq!(result.outcome.kind(), "stream");
    let guardrails = harness.store.turn_logs.list_guardrails(USER).await.map_err(|e| e.to_string())?;
    require_eq!(guardrails.len(), 1);
    require_eq!(guardrails[0].phase, GuardrailPhase::Post);
    require_eq!(guardrails[0].rule_id, "medical_advice");
    Ok(())
}

#[tokio::test]
async fn concurrent_turns_for_different_users_do_not_share_state() -> ScenarioResult {
    let harness = Arc::new(harness());
    let counter = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for index in 0..4 {
        let harness = Arc::clone(&harness);
        let counter = Arc::clone(&counter);
        tasks.push(tokio::spawn(async move {
            let input = Inbound::new(Channel::Web, format!("user-{index}"), "hello there");
            let result = harness.pipeline.handle(input).await;
            if result.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            result.map(|result| result.trace_id)
        }));
    }

    let mut trace_ids = Vec::new();
    for task in tasks {
        let trace_id = task
            .await
            .map_err(|error| format!("join: {error}"))?
            .map_err(|error| format!("turn: {error}"))?;
        trace_ids.push(trace_id);
    }
    trace_ids.sort_by(|left, right| left.0.cmp(&right.0));
    trace_ids.dedup();

    require_eq!(trace_ids.len(), 4);
    require_eq!(counter.load(Ordering::SeqCst), 4);
    Ok(())
}
