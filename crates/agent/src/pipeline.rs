//! Turn pipeline
//!
//! One call to [`TurnPipeline::handle`] walks a turn through
//! `received → context-hydrated → pre-policy-checked → agent-selected →
//! budget-assigned → streaming → persisted → post-policy-checked → done`.
//!
//! The pre-check may end the turn early with [`TurnOutcome::PolicyBlock`].
//! Once an agent is running, the context and the agent-run record are always
//! written, whether the run finished, failed, hit its budget or was
//! cancelled. Only then are errors propagated.
//!
//! The turn runs on its own task. A caller that drops the future cancels the
//! agent run; the task still writes the turn's records before it exits.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use carelink_core::budget::{estimate_units, BudgetTable};
use carelink_core::chrono::Utc;
use carelink_core::domain::context::{Channel, HydratedContext, Inbound};
use carelink_core::domain::message::{InboundRecord, MessageId, OutboundMessage};
use carelink_core::domain::turn::{
    AgentRunRecord, GuardrailEvent, GuardrailPhase, RunOutcome, UsageCounters,
};
use carelink_core::trace::{Trace, TraceId};
use carelink_db::repositories::MessageRepository;
use carelink_db::{RepositoryError, Store};

use crate::agents::{AgentDeps, AgentError, AgentKind, FragmentSink, Plan};
use crate::capabilities::{CapabilityError, CapabilityRegistry, CapabilityRuntime, InvokeObserver};
use crate::llm::ModelDriver;
use crate::policy::{PolicyDecision, PolicyEngine, DEFAULT_BLOCK_MESSAGE};

pub const RESOURCE_LIMIT_MESSAGE: &str =
    "I've reached my limit for this message. Let's pick this up in your next one.";

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("turn state could not be persisted: {0}")]
    Persistence(#[from] RepositoryError),
    #[error("agent run failed: {0}")]
    Agent(#[source] AgentError),
    #[error("turn task stopped unexpectedly: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    PolicyBlock { message: String },
    Stream { chunks: Vec<String> },
    ResourceLimit { chunks: Vec<String>, message: String },
    Cancelled { chunks: Vec<String> },
}

impl TurnOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PolicyBlock { .. } => "policy_block",
            Self::Stream { .. } => "stream",
            Self::ResourceLimit { .. } => "resource_limit",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn chunks(&self) -> &[String] {
        match self {
            Self::PolicyBlock { .. } => &[],
            Self::Stream { chunks }
            | Self::ResourceLimit { chunks, .. }
            | Self::Cancelled { chunks } => chunks,
        }
    }

    /// Text for the user when the turn ended on an expected failure path.
    pub fn user_message(&self) -> Option<&str> {
        match self {
            Self::PolicyBlock { message } | Self::ResourceLimit { message, .. } => Some(message),
            Self::Stream { .. } | Self::Cancelled { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnResult {
    pub trace_id: TraceId,
    pub agent: Option<AgentKind>,
    pub outcome: TurnOutcome,
    pub usage: UsageCounters,
}

/// Receiving half of a cancellation flag. A signal whose handle was dropped
/// never fires.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
    }

    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
            if !closed {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancels when dropped along with the caller's future.
struct CancelOnDrop(CancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

enum RunEnd {
    Finished(Result<(), AgentError>),
    Cancelled,
}

#[derive(Clone)]
pub struct TurnPipeline {
    store: Store,
    policy: Arc<dyn PolicyEngine>,
    model: Arc<dyn ModelDriver>,
    registry: Arc<CapabilityRegistry>,
    budgets: BudgetTable,
    observer: Option<InvokeObserver>,
}

impl TurnPipeline {
    pub fn new(
        store: Store,
        policy: Arc<dyn PolicyEngine>,
        model: Arc<dyn ModelDriver>,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self { store, policy, model, registry, budgets: BudgetTable::default(), observer: None }
    }

    pub fn with_budgets(mut self, budgets: BudgetTable) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_observer(mut self, observer: InvokeObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn handle(&self, input: Inbound) -> Result<TurnResult, TurnError> {
        self.handle_cancellable(input, CancelSignal::never()).await
    }

    pub async fn handle_cancellable(
        &self,
        input: Inbound,
        cancel: CancelSignal,
    ) -> Result<TurnResult, TurnError> {
        let (abandon, abandoned) = CancelSignal::pair();
        let _caller = CancelOnDrop(abandon);
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run_turn(input, cancel, abandoned).await }).await?
    }

    async fn run_turn(
        &self,
        input: Inbound,
        mut cancel: CancelSignal,
        mut abandoned: CancelSignal,
    ) -> Result<TurnResult, TurnError> {
        let started = Instant::now();
        let trace = Trace::new();
        let trace_id = trace.id().clone();
        trace.push(
            "turn.received",
            json!({ "channel": input.channel.as_str(), "user_id": input.user_id }),
        );
        self.record_inbound(&input, &trace_id).await;

        let context = self.hydrate(&input.user_id, &trace).await;

        let decision = self.policy.pre(&input, &context);
        trace.push(
            "policy.pre",
            json!({
                "allow": decision.allow,
                "rules": decision.actions.iter().map(|hit| hit.rule_id.as_str()).collect::<Vec<_>>(),
            }),
        );
        if !decision.allow {
            let message =
                decision.message.clone().unwrap_or_else(|| DEFAULT_BLOCK_MESSAGE.to_owned());
            self.log_guardrail(GuardrailPhase::Pre, &decision, Some(&message), &trace_id, &input.user_id)
                .await?;
            info!(
                event_name = "turn.policy_blocked",
                trace_id = %trace_id,
                user_id = %input.user_id,
                "turn blocked by pre-check"
            );
            return Ok(TurnResult {
                trace_id,
                agent: None,
                outcome: TurnOutcome::PolicyBlock { message },
                usage: UsageCounters::default(),
            });
        }

        let agent = self.select_agent(&input, &context, &decision);
        let budget = self.budgets.resolve(agent.as_str(), &context.policy_bundle);
        trace.push(
            "agent.selected",
            json!({
                "agent": agent.as_str(),
                "policy_bundle": context.policy_bundle,
                "max_input_units": budget.max_input_units,
                "max_output_units": budget.max_output_units,
                "max_tools": budget.max_tools,
            }),
        );

        let mut runtime = CapabilityRuntime::new(
            Arc::clone(&self.registry),
            self.store.clone(),
            context,
            trace.clone(),
            budget,
        );
        if let Some(observer) = &self.observer {
            runtime = runtime.with_observer(Arc::clone(observer));
        }
        let deps = AgentDeps {
            model: Arc::clone(&self.model),
            policy: Arc::clone(&self.policy),
            tools: self.registry.specs(),
        };
        let mut sink = PersistingSink {
            messages: self.store.messages.as_ref(),
            trace: &trace,
            user_id: &input.user_id,
            channel: input.channel,
            chunks: Vec::new(),
            input_units: 0,
            output_units: 0,
        };

        let end = {
            let run = agent.run(&input, &mut runtime, &deps, &mut sink);
            tokio::pin!(run);
            tokio::select! {
                biased;
                () = cancel.cancelled() => RunEnd::Cancelled,
                () = abandoned.cancelled() => {
                    warn!(
                        event_name = "turn.caller_dropped",
                        trace_id = %trace_id,
                        user_id = %input.user_id,
                        "caller went away; cancelling agent run"
                    );
                    RunEnd::Cancelled
                }
                result = &mut run => RunEnd::Finished(result),
            }
        };

        let usage = UsageCounters {
            input_units: sink.input_units,
            output_units: sink.output_units,
            tool_calls: runtime.invocations(),
        };
        let chunks = sink.chunks;
        let context = runtime.into_context();

        let (run_outcome, run_error) = match &end {
            RunEnd::Finished(Ok(())) => (RunOutcome::Completed, None),
            RunEnd::Finished(Err(error @ AgentError::Capability(CapabilityError::BudgetExceeded { .. }))) => {
                (RunOutcome::ResourceLimit, Some(error.to_string()))
            }
            RunEnd::Finished(Err(error)) => (RunOutcome::Failed, Some(error.to_string())),
            RunEnd::Cancelled => (RunOutcome::Cancelled, None),
        };
        trace.push(
            "turn.persisting",
            json!({ "outcome": run_outcome.as_str(), "chunks": chunks.len() }),
        );

        let saved_context = self.store.contexts.save(&context).await;
        let logged_run = self
            .store
            .turn_logs
            .log_agent_run(AgentRunRecord {
                id: format!("run-{}", uuid::Uuid::new_v4()),
                agent: agent.as_str().to_owned(),
                user_id: input.user_id.clone(),
                policy_bundle: context.policy_bundle.clone(),
                usage,
                trace_id: trace_id.clone(),
                latency_ms: elapsed_ms(started),
                outcome: run_outcome,
                error: run_error,
                trace: trace.steps(),
                created_at: Utc::now(),
            })
            .await;

        let reply = chunks.concat();
        let post = self.policy.post(&input, &context, &reply);
        trace.push("policy.post", json!({ "allow": post.allow }));
        let logged_post = if post.allow {
            Ok(())
        } else {
            self.log_guardrail(
                GuardrailPhase::Post,
                &post,
                post.message.as_deref(),
                &trace_id,
                &input.user_id,
            )
            .await
        };

        saved_context?;
        logged_run?;
        logged_post?;

        let outcome = match end {
            RunEnd::Finished(Ok(())) => TurnOutcome::Stream { chunks },
            RunEnd::Finished(Err(AgentError::Capability(CapabilityError::BudgetExceeded { .. }))) => {
                TurnOutcome::ResourceLimit { chunks, message: RESOURCE_LIMIT_MESSAGE.to_owned() }
            }
            RunEnd::Finished(Err(AgentError::Persistence(error))) => {
                return Err(TurnError::Persistence(error));
            }
            RunEnd::Finished(Err(error)) => {
                warn!(
                    event_name = "turn.failed",
                    trace_id = %trace_id,
                    user_id = %input.user_id,
                    agent = agent.as_str(),
                    error = %error,
                    "agent run failed"
                );
                return Err(TurnError::Agent(error));
            }
            RunEnd::Cancelled => TurnOutcome::Cancelled { chunks },
        };

        info!(
            event_name = "turn.completed",
            trace_id = %trace_id,
            user_id = %input.user_id,
            agent = agent.as_str(),
            outcome = outcome.kind(),
            chunks = outcome.chunks().len(),
            tool_calls = usage.tool_calls,
            latency_ms = elapsed_ms(started),
            "turn completed"
        );

        Ok(TurnResult { trace_id, agent: Some(agent), outcome, usage })
    }

    fn select_agent(
        &self,
        input: &Inbound,
        context: &HydratedContext,
        decision: &PolicyDecision,
    ) -> AgentKind {
        let initial = decision
            .route_override
            .filter(|agent| agent.preconditions_hold(context))
            .unwrap_or(AgentKind::Main);

        match initial.plan(input, context, self.policy.as_ref()) {
            Plan::Assess => AgentKind::Assessment,
            Plan::Escalate => AgentKind::Crisis,
            Plan::Respond => initial,
        }
    }

    async fn record_inbound(&self, input: &Inbound, trace_id: &TraceId) {
        let record = InboundRecord {
            id: MessageId::generate(),
            user_id: input.user_id.clone(),
            channel: input.channel,
            text: input.text.clone(),
            meta: input.meta.clone(),
            trace_id: trace_id.clone(),
            received_at: Utc::now(),
        };
        if let Err(error) = self.store.messages.save_inbound(record).await {
            warn!(
                event_name = "turn.inbound_not_recorded",
                trace_id = %trace_id,
                user_id = %input.user_id,
                error = %error,
                "inbound message could not be recorded"
            );
        }
    }

    async fn hydrate(&self, user_id: &str, trace: &Trace) -> HydratedContext {
        let (context, source) = match self.store.contexts.load(user_id).await {
            Ok(Some(context)) => (context, "store"),
            Ok(None) => (HydratedContext::fallback(user_id), "fallback"),
            Err(error) => {
                warn!(
                    event_name = "turn.hydration_degraded",
                    trace_id = %trace.id(),
                    user_id,
                    error = %error,
                    "context store unavailable; using fallback context"
                );
                (HydratedContext::fallback(user_id), "fallback")
            }
        };
        trace.push("context.hydrated", json!({ "source": source }));
        context
    }

    async fn log_guardrail(
        &self,
        phase: GuardrailPhase,
        decision: &PolicyDecision,
        message: Option<&str>,
        trace_id: &TraceId,
        user_id: &str,
    ) -> Result<(), RepositoryError> {
        let hit = decision.actions.last();
        let event = GuardrailEvent {
            id: format!("guard-{}", uuid::Uuid::new_v4()),
            rule_id: hit.map_or("unknown", |hit| hit.rule_id.as_str()).to_owned(),
            action: hit.map_or("block", |hit| hit.action.as_str()).to_owned(),
            phase,
            message: message.map(str::to_owned),
            trace_id: trace_id.clone(),
            user_id: user_id.to_owned(),
            occurred_at: Utc::now(),
        };
        warn!(
            event_name = "policy.guardrail",
            trace_id = %trace_id,
            user_id,
            phase = phase.as_str(),
            rule_id = %event.rule_id,
            "policy check disallowed turn"
        );
        self.store.turn_logs.log_guardrail(event).await
    }
}

struct PersistingSink<'a> {
    messages: &'a dyn MessageRepository,
    trace: &'a Trace,
    user_id: &'a str,
    channel: Channel,
    chunks: Vec<String>,
    input_units: u32,
    output_units: u32,
}

#[async_trait]
impl<'a> FragmentSink for PersistingSink<'a> {
    async fn emit(&mut self, fragment: String) -> Result<(), AgentError> {
        let sequence = u32::try_from(self.chunks.len()).unwrap_or(u32::MAX);
        self.trace.push(
            "stream.chunk",
            json!({ "sequence": sequence, "units": estimate_units(&fragment) }),
        );
        self.messages
            .save_outbound(OutboundMessage {
                id: MessageId::generate(),
                user_id: self.user_id.to_owned(),
                channel: self.channel,
                text: fragment.clone(),
                trace_id: self.trace.id().clone(),
                sequence,
                created_at: Utc::now(),
            })
            .await?;
        self.output_units = self.output_units.saturating_add(estimate_units(&fragment));
        self.chunks.push(fragment);
        Ok(())
    }

    fn record_input_units(&mut self, units: u32) {
        self.input_units = self.input_units.saturating_add(units);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
