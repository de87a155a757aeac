//! Per-turn gate in front of the capability registry.
//!
//! A runtime lives for exactly one turn. It owns the hydrated context while
//! the turn runs and counts successful invocations against the budget.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use carelink_core::budget::Budget;
use carelink_core::domain::context::HydratedContext;
use carelink_core::trace::{Trace, TraceId};
use carelink_db::Store;

use super::registry::{CapabilityContext, CapabilityRegistry, CapabilitySpec};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("tool budget of {max_tools} invocation(s) exhausted")]
    BudgetExceeded { max_tools: u32 },
    #[error("capability `{0}` is not registered")]
    NotFound(String),
    #[error("capability `{0}` requires emergency consent")]
    ConsentRequired(String),
    #[error("invalid input for `{name}`: {reason}")]
    InvalidInput { name: String, reason: String },
    #[error("capability `{name}` failed: {message}")]
    Handler { name: String, message: String },
}

impl CapabilityError {
    fn kind(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::NotFound(_) => "not_found",
            Self::ConsentRequired(_) => "consent_required",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Handler { .. } => "handler",
        }
    }
}

/// Handed to the `on_invoke` observer after each successful invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct InvocationRecord {
    pub name: String,
    pub user_id: String,
    pub trace_id: TraceId,
    pub invocation: u32,
    pub latency_ms: u64,
}

pub type InvokeObserver = Arc<dyn Fn(&InvocationRecord) + Send + Sync>;

pub struct CapabilityRuntime {
    registry: Arc<CapabilityRegistry>,
    store: Store,
    context: HydratedContext,
    trace: Trace,
    budget: Budget,
    invocations: u32,
    observer: Option<InvokeObserver>,
}

impl CapabilityRuntime {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        store: Store,
        context: HydratedContext,
        trace: Trace,
        budget: Budget,
    ) -> Self {
        Self { registry, store, context, trace, budget, invocations: 0, observer: None }
    }

    pub fn with_observer(mut self, observer: InvokeObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn invoke(&mut self, name: &str, args: Value) -> Result<Value, CapabilityError> {
        match self.invoke_checked(name, args).await {
            Ok(output) => Ok(output),
            Err(error) => {
                self.trace.push(
                    "tool.error",
                    json!({ "name": name, "kind": error.kind(), "error": error.to_string() }),
                );
                warn!(
                    event_name = "capability.invoke_failed",
                    trace_id = %self.trace.id(),
                    user_id = %self.context.user_id,
                    capability = name,
                    error = %error,
                    "capability invocation failed"
                );
                Err(error)
            }
        }
    }

    async fn invoke_checked(&mut self, name: &str, args: Value) -> Result<Value, CapabilityError> {
        if self.invocations >= self.budget.max_tools {
            return Err(CapabilityError::BudgetExceeded { max_tools: self.budget.max_tools });
        }

        let capability =
            self.registry.get(name).ok_or_else(|| CapabilityError::NotFound(name.to_owned()))?;

        if capability.requires_consent && !self.context.consent.emergency {
            return Err(CapabilityError::ConsentRequired(name.to_owned()));
        }

        if let Some(schema) = &capability.schema {
            schema.validate(&args).map_err(|reason| CapabilityError::InvalidInput {
                name: name.to_owned(),
                reason,
            })?;
        }

        let started = Instant::now();
        let ctx = CapabilityContext {
            user_id: &self.context.user_id,
            store: &self.store,
            trace: &self.trace,
            budget: &self.budget,
            context: &self.context,
        };
        let output = capability.handler.call(args, ctx).await.map_err(|error| {
            CapabilityError::Handler { name: name.to_owned(), message: format!("{error:#}") }
        })?;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.invocations += 1;
        self.trace.push(
            "tool.invoke",
            json!({ "name": name, "invocation": self.invocations, "latency_ms": latency_ms }),
        );
        debug!(
            event_name = "capability.invoked",
            trace_id = %self.trace.id(),
            capability = name,
            invocation = self.invocations,
            "capability invoked"
        );

        if let Some(observer) = &self.observer {
            observer(&InvocationRecord {
                name: name.to_owned(),
                user_id: self.context.user_id.clone(),
                trace_id: self.trace.id().clone(),
                invocation: self.invocations,
                latency_ms,
            });
        }

        Ok(output)
    }

    pub fn invocations(&self) -> u32 {
        self.invocations
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn context(&self) -> &HydratedContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut HydratedContext {
        &mut self.context
    }

    pub fn into_context(self) -> HydratedContext {
        self.context
    }

    pub fn specs(&self) -> Vec<CapabilitySpec> {
        self.registry.specs()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use carelink_core::budget::Budget;
    use carelink_core::domain::context::HydratedContext;
    use carelink_core::job_queue::JobQueueConfig;
    use carelink_core::trace::Trace;
    use carelink_db::Store;

    use super::{CapabilityError, CapabilityRuntime, InvokeObserver};
    use crate::capabilities::{
        Capability, CapabilityContext, CapabilityHandler, CapabilityRegistry, FieldKind,
        InputSchema,
    };

    struct Echo;

    #[async_trait]
    impl CapabilityHandler for Echo {
        async fn call(&self, input: Value, ctx: CapabilityContext<'_>) -> anyhow::Result<Value> {
            Ok(json!({ "user": ctx.user_id, "input": input }))
        }
    }

    struct Broken;

    #[async_trait]
    impl CapabilityHandler for Broken {
        async fn call(&self, _input: Value, _ctx: CapabilityContext<'_>) -> anyhow::Result<Value> {
            anyhow::bail!("upstream refused")
        }
    }

    fn registry() -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(
                Capability::new("echo", "echo", Echo)
                    .with_schema(InputSchema::new().required("text", FieldKind::String, "text")),
            )
            .expect("echo");
        registry
            .register(Capability::new("guarded", "needs consent", Echo).requiring_consent())
            .expect("guarded");
        registry.register(Capability::new("broken", "always fails", Broken)).expect("broken");
        Arc::new(registry)
    }

    fn runtime(max_tools: u32) -> CapabilityRuntime {
        CapabilityRuntime::new(
            registry(),
            Store::in_memory(JobQueueConfig::default()),
            HydratedContext::fallback("u1"),
            Trace::new(),
            Budget::new(100, 100, max_tools),
        )
    }

    #[tokio::test]
    async fn budget_is_checked_before_anything_else() {
        let mut runtime = runtime(1);

        runtime.invoke("echo", json!({ "text": "hi" })).await.expect("first call");
        let error = runtime.invoke("missing", json!({})).await.expect_err("over budget");

        assert_eq!(error, CapabilityError::BudgetExceeded { max_tools: 1 });
        assert_eq!(runtime.invocations(), 1);
        assert_eq!(runtime.trace().events(), vec!["tool.invoke", "tool.error"]);
    }

    #[tokio::test]
    async fn failed_calls_do_not_consume_budget() {
        let mut runtime = runtime(2);

        assert!(matches!(
            runtime.invoke("missing", json!({})).await,
            Err(CapabilityError::NotFound(_))
        ));
        assert!(matches!(
            runtime.invoke("guarded", json!({})).await,
            Err(CapabilityError::ConsentRequired(_))
        ));
        assert!(matches!(
            runtime.invoke("echo", json!({ "text": 7 })).await,
            Err(CapabilityError::InvalidInput { .. })
        ));
        assert!(matches!(
            runtime.invoke("broken", json!({})).await,
            Err(CapabilityError::Handler { .. })
        ));

        assert_eq!(runtime.invocations(), 0);
        assert_eq!(runtime.trace().len(), 4);
    }

    #[tokio::test]
    async fn consent_unlocks_guarded_capability_and_observer_sees_it() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let observer: InvokeObserver = Arc::new(move |record| {
            assert_eq!(record.name, "guarded");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut runtime = runtime(2).with_observer(observer);
        runtime.context_mut().consent.emergency = true;

        let output = runtime.invoke("guarded", json!({})).await.expect("consented");

        assert_eq!(output["user"], "u1");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.into_context().user_id, "u1");
    }
}
