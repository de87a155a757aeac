//! Turn runtime - policy-gated agent execution over a streaming model
//!
//! This crate turns one inbound message into a streamed, persisted reply:
//! - Hydrates the user's context and runs the policy pre-check
//! - Selects one agent variant (`main`, `crisis`, `assessment`)
//! - Runs it against a per-turn capability runtime that enforces the budget
//!   and consent rules before every tool call
//! - Persists each streamed fragment before asking for the next one
//! - Always writes the final context and an agent-run record
//!
//! # Key Types
//!
//! - `TurnPipeline` - the coordinator (see `pipeline`)
//! - `CapabilityRuntime` - budget and consent gate around the registry
//! - `PolicyEngine` - pre/post checks, intent detection and tone
//! - `ModelDriver` - streaming text contract for OpenAI-compatible backends
//!
//! # Safety Principle
//!
//! The model only writes prose. Routing, consent and budget decisions are
//! deterministic and happen outside the model.

pub mod agents;
pub mod capabilities;
pub mod llm;
pub mod pipeline;
pub mod policy;

pub use agents::{AgentDeps, AgentError, AgentKind, FragmentSink, Plan};
pub use capabilities::{
    default_registry, Capability, CapabilityContext, CapabilityError, CapabilityHandler,
    CapabilityRegistry, CapabilityRuntime, CapabilitySpec, FieldKind, Hint, InputSchema,
    InvocationRecord, InvokeObserver, RegistryError,
};
pub use llm::{driver_from_config, ModelDriver, ModelError, ScriptedModelDriver, StreamRequest};
pub use pipeline::{CancelHandle, CancelSignal, TurnError, TurnOutcome, TurnPipeline, TurnResult};
pub use policy::{AllowAllPolicy, Intent, PolicyDecision, PolicyEngine, RuleBasedPolicy, RuleHit};
