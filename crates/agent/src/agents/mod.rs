//! Agent variants
//!
//! The set is closed: `main` handles ordinary conversation, `crisis` puts
//! safety resources first and tries to reach the emergency contact, and
//! `assessment` scores check-in answers. Selection happens in the pipeline;
//! each variant only decides its own plan and produces fragments.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use carelink_core::budget::estimate_units;
use carelink_core::domain::context::{HydratedContext, Inbound};
use carelink_db::RepositoryError;

use crate::capabilities::{CapabilityError, CapabilityRuntime, CapabilitySpec};
use crate::llm::{ModelDriver, ModelError, StreamRequest};
use crate::policy::{Intent, PolicyEngine};

mod assessment;
mod crisis;
mod main_agent;

pub use crisis::SAFETY_FRAGMENT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Main,
    Crisis,
    Assessment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Plan {
    Respond,
    Assess,
    Escalate,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Persistence(#[from] RepositoryError),
}

/// Receives fragments in the order they are produced. `emit` returns only
/// after the fragment is durable, so the next one is not requested earlier.
#[async_trait]
pub trait FragmentSink: Send {
    async fn emit(&mut self, fragment: String) -> Result<(), AgentError>;

    fn record_input_units(&mut self, _units: u32) {}
}

/// Shared collaborators for every agent run in a pipeline.
#[derive(Clone)]
pub struct AgentDeps {
    pub model: Arc<dyn ModelDriver>,
    pub policy: Arc<dyn PolicyEngine>,
    pub tools: Vec<CapabilitySpec>,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Main, AgentKind::Crisis, AgentKind::Assessment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Crisis => "crisis",
            Self::Assessment => "assessment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "main" => Some(Self::Main),
            "crisis" => Some(Self::Crisis),
            "assessment" => Some(Self::Assessment),
            _ => None,
        }
    }

    pub fn preconditions_hold(&self, context: &HydratedContext) -> bool {
        match self {
            Self::Main | Self::Assessment => true,
            Self::Crisis => context.crisis_active(),
        }
    }

    pub fn plan(&self, input: &Inbound, context: &HydratedContext, policy: &dyn PolicyEngine) -> Plan {
        match self {
            Self::Main if context.crisis_active() => Plan::Escalate,
            Self::Main => match policy.intent(&input.text) {
                Intent::Assessment => Plan::Assess,
                Intent::Crisis => Plan::Escalate,
                Intent::Respond => Plan::Respond,
            },
            Self::Crisis => Plan::Escalate,
            Self::Assessment => Plan::Assess,
        }
    }

    pub async fn run(
        &self,
        input: &Inbound,
        runtime: &mut CapabilityRuntime,
        deps: &AgentDeps,
        sink: &mut dyn FragmentSink,
    ) -> Result<(), AgentError> {
        match self {
            Self::Main => main_agent::run(input, runtime, deps, sink).await,
            Self::Crisis => crisis::run(input, runtime, deps, sink).await,
            Self::Assessment => assessment::run(input, runtime, deps, sink).await,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn tool_list(tools: &[CapabilitySpec]) -> String {
    tools
        .iter()
        .map(|tool| format!("- {}: {}", tool.name, tool.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Streams model output into `sink`, skipping empty fragments.
async fn stream_model(
    deps: &AgentDeps,
    request: StreamRequest,
    sink: &mut dyn FragmentSink,
) -> Result<(), AgentError> {
    sink.record_input_units(
        estimate_units(&request.system_prompt) + estimate_units(&request.user_prompt),
    );

    let mut fragments = deps.model.stream(request).await?;
    while let Some(fragment) = fragments.recv().await {
        let fragment = fragment?;
        if fragment.is_empty() {
            continue;
        }
        sink.emit(fragment).await?;
    }
    Ok(())
}
