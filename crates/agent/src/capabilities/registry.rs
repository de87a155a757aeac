use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use carelink_core::budget::Budget;
use carelink_core::domain::context::HydratedContext;
use carelink_core::trace::Trace;
use carelink_db::Store;

use super::schema::InputSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hint {
    Low,
    Medium,
    High,
}

/// What a model prompt may say about a capability.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
    pub cost_hint: Hint,
    pub latency_hint: Hint,
    pub requires_consent: bool,
    pub input_schema: Option<Value>,
}

/// Read-only view of the turn handed to a capability handler.
pub struct CapabilityContext<'a> {
    pub user_id: &'a str,
    pub store: &'a Store,
    pub trace: &'a Trace,
    pub budget: &'a Budget,
    pub context: &'a HydratedContext,
}

#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn call(&self, input: Value, ctx: CapabilityContext<'_>) -> anyhow::Result<Value>;
}

pub struct Capability {
    pub name: String,
    pub description: String,
    pub cost_hint: Hint,
    pub latency_hint: Hint,
    pub requires_consent: bool,
    pub schema: Option<InputSchema>,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl Capability {
    pub fn new<H>(name: &str, description: &str, handler: H) -> Self
    where
        H: CapabilityHandler + 'static,
    {
        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            cost_hint: Hint::Low,
            latency_hint: Hint::Low,
            requires_consent: false,
            schema: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_schema(mut self, schema: InputSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_hints(mut self, cost: Hint, latency: Hint) -> Self {
        self.cost_hint = cost;
        self.latency_hint = latency;
        self
    }

    pub fn requiring_consent(mut self) -> Self {
        self.requires_consent = true;
        self
    }

    pub fn spec(&self) -> CapabilitySpec {
        CapabilitySpec {
            name: self.name.clone(),
            description: self.description.clone(),
            cost_hint: self.cost_hint,
            latency_hint: self.latency_hint,
            requires_consent: self.requires_consent,
            input_schema: self.schema.as_ref().map(InputSchema::to_json_schema),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("capability `{0}` is already registered")]
    Duplicate(String),
}

#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Capability) -> Result<(), RegistryError> {
        if self.capabilities.contains_key(&capability.name) {
            return Err(RegistryError::Duplicate(capability.name));
        }
        self.capabilities.insert(capability.name.clone(), Arc::new(capability));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn specs(&self) -> Vec<CapabilitySpec> {
        self.capabilities.values().map(|capability| capability.spec()).collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
