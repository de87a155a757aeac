use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn generate() -> Self {
        Self(format!("trace-{}", uuid::Uuid::new_v4()))
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub event: String,
    pub at: DateTime<Utc>,
    pub attributes: Value,
}

/// Append-only timeline of one turn.
///
/// Clones share the same step buffer so the pipeline and the capability
/// runtime can both record into it. Steps are never removed or rewritten.
#[derive(Clone, Debug)]
pub struct Trace {
    id: TraceId,
    steps: Arc<Mutex<Vec<TraceStep>>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::with_id(TraceId::generate())
    }

    pub fn with_id(id: TraceId) -> Self {
        Self { id, steps: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn id(&self) -> &TraceId {
        &self.id
    }

    pub fn push(&self, event: impl Into<String>, attributes: Value) {
        let step = TraceStep { event: event.into(), at: Utc::now(), attributes };
        match self.steps.lock() {
            Ok(mut guard) => guard.push(step),
            Err(poisoned) => poisoned.into_inner().push(step),
        }
    }

    pub fn steps(&self) -> Vec<TraceStep> {
        match self.steps.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.steps().into_iter().map(|step| step.event).collect()
    }

    pub fn len(&self) -> usize {
        match self.steps.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}
