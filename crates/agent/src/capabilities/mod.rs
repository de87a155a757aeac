//! Capabilities the agents may call during a turn.

pub mod builtin;
pub mod registry;
pub mod runtime;
pub mod schema;

pub use builtin::{default_registry, interventions_for, Intervention, ScoreBand};
pub use registry::{
    Capability, CapabilityContext, CapabilityHandler, CapabilityRegistry, CapabilitySpec, Hint,
    RegistryError,
};
pub use runtime::{CapabilityError, CapabilityRuntime, InvocationRecord, InvokeObserver};
pub use schema::{FieldKind, FieldSpec, InputSchema};
