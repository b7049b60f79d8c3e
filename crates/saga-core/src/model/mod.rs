//! Modelo de ejecución: estados de ejecución, contexto e instancias.

pub mod context;
pub mod instance;
pub mod status;

pub use context::ExecutionContext;
pub use instance::{ScopeSegment, StateInstance, StateMachineInstance};
pub use status::ExecutionStatus;
