//! Errores del motor de sagas.
//!
//! `EngineError` es la taxonomía que ve el llamador. `StoreError` es el error
//! neutro (independiente del backend) que cruza el contrato `StateLogStore`.
//! Lo que se persiste en instancias y estados es un `ErrorRecord` serializable.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::ServiceError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("business key '{business_key}' (tenant '{tenant_id}') already bound to non-terminal instance '{instance_id}'")]
    BusinessKeyConflict { business_key: String,
                          tenant_id: String,
                          instance_id: String },
    #[error("record not found: {0}")] NotFound(String),
    #[error("duplicate record: {0}")] Duplicate(String),
    #[error("store unavailable: {0}")] Unavailable(String),
    #[error("serialization: {0}")] Serialization(String),
    #[error("store backend: {0}")] Backend(String),
}

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("invalid definition: {0}")] InvalidDefinition(String),
    #[error("state machine '{name}' not found for tenant '{tenant}'")]
    StateMachineNotFound { name: String,
                           tenant: String },
    #[error("state machine instance '{0}' not found")] InstanceNotFound(String),
    #[error("no choice matched in state '{state}'")] NoChoiceMatched { state: String },
    #[error("unknown transition target '{target}' from state '{from}'")]
    UnknownTransition { from: String,
                        target: String },
    #[error("state '{state}' failed: {error}")]
    StateFailed { state: String,
                  error: ServiceError },
    #[error("state '{state}' finished with unknown outcome")]
    StateUnknown { state: String,
                   error: Option<ServiceError> },
    #[error("branch {index} of parallel state '{state}' failed: {cause}")]
    BranchFailed { state: String,
                   index: usize,
                   cause: Box<EngineError> },
    #[error("fail end state '{state}' reached: {code}")]
    FailEnd { state: String,
              code: String,
              message: String },
    #[error("compensation of instance '{instance_id}' did not succeed")]
    CompensationIncomplete { instance_id: String },
    #[error("execution timed out after {0:?}")] Timeout(Duration),
    #[error("expression error: {0}")] Expression(String),
    #[error("store: {0}")] Store(#[from] StoreError),
    #[error("instance '{0}' is being driven by another operation")] InstanceLocked(String),
    #[error("operation denied: {0}")] OperationDenied(String),
    #[error("coordinator: {0}")] Coordinator(String),
    #[error("async dispatch unavailable: {0}")] AsyncUnavailable(String),
    #[error("instance '{instance_id}' aborted: {cause}")]
    InstanceAborted { instance_id: String,
                      cause: Box<EngineError> },
    #[error("internal: {0}")] Internal(String),
}

impl EngineError {
    /// Código estable para persistir o mostrar.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidDefinition(_) => "InvalidDefinition",
            EngineError::StateMachineNotFound { .. } => "StateMachineNotFound",
            EngineError::InstanceNotFound(_) => "InstanceNotFound",
            EngineError::NoChoiceMatched { .. } => "NoChoiceMatched",
            EngineError::UnknownTransition { .. } => "UnknownTransition",
            EngineError::StateFailed { .. } => "StateFailed",
            EngineError::StateUnknown { .. } => "StateUnknown",
            EngineError::BranchFailed { .. } => "BranchFailed",
            EngineError::FailEnd { .. } => "FailEnd",
            EngineError::CompensationIncomplete { .. } => "CompensationIncomplete",
            EngineError::Timeout(_) => "Timeout",
            EngineError::Expression(_) => "ExpressionError",
            EngineError::Store(_) => "StoreError",
            EngineError::InstanceLocked(_) => "InstanceLocked",
            EngineError::OperationDenied(_) => "OperationDenied",
            EngineError::Coordinator(_) => "CoordinatorError",
            EngineError::AsyncUnavailable(_) => "AsyncUnavailable",
            EngineError::InstanceAborted { .. } => "InstanceAborted",
            EngineError::Internal(_) => "Internal",
        }
    }

    /// Errores de definición: la ejecución no puede continuar por un fallo del
    /// grafo o de sus expresiones, no del trabajo de un servicio.
    pub fn is_definition_error(&self) -> bool {
        match self {
            EngineError::InvalidDefinition(_)
            | EngineError::StateMachineNotFound { .. }
            | EngineError::NoChoiceMatched { .. }
            | EngineError::UnknownTransition { .. }
            | EngineError::Expression(_) => true,
            EngineError::BranchFailed { cause, .. } => cause.is_definition_error(),
            _ => false,
        }
    }

    /// Fallo de ejecución que dispara la estrategia de recuperación de la máquina.
    pub fn is_execution_failure(&self) -> bool {
        match self {
            EngineError::StateFailed { .. } => true,
            EngineError::BranchFailed { cause, .. } => cause.is_execution_failure(),
            _ => false,
        }
    }

    /// Algún estado quedó con resultado desconocido.
    pub fn is_unknown_outcome(&self) -> bool {
        match self {
            EngineError::StateUnknown { .. } => true,
            EngineError::BranchFailed { cause, .. } => cause.is_unknown_outcome(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool { matches!(self, EngineError::Timeout(_)) }

    /// Desenvuelve `InstanceAborted` hasta la causa original.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::InstanceAborted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Error persistido junto a la instancia o al estado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(),
               message: message.into() }
    }
}

impl From<&EngineError> for ErrorRecord {
    fn from(e: &EngineError) -> Self {
        match e {
            EngineError::FailEnd { code, message, .. } => ErrorRecord::new(code.clone(), message.clone()),
            other => ErrorRecord::new(other.code(), other.to_string()),
        }
    }
}

impl From<&ServiceError> for ErrorRecord {
    fn from(e: &ServiceError) -> Self { ErrorRecord::new(e.kind.clone(), e.message.clone()) }
}
