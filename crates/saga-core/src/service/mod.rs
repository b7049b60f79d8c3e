//! Invocación de servicios externos.
//!
//! Un `ServiceTask` nombra un servicio y un método; el motor resuelve el
//! servicio en el `ServiceRegistry` y le pasa la entrada ya mapeada.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error devuelto por un servicio.
///
/// `kind` se compara contra las reglas de retry y los `catches`.
/// `outcome_unknown` indica que el efecto pudo haberse aplicado (p.ej. un
/// timeout de lectura): el estado queda `Unknown` en vez de `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub outcome_unknown: bool,
}

impl ServiceError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(),
               message: message.into(),
               outcome_unknown: false }
    }

    pub fn unknown(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { outcome_unknown: true,
               ..Self::new(kind, message) }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}: {}", self.kind, self.message) }
}

impl std::error::Error for ServiceError {}

/// Servicio invocable por el motor. Debe ser idempotente respecto a reintentos.
pub trait ServiceInvoker: Send + Sync {
    fn invoke(&self, method: &str, input: &Value) -> Result<Value, ServiceError>;
}

impl<F> ServiceInvoker for F where F: Fn(&str, &Value) -> Result<Value, ServiceError> + Send + Sync
{
    fn invoke(&self, method: &str, input: &Value) -> Result<Value, ServiceError> { self(method, input) }
}

/// Registro de servicios por nombre.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: Arc<DashMap<String, Arc<dyn ServiceInvoker>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, name: impl Into<String>, service: impl ServiceInvoker + 'static) {
        self.services.insert(name.into(), Arc::new(service));
    }

    pub fn register_arc(&self, name: impl Into<String>, service: Arc<dyn ServiceInvoker>) {
        self.services.insert(name.into(), service);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceInvoker>> { self.services.get(name).map(|s| s.value().clone()) }

    pub fn contains(&self, name: &str) -> bool { self.services.contains_key(name) }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("ServiceRegistry").field("services", &names).finish()
    }
}
