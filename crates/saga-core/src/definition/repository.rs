//! Registro de definiciones por `(nombre, tenant)`.

use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};

use super::StateMachine;
use crate::errors::EngineError;

pub trait StateMachineRepository: Send + Sync {
    /// Valida y registra (o reemplaza) una definición.
    fn register(&self, machine: StateMachine) -> Result<Arc<StateMachine>, EngineError>;
    fn get(&self, name: &str, tenant: &str) -> Option<Arc<StateMachine>>;
}

#[derive(Default)]
pub struct InMemoryStateMachineRepository {
    machines: DashMap<(String, String), Arc<StateMachine>>,
}

impl InMemoryStateMachineRepository {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.machines.len() }

    pub fn is_empty(&self) -> bool { self.machines.is_empty() }
}

impl StateMachineRepository for InMemoryStateMachineRepository {
    fn register(&self, mut machine: StateMachine) -> Result<Arc<StateMachine>, EngineError> {
        machine.validate()?;
        machine.definition_hash = machine.compute_hash();
        let key = (machine.name.clone(), machine.tenant_id.clone());
        let machine = Arc::new(machine);
        if let Some(previous) = self.machines.insert(key, machine.clone()) {
            if previous.definition_hash != machine.definition_hash {
                warn!("register:replaced name={} tenant={} old_hash={} new_hash={}",
                      machine.name, machine.tenant_id, previous.definition_hash, machine.definition_hash);
            }
        } else {
            info!("register:new name={} tenant={} hash={}", machine.name, machine.tenant_id, machine.definition_hash);
        }
        Ok(machine)
    }

    fn get(&self, name: &str, tenant: &str) -> Option<Arc<StateMachine>> {
        self.machines.get(&(name.to_string(), tenant.to_string())).map(|m| m.value().clone())
    }
}
