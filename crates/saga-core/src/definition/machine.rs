//! Grafo de definición de una máquina de estados.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::state::{PersistMode, State, StateKind, StateType};
use crate::constants::{DEFAULT_TENANT, ENGINE_VERSION};
use crate::errors::EngineError;
use crate::hashing::hash_value;

/// Qué hacer ante un fallo de ejecución no capturado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecoverStrategy {
    /// Compensa inmediatamente lo ejecutado.
    #[default]
    Compensate,
    /// Deja la instancia en `Unknown` para reanudarla con `forward`.
    Forward,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachine {
    pub name: String,
    pub tenant_id: String,
    pub version: String,
    pub comment: Option<String>,
    pub start_state: String,
    pub states: IndexMap<String, State>,
    pub recover_strategy: RecoverStrategy,
    pub retry_persist_mode: Option<PersistMode>,
    pub compensate_persist_mode: Option<PersistMode>,
    /// Fingerprint (blake3 sobre JSON canónico); lo fija `build`.
    #[serde(default)]
    pub definition_hash: String,
}

impl StateMachine {
    pub fn builder(name: impl Into<String>) -> StateMachineBuilder { StateMachineBuilder::new(name) }

    pub fn state(&self, name: &str) -> Option<&State> { self.states.get(name) }

    /// Estado por nombre o `UnknownTransition` desde `from`.
    pub fn target(&self, from: &str, name: &str) -> Result<&State, EngineError> {
        self.states.get(name).ok_or_else(|| EngineError::UnknownTransition { from: from.to_string(),
                                                                             target: name.to_string() })
    }

    /// Modo de persistencia de reintentos: estado, máquina y luego el default del motor.
    pub fn retry_mode_for(&self, state: &State, engine_default: PersistMode) -> PersistMode {
        state.retry_persist_mode.or(self.retry_persist_mode).unwrap_or(engine_default)
    }

    pub fn compensate_mode_for(&self, state: &State, engine_default: PersistMode) -> PersistMode {
        state.compensate_persist_mode.or(self.compensate_persist_mode).unwrap_or(engine_default)
    }

    /// Verifica la coherencia estructural del grafo.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidDefinition("state machine name is empty".into()));
        }
        if !self.states.contains_key(&self.start_state) {
            return Err(EngineError::InvalidDefinition(format!("start state '{}' does not exist", self.start_state)));
        }
        for (key, state) in &self.states {
            if key != &state.name {
                return Err(EngineError::InvalidDefinition(format!("state registered as '{key}' is named '{}'", state.name)));
            }
            for target in state.targets() {
                if !self.states.contains_key(target) {
                    return Err(EngineError::InvalidDefinition(format!("state '{}' references unknown state '{target}'", state.name)));
                }
            }
            if let Some(comp) = &state.compensate_state {
                match self.states.get(comp).map(State::state_type) {
                    Some(StateType::ServiceTask) | Some(StateType::Script) => {}
                    Some(other) => {
                        return Err(EngineError::InvalidDefinition(format!("compensation state '{comp}' of '{}' must be a task, found {}",
                                                                          state.name,
                                                                          other.code())))
                    }
                    None => {
                        return Err(EngineError::InvalidDefinition(format!("state '{}' references unknown compensation state '{comp}'",
                                                                          state.name)))
                    }
                }
            }
            match &state.kind {
                StateKind::Loop { body, .. } => {
                    let ok = self.states.get(body).is_some_and(|b| b.state_type().is_task());
                    if !ok {
                        return Err(EngineError::InvalidDefinition(format!("loop '{}' body '{body}' must be a task state", state.name)));
                    }
                }
                StateKind::Parallel { branches, .. } if branches.is_empty() => {
                    return Err(EngineError::InvalidDefinition(format!("parallel '{}' has no branches", state.name)));
                }
                StateKind::Choice { choices, default } if choices.is_empty() && default.is_none() => {
                    return Err(EngineError::InvalidDefinition(format!("choice '{}' has no alternatives", state.name)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Calcula el fingerprint de la definición (sin el propio hash).
    pub fn compute_hash(&self) -> String {
        let mut copy = self.clone();
        copy.definition_hash.clear();
        let body = serde_json::to_value(&copy).unwrap_or(serde_json::Value::Null);
        hash_value(&json!({ "engine_version": ENGINE_VERSION, "definition": body }))
    }
}

/// Builder ergonómico: `StateMachine::builder("m").start_at("a").state(..).build()`.
#[derive(Debug)]
pub struct StateMachineBuilder {
    name: String,
    tenant_id: String,
    version: String,
    comment: Option<String>,
    start_state: Option<String>,
    states: IndexMap<String, State>,
    duplicates: Vec<String>,
    recover_strategy: RecoverStrategy,
    retry_persist_mode: Option<PersistMode>,
    compensate_persist_mode: Option<PersistMode>,
}

impl StateMachineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(),
               tenant_id: DEFAULT_TENANT.to_string(),
               version: "0.0.1".to_string(),
               comment: None,
               start_state: None,
               states: IndexMap::new(),
               duplicates: Vec::new(),
               recover_strategy: RecoverStrategy::default(),
               retry_persist_mode: None,
               compensate_persist_mode: None }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = tenant.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn start_at(mut self, state: impl Into<String>) -> Self {
        self.start_state = Some(state.into());
        self
    }

    /// Añade un estado. El primero añadido es el inicial si no se indica otro.
    pub fn state(mut self, state: State) -> Self {
        if self.states.contains_key(&state.name) {
            self.duplicates.push(state.name.clone());
        } else {
            self.states.insert(state.name.clone(), state);
        }
        self
    }

    pub fn recover_strategy(mut self, strategy: RecoverStrategy) -> Self {
        self.recover_strategy = strategy;
        self
    }

    pub fn retry_persist_mode(mut self, mode: PersistMode) -> Self {
        self.retry_persist_mode = Some(mode);
        self
    }

    pub fn compensate_persist_mode(mut self, mode: PersistMode) -> Self {
        self.compensate_persist_mode = Some(mode);
        self
    }

    pub fn build(self) -> Result<StateMachine, EngineError> {
        if let Some(dup) = self.duplicates.first() {
            return Err(EngineError::InvalidDefinition(format!("duplicate state name '{dup}'")));
        }
        let start_state = match self.start_state.or_else(|| self.states.keys().next().cloned()) {
            Some(s) => s,
            None => return Err(EngineError::InvalidDefinition(format!("state machine '{}' has no states", self.name))),
        };
        let mut machine = StateMachine { name: self.name,
                                         tenant_id: self.tenant_id,
                                         version: self.version,
                                         comment: self.comment,
                                         start_state,
                                         states: self.states,
                                         recover_strategy: self.recover_strategy,
                                         retry_persist_mode: self.retry_persist_mode,
                                         compensate_persist_mode: self.compensate_persist_mode,
                                         definition_hash: String::new() };
        machine.validate()?;
        machine.definition_hash = machine.compute_hash();
        Ok(machine)
    }
}
