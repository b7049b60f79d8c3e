//! Registros persistidos: instancia de máquina y registros de estado.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::StateType;
use crate::errors::ErrorRecord;
use crate::model::ExecutionStatus;

/// Segmento del ámbito donde se ejecutó un registro: rama de un `Parallel` o
/// iteración de un `Loop`. El path vacío es el nivel superior de la máquina.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeSegment {
    Branch { state: String, index: usize },
    Iteration { state: String, index: usize },
}

impl ScopeSegment {
    pub fn iteration_index(&self) -> Option<usize> {
        match self {
            ScopeSegment::Iteration { index, .. } => Some(*index),
            ScopeSegment::Branch { .. } => None,
        }
    }
}

/// Registro de una ejecución (o intento) de un estado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInstance {
    pub id: String,
    pub machine_instance_id: String,
    pub seq: u64,
    pub name: String,
    pub state_type: StateType,
    #[serde(default)]
    pub scope: Vec<ScopeSegment>,
    pub status: ExecutionStatus,
    pub business_key: Option<String>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<ErrorRecord>,
    pub for_update: bool,
    pub is_for_compensation: bool,
    /// En un registro de compensación: id del registro forward que deshace.
    pub compensated_state_id: Option<String>,
    /// En modo "state-as-new": id del intento anterior.
    pub retried_state_id: Option<String>,
    pub sub_instance_id: Option<String>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Orden de finalización dentro de la instancia. Se asigna al persistir el cierre.
    #[serde(default)]
    pub end_seq: Option<u64>,
}

impl StateInstance {
    pub fn begin(machine_instance_id: &str, seq: u64, name: &str, state_type: StateType, scope: Vec<ScopeSegment>, input: Value) -> Self {
        let now = Utc::now();
        Self { id: Uuid::new_v4().to_string(),
               machine_instance_id: machine_instance_id.to_string(),
               seq,
               name: name.to_string(),
               state_type,
               scope,
               status: ExecutionStatus::Running,
               business_key: None,
               input,
               output: None,
               error: None,
               for_update: false,
               is_for_compensation: false,
               compensated_state_id: None,
               retried_state_id: None,
               sub_instance_id: None,
               attempts: 1,
               started_at: now,
               updated_at: now,
               ended_at: None,
               end_seq: None }
    }

    /// Cierra el registro con un estado final y marca timestamps.
    pub fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.ended_at = Some(now);
    }

    /// Vuelve a `Running` para un nuevo intento sobre el mismo registro.
    pub fn restart(&mut self) {
        self.status = ExecutionStatus::Running;
        self.attempts += 1;
        self.error = None;
        self.output = None;
        self.updated_at = Utc::now();
        self.ended_at = None;
        self.end_seq = None;
    }

    pub fn is_top_level(&self) -> bool { self.scope.is_empty() }

    /// Índice de iteración si el registro pertenece directamente a un bucle.
    pub fn loop_index(&self) -> Option<usize> { self.scope.last().and_then(|s| s.iteration_index()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineInstance {
    pub id: String,
    pub machine_name: String,
    pub tenant_id: String,
    pub parent_id: Option<String>,
    pub definition_hash: String,
    pub business_key: Option<String>,
    pub status: ExecutionStatus,
    pub compensation_status: Option<ExecutionStatus>,
    pub start_params: Value,
    pub end_params: Option<Value>,
    pub error: Option<ErrorRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub states: Vec<StateInstance>,
}

impl StateMachineInstance {
    pub fn new(id: String, machine_name: &str, tenant_id: &str, definition_hash: &str, start_params: Value) -> Self {
        let now = Utc::now();
        Self { id,
               machine_name: machine_name.to_string(),
               tenant_id: tenant_id.to_string(),
               parent_id: None,
               definition_hash: definition_hash.to_string(),
               business_key: None,
               status: ExecutionStatus::Running,
               compensation_status: None,
               start_params,
               end_params: None,
               error: None,
               started_at: now,
               updated_at: now,
               ended_at: None,
               states: Vec::new() }
    }

    /// Terminal: compensación `SU`/`FA`, o sin compensación y estado `SU`/`FA`.
    pub fn is_terminal(&self) -> bool {
        match self.compensation_status {
            Some(c) => c.is_final(),
            None => self.status.is_final(),
        }
    }

    pub fn is_running(&self) -> bool { !self.is_terminal() }

    pub fn is_root(&self) -> bool { self.parent_id.is_none() }

    pub fn forward_states(&self) -> impl Iterator<Item = &StateInstance> { self.states.iter().filter(|s| !s.is_for_compensation) }

    pub fn compensation_states(&self) -> impl Iterator<Item = &StateInstance> { self.states.iter().filter(|s| s.is_for_compensation) }

    /// Registros forward con ese nombre, en orden de ejecución.
    pub fn states_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StateInstance> + 'a {
        self.forward_states().filter(move |s| s.name == name)
    }

    /// Último registro de compensación que deshace `forward_id`.
    pub fn compensation_for(&self, forward_id: &str) -> Option<&StateInstance> {
        self.compensation_states()
            .filter(|s| s.compensated_state_id.as_deref() == Some(forward_id))
            .last()
    }

    pub fn state_by_id(&self, id: &str) -> Option<&StateInstance> { self.states.iter().find(|s| s.id == id) }

    /// Inserta o reemplaza un registro (por id) manteniendo el orden por `seq`.
    pub fn upsert_state(&mut self, state: StateInstance) {
        match self.states.iter_mut().find(|s| s.id == state.id) {
            Some(slot) => *slot = state,
            None => {
                self.states.push(state);
                self.states.sort_by_key(|s| s.seq);
            }
        }
    }

    pub fn next_seq(&self) -> u64 { self.states.iter().map(|s| s.seq + 1).max().unwrap_or(0) }

    pub fn next_end_seq(&self) -> u64 { self.states.iter().filter_map(|s| s.end_seq).map(|n| n + 1).max().unwrap_or(0) }

    /// Asigna `end_seq` a un registro cerrado. Un registro que ya lo tenía en el
    /// log lo conserva aunque se vuelva a escribir.
    pub fn stamp_completion(&self, record: &mut StateInstance) {
        if record.ended_at.is_none() || record.end_seq.is_some() {
            return;
        }
        let known = self.state_by_id(&record.id)
                        .filter(|s| s.ended_at.is_some())
                        .and_then(|s| s.end_seq);
        record.end_seq = Some(known.unwrap_or_else(|| self.next_end_seq()));
    }
}
