//! Contrato del log de estados (Persistence Log Adapter).
//!
//! El motor registra cada transición antes de continuar: arranque y fin de la
//! instancia, arranque y fin (o actualización) de cada registro de estado.
//! Las escrituras de una misma instancia llegan en orden de ejecución.

pub mod memory;

use crate::errors::StoreError;
use crate::model::{StateInstance, StateMachineInstance};

pub use memory::InMemoryStateLogStore;

pub trait StateLogStore: Send + Sync {
    /// Inserta la instancia. Falla con `BusinessKeyConflict` si la business key
    /// ya está ligada a una instancia no terminal del mismo tenant; en ese caso
    /// no queda ningún registro parcial.
    fn record_machine_started(&self, instance: &StateMachineInstance) -> Result<(), StoreError>;
    /// Actualiza la cabecera (estado, compensación, salida, error, timestamps).
    fn record_machine_updated(&self, instance: &StateMachineInstance) -> Result<(), StoreError>;
    /// Inserta un registro de estado nuevo.
    fn record_state_started(&self, state: &StateInstance) -> Result<(), StoreError>;
    /// Sobrescribe un registro de estado existente (fin, o reintento en modo update).
    fn record_state_updated(&self, state: &StateInstance) -> Result<(), StoreError>;

    /// Instancia con sus registros ordenados por `seq`.
    fn get_instance(&self, id: &str) -> Result<Option<StateMachineInstance>, StoreError>;
    /// Instancia más reciente ligada a la business key.
    fn get_instance_by_business_key(&self, business_key: &str, tenant_id: &str) -> Result<Option<StateMachineInstance>, StoreError>;
    fn query_instances_by_parent_id(&self, parent_id: &str) -> Result<Vec<StateMachineInstance>, StoreError>;
    /// Instancias raíz no terminales, las más antiguas primero.
    fn list_recovery_candidates(&self, limit: usize) -> Result<Vec<StateMachineInstance>, StoreError>;
}
