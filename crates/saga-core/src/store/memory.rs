use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;

use super::StateLogStore;
use crate::errors::StoreError;
use crate::model::{StateInstance, StateMachineInstance};

/// Log en memoria. Paridad de contrato con el backend Postgres.
#[derive(Default)]
pub struct InMemoryStateLogStore {
    instances: DashMap<String, StateMachineInstance>,
    business_keys: DashMap<(String, String), String>,
}

impl InMemoryStateLogStore {
    pub fn new() -> Self { Self::default() }

    pub fn instance_count(&self) -> usize { self.instances.len() }
}

impl StateLogStore for InMemoryStateLogStore {
    fn record_machine_started(&self, instance: &StateMachineInstance) -> Result<(), StoreError> {
        debug!("record_machine_started instance_id={} machine={}", instance.id, instance.machine_name);
        if self.instances.contains_key(&instance.id) {
            return Err(StoreError::Duplicate(instance.id.clone()));
        }
        if let Some(key) = &instance.business_key {
            // La entrada bloquea el shard de la clave mientras se decide.
            let entry = self.business_keys.entry((instance.tenant_id.clone(), key.clone()));
            if let Entry::Occupied(bound) = &entry {
                let holder = bound.get().clone();
                let running = self.instances.get(&holder).is_some_and(|i| i.is_running());
                if running {
                    return Err(StoreError::BusinessKeyConflict { business_key: key.clone(),
                                                                 tenant_id: instance.tenant_id.clone(),
                                                                 instance_id: holder });
                }
            }
            self.instances.insert(instance.id.clone(), instance.clone());
            entry.insert(instance.id.clone());
            return Ok(());
        }
        self.instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    fn record_machine_updated(&self, instance: &StateMachineInstance) -> Result<(), StoreError> {
        let mut stored = self.instances
                             .get_mut(&instance.id)
                             .ok_or_else(|| StoreError::NotFound(instance.id.clone()))?;
        let states = std::mem::take(&mut stored.states);
        *stored = StateMachineInstance { states, ..instance.clone() };
        Ok(())
    }

    fn record_state_started(&self, state: &StateInstance) -> Result<(), StoreError> {
        let mut stored = self.instances
                             .get_mut(&state.machine_instance_id)
                             .ok_or_else(|| StoreError::NotFound(state.machine_instance_id.clone()))?;
        if stored.states.iter().any(|s| s.id == state.id || s.seq == state.seq) {
            return Err(StoreError::Duplicate(format!("state {} seq {}", state.id, state.seq)));
        }
        stored.upsert_state(state.clone());
        Ok(())
    }

    fn record_state_updated(&self, state: &StateInstance) -> Result<(), StoreError> {
        let mut stored = self.instances
                             .get_mut(&state.machine_instance_id)
                             .ok_or_else(|| StoreError::NotFound(state.machine_instance_id.clone()))?;
        if stored.state_by_id(&state.id).is_none() {
            return Err(StoreError::NotFound(state.id.clone()));
        }
        stored.upsert_state(state.clone());
        Ok(())
    }

    fn get_instance(&self, id: &str) -> Result<Option<StateMachineInstance>, StoreError> {
        Ok(self.instances.get(id).map(|i| i.value().clone()))
    }

    fn get_instance_by_business_key(&self, business_key: &str, tenant_id: &str) -> Result<Option<StateMachineInstance>, StoreError> {
        let id = self.business_keys
                     .get(&(tenant_id.to_string(), business_key.to_string()))
                     .map(|e| e.value().clone());
        match id {
            Some(id) => self.get_instance(&id),
            None => Ok(None),
        }
    }

    fn query_instances_by_parent_id(&self, parent_id: &str) -> Result<Vec<StateMachineInstance>, StoreError> {
        let mut out: Vec<StateMachineInstance> = self.instances
                                                     .iter()
                                                     .filter(|i| i.parent_id.as_deref() == Some(parent_id))
                                                     .map(|i| i.value().clone())
                                                     .collect();
        out.sort_by_key(|i| i.started_at);
        Ok(out)
    }

    fn list_recovery_candidates(&self, limit: usize) -> Result<Vec<StateMachineInstance>, StoreError> {
        let mut out: Vec<StateMachineInstance> = self.instances
                                                     .iter()
                                                     .filter(|i| i.is_root() && i.is_running())
                                                     .map(|i| i.value().clone())
                                                     .collect();
        out.sort_by_key(|i| i.started_at);
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StateType;
    use crate::model::ExecutionStatus;
    use serde_json::json;

    fn inst(id: &str, key: Option<&str>) -> StateMachineInstance {
        let mut i = StateMachineInstance::new(id.into(), "m", "t", "h", json!({}));
        i.business_key = key.map(str::to_string);
        i
    }

    #[test]
    fn business_key_conflicts_only_while_running() {
        let store = InMemoryStateLogStore::new();
        store.record_machine_started(&inst("a", Some("k"))).unwrap();
        let err = store.record_machine_started(&inst("b", Some("k"))).unwrap_err();
        assert!(matches!(err, StoreError::BusinessKeyConflict { ref instance_id, .. } if instance_id == "a"));
        assert!(store.get_instance("b").unwrap().is_none());

        let mut done = inst("a", Some("k"));
        done.status = ExecutionStatus::Succeeded;
        store.record_machine_updated(&done).unwrap();
        store.record_machine_started(&inst("c", Some("k"))).unwrap();
        assert_eq!(store.get_instance_by_business_key("k", "t").unwrap().unwrap().id, "c");
    }

    #[test]
    fn state_updates_keep_a_single_record() {
        let store = InMemoryStateLogStore::new();
        store.record_machine_started(&inst("a", None)).unwrap();
        let mut s = StateInstance::begin("a", 0, "foo", StateType::ServiceTask, vec![], json!({}));
        store.record_state_started(&s).unwrap();
        assert!(store.record_state_started(&s).is_err());
        s.finish(ExecutionStatus::Succeeded);
        store.record_state_updated(&s).unwrap();
        let loaded = store.get_instance("a").unwrap().unwrap();
        assert_eq!(loaded.states.len(), 1);
        assert_eq!(loaded.states[0].status, ExecutionStatus::Succeeded);
    }

    #[test]
    fn header_update_preserves_states() {
        let store = InMemoryStateLogStore::new();
        store.record_machine_started(&inst("a", None)).unwrap();
        store.record_state_started(&StateInstance::begin("a", 0, "foo", StateType::ServiceTask, vec![], json!({}))).unwrap();
        let mut header = inst("a", None);
        header.status = ExecutionStatus::Unknown;
        store.record_machine_updated(&header).unwrap();
        let loaded = store.get_instance("a").unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Unknown);
        assert_eq!(loaded.states.len(), 1);
    }

    #[test]
    fn recovery_candidates_skip_terminal_and_children() {
        let store = InMemoryStateLogStore::new();
        store.record_machine_started(&inst("root", None)).unwrap();
        let mut child = inst("root:1", None);
        child.parent_id = Some("root".into());
        store.record_machine_started(&child).unwrap();
        let mut finished = inst("done", None);
        finished.status = ExecutionStatus::Succeeded;
        store.record_machine_started(&finished).unwrap();
        let ids: Vec<String> = store.list_recovery_candidates(10).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["root".to_string()]);
        assert_eq!(store.query_instances_by_parent_id("root").unwrap().len(), 1);
    }
}
