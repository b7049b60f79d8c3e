//! Reglas de decisión de estado.
//!
//! El estado final de una instancia se deriva de sus registros forward (el
//! último por ámbito y nombre) y del error con el que terminó la ejecución.

use std::collections::HashMap;

use crate::coordinator::GlobalStatus;
use crate::errors::EngineError;
use crate::model::{ExecutionStatus, ScopeSegment, StateInstance, StateMachineInstance};

/// Estado forward de la instancia:
/// - algún estado `Unknown` (o sin cerrar) -> `Unknown`;
/// - algún estado fallido -> `Unknown` si un estado de actualización tuvo éxito, si no `Failed`;
/// - sin fallos ni error -> `Succeeded`;
/// - timeout o resultado desconocido -> `Unknown`;
/// - otro error -> misma regla de actualización.
pub fn decide_forward_status(states: &[StateInstance], error: Option<&EngineError>) -> ExecutionStatus {
    let mut latest: HashMap<(&[ScopeSegment], &str), &StateInstance> = HashMap::new();
    for s in states.iter().filter(|s| !s.is_for_compensation && !s.state_type.is_container()) {
        latest.insert((s.scope.as_slice(), s.name.as_str()), s);
    }
    let mut unknown = false;
    let mut unsuccessful = false;
    let mut updated = false;
    for s in latest.values() {
        match s.status {
            ExecutionStatus::Unknown | ExecutionStatus::Running => unknown = true,
            ExecutionStatus::Failed => unsuccessful = true,
            ExecutionStatus::Succeeded => updated |= s.for_update,
        }
    }
    if unknown {
        return ExecutionStatus::Unknown;
    }
    let by_updates = if updated { ExecutionStatus::Unknown } else { ExecutionStatus::Failed };
    if unsuccessful {
        return by_updates;
    }
    match error {
        None => ExecutionStatus::Succeeded,
        Some(e) if e.is_timeout() || e.is_unknown_outcome() => ExecutionStatus::Unknown,
        Some(_) => by_updates,
    }
}

/// Estado global que se informa al coordinador al terminar una operación.
pub fn decide_global_status(instance: &StateMachineInstance, error: Option<&EngineError>) -> GlobalStatus {
    match instance.compensation_status {
        Some(ExecutionStatus::Succeeded) => GlobalStatus::Rollbacked,
        Some(ExecutionStatus::Failed) => GlobalStatus::RollbackFailed,
        Some(_) => GlobalStatus::RollbackRetrying,
        None => match instance.status {
            ExecutionStatus::Succeeded => GlobalStatus::Committed,
            ExecutionStatus::Failed => GlobalStatus::Rollbacked,
            ExecutionStatus::Running => GlobalStatus::Begin,
            ExecutionStatus::Unknown if error.is_some_and(EngineError::is_timeout) => GlobalStatus::TimeoutRollbacking,
            ExecutionStatus::Unknown => GlobalStatus::CommitRetrying,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StateType;
    use crate::service::ServiceError;
    use serde_json::json;
    use std::time::Duration;

    fn rec(seq: u64, name: &str, status: ExecutionStatus, for_update: bool) -> StateInstance {
        let mut s = StateInstance::begin("i", seq, name, StateType::ServiceTask, vec![], json!({}));
        s.status = status;
        s.for_update = for_update;
        s
    }

    #[test]
    fn failure_after_update_is_unknown() {
        let states = vec![rec(0, "foo", ExecutionStatus::Succeeded, true), rec(1, "bar", ExecutionStatus::Failed, false)];
        assert_eq!(decide_forward_status(&states, None), ExecutionStatus::Unknown);
    }

    #[test]
    fn failure_without_update_is_failed() {
        let states = vec![rec(0, "foo", ExecutionStatus::Succeeded, false), rec(1, "bar", ExecutionStatus::Failed, false)];
        assert_eq!(decide_forward_status(&states, None), ExecutionStatus::Failed);
    }

    #[test]
    fn retried_state_counts_only_latest_attempt() {
        let states = vec![rec(0, "bar", ExecutionStatus::Failed, true), rec(1, "bar", ExecutionStatus::Succeeded, true)];
        assert_eq!(decide_forward_status(&states, None), ExecutionStatus::Succeeded);
    }

    #[test]
    fn timeout_is_unknown_even_when_all_succeeded() {
        let states = vec![rec(0, "foo", ExecutionStatus::Succeeded, false)];
        assert_eq!(decide_forward_status(&states, Some(&EngineError::Timeout(Duration::from_millis(1)))),
                   ExecutionStatus::Unknown);
    }

    #[test]
    fn unknown_state_wins() {
        let states = vec![rec(0, "foo", ExecutionStatus::Unknown, false), rec(1, "bar", ExecutionStatus::Failed, false)];
        let err = EngineError::StateFailed { state: "bar".into(),
                                             error: ServiceError::new("x", "y") };
        assert_eq!(decide_forward_status(&states, Some(&err)), ExecutionStatus::Unknown);
    }

    #[test]
    fn global_status_follows_compensation_first() {
        let mut inst = StateMachineInstance::new("i".into(), "m", "t", "h", json!({}));
        inst.status = ExecutionStatus::Unknown;
        assert_eq!(decide_global_status(&inst, None), GlobalStatus::CommitRetrying);
        assert_eq!(decide_global_status(&inst, Some(&EngineError::Timeout(Duration::ZERO))),
                   GlobalStatus::TimeoutRollbacking);
        inst.compensation_status = Some(ExecutionStatus::Succeeded);
        assert_eq!(decide_global_status(&inst, None), GlobalStatus::Rollbacked);
        inst.compensation_status = Some(ExecutionStatus::Unknown);
        assert_eq!(decide_global_status(&inst, None), GlobalStatus::RollbackRetrying);
    }
}
