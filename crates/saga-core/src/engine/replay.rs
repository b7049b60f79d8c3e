//! Reconstrucción del contexto y del punto de reanudación desde el log.
//!
//! El contexto se rehace aplicando, en orden de `seq`, los mapeos de salida de
//! los registros de nivel superior que terminaron con éxito sobre los
//! parámetros de arranque. Los registros anidados (iteraciones, ramas) sólo
//! sirven para reanudar el contenedor que los agrupa.

use std::collections::HashMap;
use std::sync::Mutex;

use log::warn;
use serde_json::Value;

use super::executor::apply_output_mapping;
use crate::constants::business_key_var;
use crate::definition::{StateMachine, StateType};
use crate::errors::EngineError;
use crate::model::{ExecutionContext, ExecutionStatus, ScopeSegment, StateInstance, StateMachineInstance};

pub fn rebuild_context(machine: &StateMachine, instance: &StateMachineInstance) -> Result<ExecutionContext, EngineError> {
    let mut ctx = ExecutionContext::from_json(&instance.start_params);
    for rec in instance.forward_states()
                       .filter(|r| r.is_top_level() && r.status == ExecutionStatus::Succeeded)
    {
        let Some(state) = machine.state(&rec.name) else {
            warn!("replay:missing_state instance_id={} state={} (definition changed?)", instance.id, rec.name);
            continue;
        };
        if rec.state_type == StateType::Parallel {
            if let Some(Value::Array(locals)) = &rec.output {
                for local in locals {
                    if let Value::Object(vars) = local {
                        for (k, v) in vars {
                            ctx.set(k.clone(), v.clone());
                        }
                    }
                }
            }
        }
        apply_output_mapping(state, &mut ctx, rec.output.as_ref())?;
        if let Some(key) = &rec.business_key {
            ctx.set(business_key_var(&rec.name), Value::String(key.clone()));
        }
    }
    Ok(ctx)
}

/// Dónde reanuda `forward`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumePoint {
    /// Ejecutar desde este estado; `entry` es el registro a reabrir si lo hay.
    At { state: String, entry: Option<StateInstance> },
    /// Todos los registros terminaron bien y el último no tiene siguiente.
    Completed,
}

pub fn resume_point(machine: &StateMachine, instance: &StateMachineInstance) -> ResumePoint {
    let last = instance.forward_states().filter(|r| r.is_top_level()).last();
    match last {
        None => ResumePoint::At { state: machine.start_state.clone(),
                                  entry: None },
        Some(rec) if rec.status != ExecutionStatus::Succeeded => ResumePoint::At { state: rec.name.clone(),
                                                                                   entry: Some(rec.clone()) },
        Some(rec) => match machine.state(&rec.name).and_then(|s| s.next.clone()) {
            Some(next) => ResumePoint::At { state: next, entry: None },
            None => ResumePoint::Completed,
        },
    }
}

/// Registros previos disponibles para una ejecución reanudada.
#[derive(Debug, Default)]
pub struct ResumePlan {
    entry: Mutex<Option<StateInstance>>,
    nested: HashMap<(Vec<ScopeSegment>, String), StateInstance>,
}

impl ResumePlan {
    pub fn empty() -> Self { Self::default() }

    pub fn new(entry: Option<StateInstance>, instance: &StateMachineInstance) -> Self {
        let mut nested = HashMap::new();
        for rec in instance.forward_states().filter(|r| !r.is_top_level()) {
            nested.insert((rec.scope.clone(), rec.name.clone()), rec.clone());
        }
        Self { entry: Mutex::new(entry),
               nested }
    }

    /// El registro de entrada sólo se entrega una vez, al primer estado despachado.
    pub fn take_entry(&self, name: &str) -> Option<StateInstance> {
        let mut slot = self.entry.lock().ok()?;
        match slot.take() {
            Some(rec) if rec.name == name => Some(rec),
            _ => None,
        }
    }

    pub fn nested(&self, scope: &[ScopeSegment], name: &str) -> Option<&StateInstance> {
        self.nested.get(&(scope.to_vec(), name.to_string()))
    }
}
