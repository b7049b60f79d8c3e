//! Driver de compensación.
//!
//! Recorre los registros forward en orden inverso de finalización (`end_seq`)
//! y ejecuta el estado de compensación de cada tarea terminada con éxito que aún no tenga una
//! compensación exitosa. Una sub-máquina se compensa entera (recursivamente)
//! antes de seguir con el registro anterior. Se detiene en el primer resultado
//! que no sea éxito.

use log::{debug, info, warn};
use serde_json::{json, Value};

use super::execution::Execution;
use super::executor::{apply_output_mapping, eval_input, Attempt};
use crate::definition::{StateKind, StateType};
use crate::errors::EngineError;
use crate::model::{ExecutionContext, ExecutionStatus, ScopeSegment, StateInstance};

/// Registros sin cerrar primero; después el último en terminar. `seq` desempata.
fn completion_key(record: &StateInstance) -> (bool, u64, u64) {
    (record.end_seq.is_none(), record.end_seq.unwrap_or(0), record.seq)
}

impl Execution<'_> {
    pub(crate) fn compensate(&self, ctx: &mut ExecutionContext) -> Result<ExecutionStatus, EngineError> {
        let instance = self.update_header(|inst| inst.compensation_status = Some(ExecutionStatus::Running))?;
        info!("compensate:start instance_id={} machine={}", instance.id, instance.machine_name);

        let mut targets: Vec<StateInstance> = instance.forward_states().cloned().collect();
        targets.sort_by_key(|r| std::cmp::Reverse(completion_key(r)));

        let mut result = ExecutionStatus::Succeeded;
        for forward in &targets {
            let status = match forward.state_type {
                StateType::SubMachine => match forward.sub_instance_id.as_deref() {
                    Some(child_id) => self.engine.compensate_sub_machine(self, child_id)?,
                    None => continue,
                },
                t if t.is_task() && forward.status == ExecutionStatus::Succeeded => {
                    if self.snapshot()?
                           .compensation_for(&forward.id)
                           .is_some_and(|c| c.status == ExecutionStatus::Succeeded)
                    {
                        debug!("compensate:already_done instance_id={} state={} seq={}", self.id(), forward.name, forward.seq);
                        continue;
                    }
                    match self.compensate_one(forward, ctx)? {
                        Some(status) => status,
                        None => continue,
                    }
                }
                _ => continue,
            };
            if status != ExecutionStatus::Succeeded {
                warn!("compensate:stopped instance_id={} at state={} seq={} status={}",
                      self.id(),
                      forward.name,
                      forward.seq,
                      status.code());
                result = status;
                break;
            }
        }

        self.update_header(|inst| inst.compensation_status = Some(result))?;
        info!("compensate:end instance_id={} status={}", self.id(), result.code());
        Ok(result)
    }

    /// `None` si el estado forward no declara compensación.
    fn compensate_one(&self, forward: &StateInstance, ctx: &mut ExecutionContext) -> Result<Option<ExecutionStatus>, EngineError> {
        let Some(state) = self.machine.state(&forward.name) else {
            warn!("compensate:missing_state instance_id={} state={}", self.id(), forward.name);
            return Ok(None);
        };
        let Some(comp_name) = state.compensate_state.as_deref() else { return Ok(None) };
        let comp_state = self.machine.target(&state.name, comp_name)?;

        ctx.push_scope();
        let result = self.run_compensation_state(forward, comp_state, ctx);
        ctx.pop_scope();
        result.map(Some)
    }

    fn run_compensation_state(&self,
                              forward: &StateInstance,
                              comp_state: &crate::definition::State,
                              ctx: &mut ExecutionContext)
                              -> Result<ExecutionStatus, EngineError> {
        self.bind_iteration_vars(forward, ctx);
        if let Some(output) = &forward.output {
            ctx.set("compensatedOutput", output.clone());
        }
        let input = eval_input(comp_state, ctx)?;
        let mode = self.machine.compensate_mode_for(comp_state, self.config.compensate_persist_mode);
        let previous = self.snapshot()?.compensation_for(&forward.id).cloned();
        let record = match previous {
            Some(prev) => self.reopen_record(prev, mode, input.clone())?,
            None => {
                let mut rec = StateInstance::begin(self.id(), 0, &comp_state.name, comp_state.state_type(), forward.scope.clone(), input.clone());
                rec.is_for_compensation = true;
                rec.compensated_state_id = Some(forward.id.clone());
                rec.for_update = comp_state.for_update;
                self.insert_record(rec)?
            }
        };
        debug!("compensate:state instance_id={} forward={} seq={} compensation={}",
               self.id(),
               forward.name,
               forward.seq,
               comp_state.name);
        let (_, attempt) = self.attempt_loop(comp_state, ctx, record, &input, mode, false)?;
        Ok(match attempt {
            Attempt::Succeeded(output) => {
                apply_output_mapping(comp_state, ctx, output.as_ref())?;
                ExecutionStatus::Succeeded
            }
            Attempt::Unknown(_) => ExecutionStatus::Unknown,
            Attempt::Failed(_) => ExecutionStatus::Failed,
        })
    }

    /// Dentro de un loop, la compensación ve el elemento y el índice de la iteración compensada.
    fn bind_iteration_vars(&self, forward: &StateInstance, ctx: &mut ExecutionContext) {
        let Some(ScopeSegment::Iteration { state, index }) = forward.scope.last() else { return };
        let Some(StateKind::Loop { collection, element_var, index_var, .. }) = self.machine.state(state).map(|s| &s.kind) else {
            return;
        };
        let element = match ctx.get_path(collection) {
            Some(Value::Array(items)) => items.get(*index).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        ctx.set(element_var.clone(), element);
        ctx.set(index_var.clone(), json!(index));
    }
}
