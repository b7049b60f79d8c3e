//! Despacho de estados.
//!
//! Cada tipo de estado tiene su handler; todos devuelven a dónde seguir
//! (`Flow`) o el error que detiene el camino. Tareas, scripts y sub-máquinas
//! comparten el bucle de intentos (reglas de estado, retry, persistencia).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use rayon::prelude::*;
use serde_json::{json, Map, Value};

use super::execution::{Execution, Frame, Outcome};
use crate::constants::{business_key_var, ERROR_SCRIPT, ERROR_SERVICE_NOT_FOUND, ERROR_STATUS_MATCHED_FAILED, ERROR_SUB_MACHINE_FAILED,
                       VAR_LAST_ERROR};
use crate::definition::{EndKind, EvalScope, PersistMode, State, StateKind, StateType};
use crate::errors::{EngineError, ErrorRecord};
use crate::model::{ExecutionContext, ExecutionStatus, ScopeSegment, StateInstance};
use crate::service::ServiceError;

pub(crate) enum Flow {
    Next(String),
    End(Outcome),
}

/// Resultado final del bucle de intentos de una tarea.
pub(crate) enum Attempt {
    Succeeded(Option<Value>),
    Unknown(Option<ServiceError>),
    Failed(ServiceError),
}

pub(crate) struct TaskResult {
    pub flow: Flow,
    /// Objeto producido por el mapeo de salida.
    pub mapped: Value,
}

/// Evalúa el mapeo de salida contra `output` y escribe cada clave en el contexto.
pub fn apply_output_mapping(state: &State, ctx: &mut ExecutionContext, output: Option<&Value>) -> Result<Value, EngineError> {
    let mut mapped = Map::new();
    {
        let scope = EvalScope::new(ctx).with_output(output);
        for (name, expr) in &state.output {
            mapped.insert(name.clone(), expr.eval(&scope)?);
        }
    }
    for (name, value) in &mapped {
        ctx.set(name.clone(), value.clone());
    }
    Ok(Value::Object(mapped))
}

/// Entrada de un estado: su mapeo, o el contexto completo si no declara ninguno.
pub fn eval_input(state: &State, ctx: &ExecutionContext) -> Result<Value, EngineError> {
    if state.input.is_empty() {
        return Ok(ctx.to_json());
    }
    let scope = EvalScope::new(ctx);
    let mut input = Map::new();
    for (name, expr) in &state.input {
        input.insert(name.clone(), expr.eval(&scope)?);
    }
    Ok(Value::Object(input))
}

fn next_of(state: &State) -> Flow {
    match &state.next {
        Some(n) => Flow::Next(n.clone()),
        None => Flow::End(Outcome::Succeeded),
    }
}

fn status_for_error(e: &EngineError) -> ExecutionStatus {
    if e.is_timeout() || e.is_unknown_outcome() {
        ExecutionStatus::Unknown
    } else {
        ExecutionStatus::Failed
    }
}

impl Execution<'_> {
    pub(crate) fn run_path(&self, start: &str, ctx: &mut ExecutionContext, frame: &Frame) -> Outcome {
        let mut from = start.to_string();
        let mut current = start.to_string();
        loop {
            if frame.is_cancelled() {
                return Outcome::Cancelled;
            }
            if let Err(e) = self.check_timeout() {
                return Outcome::Aborted(e);
            }
            let state = match self.machine.target(&from, &current) {
                Ok(s) => s,
                Err(e) => return Outcome::Aborted(e),
            };
            match self.dispatch(state, ctx, frame) {
                Ok(Flow::Next(next)) => {
                    from = std::mem::replace(&mut current, next);
                }
                Ok(Flow::End(Outcome::Succeeded)) => {
                    // Un éxito tardío no gana al timeout.
                    return match self.check_timeout() {
                        Ok(()) => Outcome::Succeeded,
                        Err(e) => Outcome::Aborted(e),
                    };
                }
                Ok(Flow::End(other)) => return other,
                Err(e) => return Outcome::Aborted(e),
            }
        }
    }

    fn dispatch(&self, state: &State, ctx: &mut ExecutionContext, frame: &Frame) -> Result<Flow, EngineError> {
        debug!("dispatch instance_id={} state={} type={} scope_depth={}",
               self.id(),
               state.name,
               state.state_type().code(),
               frame.scope.len());
        match &state.kind {
            StateKind::ServiceTask { .. } | StateKind::Script { .. } | StateKind::SubMachine { .. } => {
                self.run_task(state, ctx, frame).map(|r| r.flow)
            }
            StateKind::Choice { choices, default } => {
                let scope = EvalScope::new(ctx);
                for choice in choices {
                    if choice.condition.test(&scope)? {
                        return Ok(Flow::Next(choice.next.clone()));
                    }
                }
                match default {
                    Some(d) => Ok(Flow::Next(d.clone())),
                    None => Err(EngineError::NoChoiceMatched { state: state.name.clone() }),
                }
            }
            StateKind::Compensation => match self.compensate(ctx)? {
                ExecutionStatus::Succeeded => Ok(next_of(state)),
                _ => Err(EngineError::CompensationIncomplete { instance_id: self.id().to_string() }),
            },
            StateKind::Loop { .. } => self.run_loop(state, ctx, frame),
            StateKind::Parallel { .. } => self.run_parallel(state, ctx, frame),
            StateKind::End(EndKind::Succeed) => Ok(Flow::End(Outcome::Succeeded)),
            StateKind::End(EndKind::Fail { code, message }) => Ok(Flow::End(Outcome::Failed { state: state.name.clone(),
                                                                                               code: code.clone(),
                                                                                               message: message.clone() })),
        }
    }

    /// Registro previo a reabrir para este estado, si la ejecución se reanuda.
    fn resume_record(&self, state: &State, frame: &Frame) -> Option<StateInstance> {
        if frame.scope.is_empty() {
            self.plan.take_entry(&state.name)
        } else if frame.resuming {
            self.plan.nested(&frame.scope, &state.name).cloned()
        } else {
            None
        }
    }

    fn new_record(&self, state: &State, frame: &Frame, input: Value) -> StateInstance {
        let mut rec = StateInstance::begin(self.id(), 0, &state.name, state.state_type(), frame.scope.clone(), input);
        rec.for_update = state.for_update || state.state_type() == StateType::SubMachine;
        if state.state_type() == StateType::SubMachine {
            rec.sub_instance_id = Some(format!("{}:{}", self.id(), rec.id));
        }
        rec
    }

    /// Reabre un registro previo según el modo de persistencia.
    pub(crate) fn reopen_record(&self, mut previous: StateInstance, mode: PersistMode, input: Value) -> Result<StateInstance, EngineError> {
        // Una sub-máquina se reanuda siempre sobre la misma instancia hija.
        if mode == PersistMode::Update || previous.state_type == StateType::SubMachine {
            previous.restart();
            previous.input = input;
            self.update_record(&previous)?;
            return Ok(previous);
        }
        let mut fresh = StateInstance::begin(self.id(), 0, &previous.name, previous.state_type, previous.scope.clone(), input);
        fresh.for_update = previous.for_update;
        fresh.is_for_compensation = previous.is_for_compensation;
        fresh.compensated_state_id = previous.compensated_state_id.clone();
        fresh.retried_state_id = Some(previous.id.clone());
        fresh.attempts = previous.attempts + 1;
        self.insert_record(fresh)
    }

    pub(crate) fn run_task(&self, state: &State, ctx: &mut ExecutionContext, frame: &Frame) -> Result<TaskResult, EngineError> {
        let resume = self.resume_record(state, frame);
        if let Some(prev) = resume.as_ref().filter(|r| r.status == ExecutionStatus::Succeeded) {
            debug!("run_task:reuse instance_id={} state={} seq={}", self.id(), state.name, prev.seq);
            let mapped = apply_output_mapping(state, ctx, prev.output.as_ref())?;
            if let Some(key) = &prev.business_key {
                ctx.set(business_key_var(&state.name), Value::String(key.clone()));
            }
            return Ok(TaskResult { flow: next_of(state),
                                   mapped });
        }
        let input = eval_input(state, ctx)?;
        let business_key = match &state.business_key {
            Some(expr) => key_to_string(expr.eval(&EvalScope::new(ctx))?),
            None => None,
        };
        let mode = self.machine.retry_mode_for(state, self.config.retry_persist_mode);
        let record = match resume {
            Some(prev) => self.reopen_record(prev, mode, input.clone())?,
            None => {
                let mut rec = self.new_record(state, frame, input.clone());
                rec.business_key = business_key.clone();
                self.insert_record(rec)?
            }
        };
        let (record, attempt) = self.attempt_loop(state, ctx, record, &input, mode, true)?;
        match attempt {
            Attempt::Succeeded(output) => {
                let mapped = apply_output_mapping(state, ctx, output.as_ref())?;
                if let Some(key) = &record.business_key {
                    ctx.set(business_key_var(&state.name), Value::String(key.clone()));
                }
                Ok(TaskResult { flow: next_of(state),
                                mapped })
            }
            Attempt::Unknown(error) => Err(EngineError::StateUnknown { state: state.name.clone(),
                                                                       error }),
            Attempt::Failed(error) => {
                if frame.catches_enabled {
                    if let Some(catch) = state.catch_for(&error.kind) {
                        debug!("run_task:caught instance_id={} state={} kind={} next={}",
                               self.id(),
                               state.name,
                               error.kind,
                               catch.next);
                        ctx.set(VAR_LAST_ERROR,
                                json!({ "state": state.name, "kind": error.kind, "message": error.message }));
                        return Ok(TaskResult { flow: Flow::Next(catch.next.clone()),
                                               mapped: Value::Null });
                    }
                }
                Err(EngineError::StateFailed { state: state.name.clone(),
                                               error })
            }
        }
    }

    /// Invoca hasta obtener un resultado definitivo, aplicando las reglas de
    /// retry del estado. Cada cierre de intento queda persistido.
    pub(crate) fn attempt_loop(&self,
                               state: &State,
                               ctx: &mut ExecutionContext,
                               mut record: StateInstance,
                               input: &Value,
                               mode: PersistMode,
                               forward: bool)
                               -> Result<(StateInstance, Attempt), EngineError> {
        let mut retries = 0u32;
        loop {
            let result = self.invoke(state, &record, input, ctx);
            let status = decide_state_status(state, ctx, &result)?;
            match status {
                ExecutionStatus::Succeeded => {
                    let output = result.ok();
                    record.output = output.clone();
                    record.finish(ExecutionStatus::Succeeded);
                    self.update_record(&record)?;
                    return Ok((record, Attempt::Succeeded(output)));
                }
                ExecutionStatus::Unknown | ExecutionStatus::Running => {
                    let error = result.as_ref().err().cloned();
                    record.output = result.ok();
                    record.error = error.as_ref().map(ErrorRecord::from);
                    record.finish(ExecutionStatus::Unknown);
                    self.update_record(&record)?;
                    return Ok((record, Attempt::Unknown(error)));
                }
                ExecutionStatus::Failed => {
                    let error = match result {
                        Err(e) => e,
                        Ok(out) => {
                            record.output = Some(out);
                            ServiceError::new(ERROR_STATUS_MATCHED_FAILED, format!("state '{}' output matched a failure rule", state.name))
                        }
                    };
                    record.error = Some(ErrorRecord::from(&error));
                    record.finish(ExecutionStatus::Failed);
                    self.update_record(&record)?;
                    let rule = match state.kind {
                        StateKind::SubMachine { .. } => None,
                        _ => state.retry_rule_for(&error.kind),
                    };
                    match rule {
                        Some(rule) if retries < rule.max_attempts => {
                            retries += 1;
                            let delay = rule.delay_for(retries);
                            warn!("retry instance_id={} state={} kind={} retry={}/{} delay_ms={}",
                                  self.id(),
                                  state.name,
                                  error.kind,
                                  retries,
                                  rule.max_attempts,
                                  delay.as_millis());
                            if !delay.is_zero() {
                                std::thread::sleep(delay);
                            }
                            if forward {
                                self.check_timeout()?;
                            }
                            record = self.reopen_record(record, mode, input.clone())?;
                        }
                        _ => return Ok((record, Attempt::Failed(error))),
                    }
                }
            }
        }
    }

    fn invoke(&self, state: &State, record: &StateInstance, input: &Value, ctx: &mut ExecutionContext) -> Result<Value, ServiceError> {
        match &state.kind {
            StateKind::ServiceTask { service, method } => match self.engine.services.get(service) {
                Some(svc) => svc.invoke(method, input),
                None => Err(ServiceError::new(ERROR_SERVICE_NOT_FOUND, format!("service '{service}' is not registered"))),
            },
            StateKind::Script { expression } => {
                ctx.push_scope();
                if let Value::Object(vars) = input {
                    for (k, v) in vars {
                        ctx.set(k.clone(), v.clone());
                    }
                }
                let result = expression.eval(&EvalScope::new(ctx));
                ctx.pop_scope();
                result.map_err(|e| ServiceError::new(ERROR_SCRIPT, e.to_string()))
            }
            StateKind::SubMachine { machine } => self.invoke_sub_machine(machine, record, input),
            _ => Err(ServiceError::new("NotInvocable", format!("state '{}' is not a task", state.name))),
        }
    }

    fn invoke_sub_machine(&self, machine: &str, record: &StateInstance, input: &Value) -> Result<Value, ServiceError> {
        let Some(child_id) = record.sub_instance_id.as_deref() else {
            return Err(ServiceError::new(ERROR_SUB_MACHINE_FAILED, "sub-machine record without child id"));
        };
        let child = match self.engine.run_sub_machine(self, machine, child_id, input) {
            Ok(child) => child,
            Err(e) => return Err(ServiceError::new(ERROR_SUB_MACHINE_FAILED, e.to_string())),
        };
        let detail = format!("sub-machine '{machine}' instance '{}' ended {} (compensation {:?})",
                             child.id,
                             child.status.code(),
                             child.compensation_status.map(|c| c.code()));
        match (child.status, child.compensation_status) {
            (ExecutionStatus::Succeeded, None) => Ok(child.end_params.unwrap_or_else(|| json!({}))),
            (_, Some(_)) | (ExecutionStatus::Failed, None) => Err(ServiceError::new(ERROR_SUB_MACHINE_FAILED, detail)),
            _ => Err(ServiceError::unknown(ERROR_SUB_MACHINE_FAILED, detail)),
        }
    }

    /// Abre (o reabre) el registro de un contenedor; el flag indica si venía de una ejecución previa.
    fn open_container(&self, state: &State, frame: &Frame, input: Value) -> Result<(StateInstance, bool), EngineError> {
        match self.resume_record(state, frame) {
            Some(mut prev) => {
                if prev.status != ExecutionStatus::Succeeded {
                    prev.restart();
                    self.update_record(&prev)?;
                }
                Ok((prev, true))
            }
            None => Ok((self.insert_record(self.new_record(state, frame, input))?, false)),
        }
    }

    fn close_container_with_error(&self, mut container: StateInstance, e: EngineError) -> Result<Flow, EngineError> {
        container.error = Some(ErrorRecord::from(&e));
        container.finish(status_for_error(&e));
        self.update_record(&container)?;
        Err(e)
    }

    fn run_loop(&self, state: &State, ctx: &mut ExecutionContext, frame: &Frame) -> Result<Flow, EngineError> {
        let StateKind::Loop { collection, element_var, index_var, body } = &state.kind else {
            return Err(EngineError::Internal(format!("state '{}' is not a loop", state.name)));
        };
        let items = match ctx.get_path(collection) {
            Some(Value::Array(items)) => items.clone(),
            other => {
                return Err(EngineError::Expression(format!("loop '{}' collection '{collection}' is not an array: {other:?}", state.name)))
            }
        };
        let body_state = self.machine.target(&state.name, body)?;
        let (mut container, resumed) = self.open_container(state, frame, json!({ "collection": collection, "size": items.len() }))?;
        if container.status == ExecutionStatus::Succeeded {
            apply_output_mapping(state, ctx, container.output.as_ref())?;
            return Ok(next_of(state));
        }
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut child = frame.child(ScopeSegment::Iteration { state: state.name.clone(),
                                                                  index },
                                        resumed);
            child.catches_enabled = false;
            if let Err(e) = self.check_timeout() {
                return self.close_container_with_error(container, e);
            }
            ctx.push_scope();
            ctx.set(element_var.clone(), item);
            ctx.set(index_var.clone(), json!(index));
            let outcome = self.run_task(body_state, ctx, &child);
            ctx.pop_scope();
            match outcome {
                Ok(r) => results.push(r.mapped),
                Err(e) => {
                    debug!("loop:iteration_failed instance_id={} loop={} index={index} err={e}", self.id(), state.name);
                    return self.close_container_with_error(container, e);
                }
            }
        }
        let output = Value::Array(results);
        container.output = Some(output.clone());
        container.finish(ExecutionStatus::Succeeded);
        self.update_record(&container)?;
        apply_output_mapping(state, ctx, Some(&output))?;
        Ok(next_of(state))
    }

    fn run_parallel(&self, state: &State, ctx: &mut ExecutionContext, frame: &Frame) -> Result<Flow, EngineError> {
        let StateKind::Parallel { branches, fail_fast } = &state.kind else {
            return Err(EngineError::Internal(format!("state '{}' is not a parallel", state.name)));
        };
        let (mut container, resumed) = self.open_container(state, frame, json!({ "branches": branches }))?;
        if container.status == ExecutionStatus::Succeeded {
            merge_branch_locals(ctx, container.output.as_ref());
            apply_output_mapping(state, ctx, container.output.as_ref())?;
            return Ok(next_of(state));
        }
        let cancel = if *fail_fast { Some(Arc::new(AtomicBool::new(false))) } else { frame.cancel.clone() };
        let snapshot: &ExecutionContext = ctx;
        let fan_out = || -> Vec<(Outcome, IndexMap<String, Value>)> {
            // Una tarea por rama: todas arrancan a la vez si el pool tiene hilos libres.
            branches.par_iter()
                    .with_max_len(1)
                    .enumerate()
                    .map(|(index, start)| {
                        let mut branch_frame = frame.child(ScopeSegment::Branch { state: state.name.clone(),
                                                                                  index },
                                                           resumed);
                        branch_frame.cancel = cancel.clone();
                        let mut branch_ctx = snapshot.fork();
                        let outcome = self.run_path(start, &mut branch_ctx, &branch_frame);
                        if *fail_fast && matches!(outcome, Outcome::Aborted(_) | Outcome::Failed { .. }) {
                            if let Some(flag) = &cancel {
                                flag.store(true, Ordering::SeqCst);
                            }
                        }
                        (outcome, branch_ctx.into_local())
                    })
                    .collect()
        };
        let results = match &self.engine.branch_pool {
            Some(pool) => pool.install(fan_out),
            None => fan_out(),
        };

        let mut failure: Option<EngineError> = None;
        let mut locals = Vec::with_capacity(results.len());
        for (index, (outcome, local)) in results.into_iter().enumerate() {
            let cause = match outcome {
                Outcome::Succeeded => {
                    locals.push(local);
                    continue;
                }
                Outcome::Cancelled => continue,
                Outcome::Failed { state: end, code, message } => EngineError::FailEnd { state: end, code, message },
                Outcome::Aborted(e) => e,
            };
            if failure.is_none() {
                failure = Some(match cause {
                                   e @ (EngineError::Timeout(_) | EngineError::Store(_)) => e,
                                   e => EngineError::BranchFailed { state: state.name.clone(),
                                                                    index,
                                                                    cause: Box::new(e) },
                               });
            }
        }
        if let Some(e) = failure {
            return self.close_container_with_error(container, e);
        }
        if locals.len() != branches.len() {
            let e = EngineError::Internal(format!("parallel '{}' cancelled without a failing branch", state.name));
            return self.close_container_with_error(container, e);
        }
        let output = Value::Array(locals.iter()
                                        .map(|l| Value::Object(l.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
                                        .collect());
        for local in locals {
            ctx.merge(local);
        }
        container.output = Some(output.clone());
        container.finish(ExecutionStatus::Succeeded);
        self.update_record(&container)?;
        apply_output_mapping(state, ctx, Some(&output))?;
        Ok(next_of(state))
    }
}

fn merge_branch_locals(ctx: &mut ExecutionContext, output: Option<&Value>) {
    if let Some(Value::Array(locals)) = output {
        for local in locals {
            if let Value::Object(vars) = local {
                for (k, v) in vars {
                    ctx.set(k.clone(), v.clone());
                }
            }
        }
    }
}

/// Estado de un intento: reglas declaradas (primera que coincide) o, sin
/// coincidencia, éxito / desconocido / fallo según el resultado.
pub(crate) fn decide_state_status(state: &State, ctx: &ExecutionContext, result: &Result<Value, ServiceError>) -> Result<ExecutionStatus, EngineError> {
    if !state.status_rules.is_empty() {
        let scope = EvalScope::new(ctx).with_output(result.as_ref().ok())
                                       .with_error(result.as_ref().err());
        for rule in &state.status_rules {
            if rule.condition.test(&scope)? {
                return Ok(rule.status);
            }
        }
    }
    Ok(match result {
        Ok(_) => ExecutionStatus::Succeeded,
        Err(e) if e.outcome_unknown => ExecutionStatus::Unknown,
        Err(_) => ExecutionStatus::Failed,
    })
}

fn key_to_string(v: Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
