//! Estados de una máquina.
//!
//! `State` lleva las propiedades comunes (mapeos, transición, retry, catches,
//! compensación); `StateKind` es el conjunto cerrado de tipos que el executor
//! despacha.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::expr::Expr;
use crate::model::ExecutionStatus;

/// Tipo de estado tal como queda en los registros persistidos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    ServiceTask,
    Script,
    SubMachine,
    Choice,
    Loop,
    Parallel,
    CompensationTrigger,
    Succeed,
    Fail,
}

impl StateType {
    pub fn code(&self) -> &'static str {
        match self {
            StateType::ServiceTask => "ServiceTask",
            StateType::Script => "ScriptTask",
            StateType::SubMachine => "SubStateMachine",
            StateType::Choice => "Choice",
            StateType::Loop => "Loop",
            StateType::Parallel => "Parallel",
            StateType::CompensationTrigger => "CompensationTrigger",
            StateType::Succeed => "Succeed",
            StateType::Fail => "Fail",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        [StateType::ServiceTask,
         StateType::Script,
         StateType::SubMachine,
         StateType::Choice,
         StateType::Loop,
         StateType::Parallel,
         StateType::CompensationTrigger,
         StateType::Succeed,
         StateType::Fail].into_iter()
                         .find(|t| t.code() == code)
    }

    /// Estados que hacen trabajo y por tanto pueden compensarse o reintentarse.
    pub fn is_task(&self) -> bool { matches!(self, StateType::ServiceTask | StateType::Script | StateType::SubMachine) }

    /// Registros que agrupan a otros (iteraciones, ramas).
    pub fn is_container(&self) -> bool { matches!(self, StateType::Loop | StateType::Parallel) }
}

/// Cómo se persiste un reintento (o la re-ejecución de una compensación).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistMode {
    /// Se sobrescribe el registro existente.
    Update,
    /// Cada intento es un registro nuevo enlazado al anterior.
    New,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRule {
    /// Tipos de error que disparan la regla; vacío = cualquiera.
    pub errors: Vec<String>,
    /// Reintentos después del primer intento.
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub backoff_rate: f64,
}

impl RetryRule {
    pub fn new(max_attempts: u32) -> Self {
        Self { errors: Vec::new(),
               max_attempts,
               interval_ms: 0,
               backoff_rate: 1.0 }
    }

    pub fn on_errors<S: Into<String>>(mut self, errors: impl IntoIterator<Item = S>) -> Self {
        self.errors = errors.into_iter().map(Into::into).collect();
        self
    }

    pub fn interval(mut self, interval: Duration, backoff_rate: f64) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self.backoff_rate = backoff_rate;
        self
    }

    pub fn matches(&self, kind: &str) -> bool { self.errors.is_empty() || self.errors.iter().any(|e| e == kind) }

    /// Espera antes del reintento número `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_rate.max(1.0).powi(retry.saturating_sub(1) as i32);
        Duration::from_millis((self.interval_ms as f64 * factor) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catch {
    pub errors: Vec<String>,
    pub next: String,
}

impl Catch {
    pub fn matches(&self, kind: &str) -> bool { self.errors.is_empty() || self.errors.iter().any(|e| e == kind) }
}

/// Regla de decisión de estado evaluada sobre `$output`/`$error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRule {
    pub condition: Expr,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceBranch {
    pub condition: Expr,
    pub next: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EndKind {
    Succeed,
    Fail { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateKind {
    ServiceTask { service: String, method: String },
    Choice { choices: Vec<ChoiceBranch>, default: Option<String> },
    /// Dispara la compensación de lo ejecutado hasta aquí.
    Compensation,
    SubMachine { machine: String },
    Script { expression: Expr },
    Loop {
        /// Path del contexto con la colección a recorrer.
        collection: String,
        element_var: String,
        index_var: String,
        /// Estado (tarea) ejecutado una vez por elemento.
        body: String,
    },
    Parallel { branches: Vec<String>, fail_fast: bool },
    End(EndKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    pub kind: StateKind,
    pub next: Option<String>,
    pub input: IndexMap<String, Expr>,
    pub output: IndexMap<String, Expr>,
    pub retry: Vec<RetryRule>,
    pub catches: Vec<Catch>,
    pub compensate_state: Option<String>,
    pub for_update: bool,
    pub business_key: Option<Expr>,
    pub status_rules: Vec<StatusRule>,
    pub retry_persist_mode: Option<PersistMode>,
    pub compensate_persist_mode: Option<PersistMode>,
}

impl State {
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self { name: name.into(),
               kind,
               next: None,
               input: IndexMap::new(),
               output: IndexMap::new(),
               retry: Vec::new(),
               catches: Vec::new(),
               compensate_state: None,
               for_update: false,
               business_key: None,
               status_rules: Vec::new(),
               retry_persist_mode: None,
               compensate_persist_mode: None }
    }

    pub fn service_task(name: impl Into<String>, service: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(name,
                  StateKind::ServiceTask { service: service.into(),
                                           method: method.into() })
    }

    pub fn script(name: impl Into<String>, expression: Expr) -> Self { Self::new(name, StateKind::Script { expression }) }

    pub fn sub_machine(name: impl Into<String>, machine: impl Into<String>) -> Self {
        Self::new(name, StateKind::SubMachine { machine: machine.into() })
    }

    pub fn choice(name: impl Into<String>) -> Self {
        Self::new(name,
                  StateKind::Choice { choices: Vec::new(),
                                      default: None })
    }

    pub fn compensation_trigger(name: impl Into<String>) -> Self { Self::new(name, StateKind::Compensation) }

    pub fn loop_over(name: impl Into<String>, collection: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(name,
                  StateKind::Loop { collection: collection.into(),
                                    element_var: "loopElement".into(),
                                    index_var: "loopIndex".into(),
                                    body: body.into() })
    }

    pub fn parallel<S: Into<String>>(name: impl Into<String>, branches: impl IntoIterator<Item = S>) -> Self {
        Self::new(name,
                  StateKind::Parallel { branches: branches.into_iter().map(Into::into).collect(),
                                        fail_fast: false })
    }

    pub fn succeed(name: impl Into<String>) -> Self { Self::new(name, StateKind::End(EndKind::Succeed)) }

    pub fn fail(name: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name,
                  StateKind::End(EndKind::Fail { code: code.into(),
                                                 message: message.into() }))
    }

    pub fn next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.input.insert(name.into(), expr);
        self
    }

    pub fn output(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.output.insert(name.into(), expr);
        self
    }

    pub fn retry(mut self, rule: RetryRule) -> Self {
        self.retry.push(rule);
        self
    }

    pub fn catch<S: Into<String>>(mut self, errors: impl IntoIterator<Item = S>, next: impl Into<String>) -> Self {
        self.catches.push(Catch { errors: errors.into_iter().map(Into::into).collect(),
                                  next: next.into() });
        self
    }

    pub fn compensate_with(mut self, state: impl Into<String>) -> Self {
        self.compensate_state = Some(state.into());
        self
    }

    pub fn for_update(mut self, for_update: bool) -> Self {
        self.for_update = for_update;
        self
    }

    pub fn business_key(mut self, expr: Expr) -> Self {
        self.business_key = Some(expr);
        self
    }

    pub fn status_rule(mut self, condition: Expr, status: ExecutionStatus) -> Self {
        self.status_rules.push(StatusRule { condition, status });
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

    /// Añade una alternativa a un `Choice` (ignorado en otros tipos).
    pub fn when(mut self, condition: Expr, next: impl Into<String>) -> Self {
        if let StateKind::Choice { choices, .. } = &mut self.kind {
            choices.push(ChoiceBranch { condition,
                                        next: next.into() });
        }
        self
    }

    pub fn otherwise(mut self, next: impl Into<String>) -> Self {
        if let StateKind::Choice { default, .. } = &mut self.kind {
            *default = Some(next.into());
        }
        self
    }

    /// Variables del elemento e índice de un `Loop` (ignorado en otros tipos).
    pub fn loop_vars(mut self, element: impl Into<String>, index: impl Into<String>) -> Self {
        if let StateKind::Loop { element_var, index_var, .. } = &mut self.kind {
            *element_var = element.into();
            *index_var = index.into();
        }
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        if let StateKind::Parallel { fail_fast, .. } = &mut self.kind {
            *fail_fast = enabled;
        }
        self
    }

    pub fn state_type(&self) -> StateType {
        match &self.kind {
            StateKind::ServiceTask { .. } => StateType::ServiceTask,
            StateKind::Choice { .. } => StateType::Choice,
            StateKind::Compensation => StateType::CompensationTrigger,
            StateKind::SubMachine { .. } => StateType::SubMachine,
            StateKind::Script { .. } => StateType::Script,
            StateKind::Loop { .. } => StateType::Loop,
            StateKind::Parallel { .. } => StateType::Parallel,
            StateKind::End(EndKind::Succeed) => StateType::Succeed,
            StateKind::End(EndKind::Fail { .. }) => StateType::Fail,
        }
    }

    /// Todos los nombres de estado a los que este estado puede transicionar.
    pub fn targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        if let Some(n) = &self.next {
            out.push(n);
        }
        for c in &self.catches {
            out.push(&c.next);
        }
        match &self.kind {
            StateKind::Choice { choices, default } => {
                out.extend(choices.iter().map(|c| c.next.as_str()));
                if let Some(d) = default {
                    out.push(d);
                }
            }
            StateKind::Loop { body, .. } => out.push(body),
            StateKind::Parallel { branches, .. } => out.extend(branches.iter().map(String::as_str)),
            _ => {}
        }
        out
    }

    /// Regla de retry aplicable a un tipo de error, si existe.
    pub fn retry_rule_for(&self, kind: &str) -> Option<&RetryRule> { self.retry.iter().find(|r| r.matches(kind)) }

    pub fn catch_for(&self, kind: &str) -> Option<&Catch> { self.catches.iter().find(|c| c.matches(kind)) }
}
