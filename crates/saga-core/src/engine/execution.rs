//! Una ejecución en curso: instancia en memoria, escritura ordenada en el log
//! y cierre de la instancia al terminar.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use log::{debug, info, warn};

use super::config::EngineConfig;
use super::core::EngineInner;
use super::replay::ResumePlan;
use super::status::{decide_forward_status, decide_global_status};
use crate::definition::{RecoverStrategy, StateMachine};
use crate::errors::{EngineError, ErrorRecord};
use crate::model::{ExecutionContext, ExecutionStatus, ScopeSegment, StateInstance, StateMachineInstance};

/// Cómo terminó un camino del grafo.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Succeeded,
    /// Se alcanzó un estado `Fail`.
    Failed { state: String, code: String, message: String },
    Aborted(EngineError),
    /// Rama detenida porque otra falló (`fail_fast`).
    Cancelled,
}

/// Dónde se está ejecutando: ámbito para etiquetar registros y reglas locales.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub scope: Vec<ScopeSegment>,
    /// Dentro de un contenedor reanudado: se reutilizan registros anidados previos.
    pub resuming: bool,
    pub catches_enabled: bool,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Frame {
    pub fn root() -> Self {
        Self { scope: Vec::new(),
               resuming: false,
               catches_enabled: true,
               cancel: None }
    }

    pub fn child(&self, segment: ScopeSegment, resuming: bool) -> Self {
        let mut scope = self.scope.clone();
        scope.push(segment);
        Self { scope,
               resuming: self.resuming || resuming,
               catches_enabled: self.catches_enabled,
               cancel: self.cancel.clone() }
    }

    pub fn is_cancelled(&self) -> bool { self.cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst)) }
}

/// Resultado de una operación que llegó a ejecutar la instancia.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub instance: StateMachineInstance,
    pub error: Option<EngineError>,
}

impl RunOutcome {
    /// Los errores de definición se devuelven como error (con el id de la
    /// instancia); el resto viaja en la instancia (`status` + `error`).
    pub fn into_result(self) -> Result<StateMachineInstance, EngineError> {
        match self.error {
            Some(e) if e.is_definition_error() => Err(EngineError::InstanceAborted { instance_id: self.instance.id,
                                                                                   cause: Box::new(e) }),
            _ => Ok(self.instance),
        }
    }
}

pub(crate) struct Execution<'e> {
    pub engine: &'e EngineInner,
    pub machine: Arc<StateMachine>,
    pub config: EngineConfig,
    pub depth: usize,
    pub plan: ResumePlan,
    id: String,
    origin: Instant,
    instance: Mutex<StateMachineInstance>,
}

impl<'e> Execution<'e> {
    pub fn new(engine: &'e EngineInner,
               machine: Arc<StateMachine>,
               instance: StateMachineInstance,
               config: EngineConfig,
               depth: usize,
               origin: Instant,
               plan: ResumePlan)
               -> Self {
        Self { engine,
               machine,
               config,
               depth,
               plan,
               id: instance.id.clone(),
               origin,
               instance: Mutex::new(instance) }
    }

    pub fn id(&self) -> &str { &self.id }

    pub fn origin(&self) -> Instant { self.origin }

    fn lock(&self) -> Result<MutexGuard<'_, StateMachineInstance>, EngineError> {
        self.instance
            .lock()
            .map_err(|_| EngineError::Internal(format!("instance {} state poisoned", self.id)))
    }

    pub fn snapshot(&self) -> Result<StateMachineInstance, EngineError> { Ok(self.lock()?.clone()) }

    pub fn compensation_status(&self) -> Result<Option<ExecutionStatus>, EngineError> { Ok(self.lock()?.compensation_status) }

    /// Inserta un registro nuevo asignando `seq`. El lock de la instancia se
    /// mantiene durante la escritura: el log recibe los registros en orden.
    pub fn insert_record(&self, mut record: StateInstance) -> Result<StateInstance, EngineError> {
        let mut inst = self.lock()?;
        record.machine_instance_id = inst.id.clone();
        record.seq = inst.next_seq();
        inst.stamp_completion(&mut record);
        debug!("record_state:start instance_id={} state={} seq={} compensation={}",
               inst.id, record.name, record.seq, record.is_for_compensation);
        self.engine.store.record_state_started(&record)?;
        inst.upsert_state(record.clone());
        Ok(record)
    }

    /// Persiste un cambio de registro. Al cerrarse recibe su `end_seq` bajo el
    /// lock de la instancia, así el orden de finalización es total.
    pub fn update_record(&self, record: &StateInstance) -> Result<(), EngineError> {
        let mut inst = self.lock()?;
        let mut record = record.clone();
        inst.stamp_completion(&mut record);
        debug!("record_state:update instance_id={} state={} seq={} status={}",
               inst.id,
               record.name,
               record.seq,
               record.status.code());
        self.engine.store.record_state_updated(&record)?;
        inst.upsert_state(record);
        Ok(())
    }

    pub fn update_header(&self, f: impl FnOnce(&mut StateMachineInstance)) -> Result<StateMachineInstance, EngineError> {
        let mut inst = self.lock()?;
        f(&mut inst);
        inst.updated_at = Utc::now();
        self.engine.store.record_machine_updated(&inst)?;
        Ok(inst.clone())
    }

    pub fn check_timeout(&self) -> Result<(), EngineError> {
        let timeout = self.config.trans_operation_timeout;
        if self.origin.elapsed() > timeout {
            warn!("timeout instance_id={} elapsed_ms={} limit_ms={}",
                  self.id,
                  self.origin.elapsed().as_millis(),
                  timeout.as_millis());
            return Err(EngineError::Timeout(timeout));
        }
        Ok(())
    }

    /// Ejecuta desde `from` hasta un final y cierra la instancia.
    pub fn drive(&self, from: &str, ctx: &mut ExecutionContext) -> Result<RunOutcome, EngineError> {
        let outcome = self.run_path(from, ctx, &Frame::root());
        self.finish(outcome, ctx)
    }

    /// Decide estado final, compensa si corresponde, persiste e informa al coordinador.
    pub fn finish(&self, outcome: Outcome, ctx: &mut ExecutionContext) -> Result<RunOutcome, EngineError> {
        let (error, fail_end) = match outcome {
            Outcome::Succeeded => (None, false),
            Outcome::Failed { state, code, message } => (Some(EngineError::FailEnd { state, code, message }), true),
            Outcome::Aborted(e) => (Some(e), false),
            Outcome::Cancelled => (Some(EngineError::Internal("top-level path cancelled".into())), false),
        };
        if let Some(EngineError::Store(e)) = &error {
            // Sin log no hay estado fiable que registrar.
            warn!("finish:store_error instance_id={} err={e}", self.id);
            return Err(EngineError::Store(e.clone()));
        }
        if let Some(e) = &error {
            let auto = e.is_execution_failure() && self.machine.recover_strategy == RecoverStrategy::Compensate;
            if auto && self.compensation_status()?.is_none() {
                info!("finish:auto_compensate instance_id={} cause={e}", self.id);
                self.compensate(ctx)?;
            }
        }
        let end_params = ctx.to_json();
        let instance = self.update_header(|inst| {
                               let status = if fail_end && inst.compensation_status.is_none() {
                                   ExecutionStatus::Failed
                               } else {
                                   decide_forward_status(&inst.states, error.as_ref())
                               };
                               inst.status = status;
                               inst.end_params = Some(end_params);
                               inst.error = error.as_ref().map(ErrorRecord::from);
                               inst.ended_at = Some(Utc::now());
                           })?;
        info!("finish instance_id={} machine={} status={} compensation={:?} error={:?}",
              instance.id,
              instance.machine_name,
              instance.status.code(),
              instance.compensation_status.map(|c| c.code()),
              error.as_ref().map(|e| e.code()));
        self.report_global(&instance, error.as_ref());
        Ok(RunOutcome { instance, error })
    }

    /// Sólo las instancias raíz tienen transacción global propia.
    pub fn report_global(&self, instance: &StateMachineInstance, error: Option<&EngineError>) {
        if !instance.is_root() {
            return;
        }
        let status = decide_global_status(instance, error);
        if let Err(e) = self.engine.coordinator.report(&instance.id, status) {
            warn!("coordinator:report_failed instance_id={} status={status:?} err={e}", instance.id);
        }
    }
}
