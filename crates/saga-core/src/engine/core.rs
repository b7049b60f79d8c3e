//! Motor de máquinas de estado compensables.
//!
//! `StateMachineEngine` es la fachada pública: arranque síncrono y asíncrono,
//! reanudación (`forward` / `compensate`) y consulta de instancias. El estado
//! compartido vive en `EngineInner` detrás de un `Arc`, de modo que el motor se
//! clona barato y puede moverse a hilos de ejecución asíncrona.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::runtime::Handle;
use uuid::Uuid;

use super::config::EngineConfig;
use super::dispatch::{AsyncCallback, AsyncHandle};
use super::execution::{Execution, Outcome, RunOutcome};
use super::lock::{InstanceGuard, InstanceLocks, LockPurpose};
use super::replay::{rebuild_context, resume_point, ResumePlan, ResumePoint};
use super::status::decide_forward_status;
use super::EngineBuilderInit;
use crate::constants::DEFAULT_TENANT;
use crate::coordinator::TransactionCoordinator;
use crate::definition::{StateMachine, StateMachineRepository};
use crate::errors::{EngineError, ErrorRecord};
use crate::model::{ExecutionContext, ExecutionStatus, StateMachineInstance};
use crate::service::ServiceRegistry;
use crate::store::StateLogStore;

pub(crate) struct EngineInner {
    pub config: RwLock<EngineConfig>,
    pub repository: Arc<dyn StateMachineRepository>,
    pub store: Arc<dyn StateLogStore>,
    pub services: ServiceRegistry,
    pub coordinator: Arc<dyn TransactionCoordinator>,
    pub locks: InstanceLocks,
    pub runtime: Option<Handle>,
    /// Pool de las ramas paralelas. `None` sólo si el sistema no pudo crear los hilos.
    pub branch_pool: Option<rayon::ThreadPool>,
}

/// Instancia registrada y bloqueada, lista para ejecutarse.
pub(crate) struct Prepared {
    pub machine: Arc<StateMachine>,
    pub instance: StateMachineInstance,
    pub config: EngineConfig,
    pub origin: Instant,
    pub guard: InstanceGuard,
}

fn apply_overrides(ctx: &mut ExecutionContext, overrides: Option<&Value>) {
    if let Some(Value::Object(vars)) = overrides {
        for (k, v) in vars {
            ctx.set(k.clone(), v.clone());
        }
    }
}

impl EngineInner {
    /// Copia de la configuración vigente; cada ejecución usa la que tenía al empezar.
    pub fn config(&self) -> EngineConfig {
        match self.config.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn machine(&self, name: &str, tenant: &str) -> Result<Arc<StateMachine>, EngineError> {
        self.repository
            .get(name, tenant)
            .ok_or_else(|| EngineError::StateMachineNotFound { name: name.to_string(),
                                                               tenant: tenant.to_string() })
    }

    /// Registra la instancia (respetando la unicidad de la business key), toma
    /// su lock y abre la transacción global.
    ///
    /// El id es nuevo, así que el lock nunca está ocupado aquí. Se toma antes
    /// de persistir para que la instancia ya figure como conducida cuando el
    /// escaneo de recuperación o un `forward`/`compensate` la vean; el guard
    /// viaja en `Prepared` y se suelta al terminar `run_prepared`.
    pub fn prepare_start(&self, name: &str, tenant: &str, business_key: Option<&str>, params: Value) -> Result<Prepared, EngineError> {
        let machine = self.machine(name, tenant)?;
        let config = self.config();
        let origin = Instant::now();
        let id = Uuid::new_v4().to_string();
        let guard = self.locks.acquire(&id, LockPurpose::Start)?;

        let mut instance = StateMachineInstance::new(id.clone(), name, tenant, &machine.definition_hash, params);
        instance.business_key = business_key.map(str::to_string);
        self.store.record_machine_started(&instance)?;
        info!("start instance_id={id} machine={name} tenant={tenant} business_key={business_key:?}");

        if let Err(e) = self.coordinator.begin(&id, name, config.trans_operation_timeout) {
            warn!("start:coordinator_begin_failed instance_id={id} err={e}");
            instance.status = ExecutionStatus::Failed;
            instance.error = Some(ErrorRecord::from(&e));
            instance.ended_at = Some(Utc::now());
            instance.updated_at = Utc::now();
            self.store.record_machine_updated(&instance)?;
            return Err(e);
        }
        Ok(Prepared { machine,
                      instance,
                      config,
                      origin,
                      guard })
    }

    pub fn run_prepared(&self, prepared: Prepared) -> Result<RunOutcome, EngineError> {
        let Prepared { machine, instance, config, origin, guard } = prepared;
        let mut ctx = ExecutionContext::from_json(&instance.start_params);
        let start = machine.start_state.clone();
        let exec = Execution::new(self, machine, instance, config, 0, origin, ResumePlan::empty());
        let outcome = exec.drive(&start, &mut ctx);
        debug!("run:released instance_id={}", guard.instance_id());
        drop(guard);
        outcome
    }

    /// Reanuda hacia delante una instancia ya cargada y bloqueada.
    fn forward_loaded(&self,
                      machine: Arc<StateMachine>,
                      mut instance: StateMachineInstance,
                      overrides: Option<&Value>,
                      depth: usize,
                      origin: Instant)
                      -> Result<RunOutcome, EngineError> {
        if instance.definition_hash != machine.definition_hash {
            warn!("forward:definition_changed instance_id={} recorded={} current={}",
                  instance.id,
                  instance.definition_hash,
                  machine.definition_hash);
        }
        let mut ctx = rebuild_context(&machine, &instance)?;
        apply_overrides(&mut ctx, overrides);
        let point = resume_point(&machine, &instance);
        info!("forward instance_id={} machine={} resume={point:?}", instance.id, instance.machine_name);

        instance.status = ExecutionStatus::Running;
        instance.error = None;
        instance.ended_at = None;
        let (from, entry) = match point {
            ResumePoint::At { state, entry } => (Some(state), entry),
            ResumePoint::Completed => (None, None),
        };
        let plan = ResumePlan::new(entry, &instance);
        let exec = Execution::new(self, machine, instance, self.config(), depth, origin, plan);
        exec.update_header(|_| {})?;
        match from {
            Some(state) => exec.drive(&state, &mut ctx),
            None => exec.finish(Outcome::Succeeded, &mut ctx),
        }
    }

    /// Ejecuta (o reanuda) la instancia hija de un estado sub-máquina. El
    /// timeout de la operación padre sigue corriendo dentro de la hija.
    pub fn run_sub_machine(&self,
                           parent: &Execution<'_>,
                           machine_name: &str,
                           child_id: &str,
                           input: &Value)
                           -> Result<StateMachineInstance, EngineError> {
        let depth = parent.depth + 1;
        if depth > parent.config.max_sub_machine_depth {
            return Err(EngineError::InvalidDefinition(format!("sub-machine nesting deeper than {} at '{machine_name}'",
                                                              parent.config.max_sub_machine_depth)));
        }
        let machine = self.machine(machine_name, &parent.machine.tenant_id)?;
        let _guard = self.locks.acquire(child_id, LockPurpose::SubMachine)?;

        let outcome = match self.store.get_instance(child_id)? {
            Some(child) if child.compensation_status.is_some() || child.status == ExecutionStatus::Succeeded => return Ok(child),
            Some(child) => {
                debug!("sub_machine:resume parent={} child={child_id}", parent.id());
                self.forward_loaded(machine, child, None, depth, parent.origin())?
            }
            None => {
                let mut child = StateMachineInstance::new(child_id.to_string(),
                                                          machine_name,
                                                          &machine.tenant_id,
                                                          &machine.definition_hash,
                                                          input.clone());
                child.parent_id = Some(parent.id().to_string());
                self.store.record_machine_started(&child)?;
                debug!("sub_machine:start parent={} child={child_id} machine={machine_name}", parent.id());
                let mut ctx = ExecutionContext::from_json(input);
                let start = machine.start_state.clone();
                let exec = Execution::new(self, machine, child, parent.config.clone(), depth, parent.origin(), ResumePlan::empty());
                exec.drive(&start, &mut ctx)?
            }
        };
        Ok(outcome.instance)
    }

    /// Compensa la instancia hija completa; éxito si nunca llegó a crearse.
    pub fn compensate_sub_machine(&self, parent: &Execution<'_>, child_id: &str) -> Result<ExecutionStatus, EngineError> {
        let Some(child) = self.store.get_instance(child_id)? else {
            return Ok(ExecutionStatus::Succeeded);
        };
        if let Some(status @ (ExecutionStatus::Succeeded | ExecutionStatus::Failed)) = child.compensation_status {
            return Ok(status);
        }
        let _guard = self.locks.acquire(child_id, LockPurpose::SubMachine)?;
        let machine = self.machine(&child.machine_name, &child.tenant_id)?;
        let mut ctx = rebuild_context(&machine, &child)?;
        info!("sub_machine:compensate parent={} child={child_id}", parent.id());
        let exec = Execution::new(self,
                                  machine,
                                  child,
                                  parent.config.clone(),
                                  parent.depth + 1,
                                  Instant::now(),
                                  ResumePlan::empty());
        let status = exec.compensate(&mut ctx)?;
        exec.update_header(|inst| inst.ended_at = Some(Utc::now()))?;
        Ok(status)
    }

    pub fn forward(&self, instance_id: &str, overrides: Option<&Value>) -> Result<RunOutcome, EngineError> {
        let _guard = self.locks.acquire(instance_id, LockPurpose::Forward)?;
        let instance = self.store
                           .get_instance(instance_id)?
                           .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        if let Some(comp) = instance.compensation_status {
            return Err(EngineError::OperationDenied(format!("instance '{instance_id}' is compensating or compensated (compensation {})",
                                                            comp.code())));
        }
        if instance.status == ExecutionStatus::Succeeded {
            debug!("forward:already_succeeded instance_id={instance_id}");
            return Ok(RunOutcome { instance, error: None });
        }
        if instance.is_root() {
            let global = self.coordinator.reload(instance_id)?;
            if global.requests_rollback() {
                return Err(EngineError::OperationDenied(format!("global transaction of '{instance_id}' is {global:?}; only compensation is allowed")));
            }
        }
        let machine = self.machine(&instance.machine_name, &instance.tenant_id)?;
        self.forward_loaded(machine, instance, overrides, 0, Instant::now())
    }

    pub fn compensate(&self, instance_id: &str, overrides: Option<&Value>) -> Result<StateMachineInstance, EngineError> {
        let _guard = self.locks.acquire(instance_id, LockPurpose::Compensate)?;
        let instance = self.store
                           .get_instance(instance_id)?
                           .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        if matches!(instance.compensation_status, Some(ExecutionStatus::Succeeded | ExecutionStatus::Failed)) {
            debug!("compensate:already_final instance_id={instance_id}");
            return Ok(instance);
        }
        let machine = self.machine(&instance.machine_name, &instance.tenant_id)?;
        let mut ctx = rebuild_context(&machine, &instance)?;
        apply_overrides(&mut ctx, overrides);
        let exec = Execution::new(self, machine, instance, self.config(), 0, Instant::now(), ResumePlan::empty());
        exec.compensate(&mut ctx)?;
        let instance = exec.update_header(|inst| {
                               if inst.status == ExecutionStatus::Running {
                                   inst.status = decide_forward_status(&inst.states, None);
                               }
                               inst.ended_at = Some(Utc::now());
                           })?;
        exec.report_global(&instance, None);
        Ok(instance)
    }
}

/// Fachada pública del motor.
#[derive(Clone)]
pub struct StateMachineEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for StateMachineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineEngine")
         .field("config", &self.inner.config())
         .field("services", &self.inner.services)
         .finish_non_exhaustive()
    }
}

impl StateMachineEngine {
    /// Crea un builder; el log de estados es obligatorio.
    #[inline]
    pub fn builder() -> EngineBuilderInit { EngineBuilderInit::default() }

    /// Motor con log, repositorio y coordinador en memoria.
    pub fn in_memory() -> super::EngineBuilder {
        EngineBuilderInit::default().store(crate::store::InMemoryStateLogStore::new())
    }

    /// Valida y registra una definición.
    pub fn register(&self, machine: StateMachine) -> Result<Arc<StateMachine>, EngineError> { self.inner.repository.register(machine) }

    pub fn services(&self) -> &ServiceRegistry { &self.inner.services }

    pub fn store(&self) -> Arc<dyn StateLogStore> { self.inner.store.clone() }

    pub fn coordinator(&self) -> Arc<dyn TransactionCoordinator> { self.inner.coordinator.clone() }

    pub fn config(&self) -> EngineConfig { self.inner.config() }

    /// Cambia el timeout de operación. Afecta a las ejecuciones (start,
    /// forward, compensate, recuperación) que empiecen después de la llamada.
    pub fn set_trans_operation_timeout(&self, timeout: Duration) {
        match self.inner.config.write() {
            Ok(mut c) => c.trans_operation_timeout = timeout,
            Err(poisoned) => poisoned.into_inner().trans_operation_timeout = timeout,
        }
        info!("config:trans_operation_timeout_ms={}", timeout.as_millis());
    }

    /// Hay un driver activo sobre la instancia.
    pub fn is_driving(&self, instance_id: &str) -> bool { self.inner.locks.is_locked(instance_id) }

    /// Ejecuta la máquina hasta un final. Los errores de definición se
    /// devuelven como `Err` (la instancia queda registrada); los fallos de
    /// ejecución quedan en el estado de la instancia.
    pub fn start(&self, machine_name: &str, tenant_id: Option<&str>, params: Value) -> Result<StateMachineInstance, EngineError> {
        let prepared = self.inner.prepare_start(machine_name, tenant_id.unwrap_or(DEFAULT_TENANT), None, params)?;
        self.inner.run_prepared(prepared)?.into_result()
    }

    /// Como `start`, ligando la instancia a una business key única entre
    /// las instancias no terminales del tenant.
    pub fn start_with_business_key(&self,
                                   machine_name: &str,
                                   tenant_id: Option<&str>,
                                   business_key: &str,
                                   params: Value)
                                   -> Result<StateMachineInstance, EngineError> {
        let prepared = self.inner
                           .prepare_start(machine_name, tenant_id.unwrap_or(DEFAULT_TENANT), Some(business_key), params)?;
        self.inner.run_prepared(prepared)?.into_result()
    }

    /// Registra la instancia y la ejecuta fuera del hilo llamador. Devuelve la
    /// instancia en `Running` y un handle para esperar el resultado.
    pub fn start_async(&self,
                       machine_name: &str,
                       tenant_id: Option<&str>,
                       params: Value)
                       -> Result<(StateMachineInstance, AsyncHandle), EngineError> {
        self.dispatch(machine_name, tenant_id, None, params, None)
    }

    /// Variante con callback. El callback se invoca exactamente una vez,
    /// también cuando el arranque falla antes de ejecutar (en ese caso además
    /// se devuelve el error).
    pub fn start_async_with_callback(&self,
                                     machine_name: &str,
                                     tenant_id: Option<&str>,
                                     business_key: Option<&str>,
                                     params: Value,
                                     callback: AsyncCallback)
                                     -> Result<StateMachineInstance, EngineError> {
        let shared = super::dispatch::OnceCallback::new(callback);
        match self.dispatch(machine_name, tenant_id, business_key, params, Some(shared.clone())) {
            Ok((instance, _handle)) => Ok(instance),
            Err(e) => {
                shared.fire(Err(e.clone()));
                Err(e)
            }
        }
    }

    fn dispatch(&self,
                machine_name: &str,
                tenant_id: Option<&str>,
                business_key: Option<&str>,
                params: Value,
                callback: Option<super::dispatch::OnceCallback>)
                -> Result<(StateMachineInstance, AsyncHandle), EngineError> {
        if !self.inner.config().enable_async {
            return Err(EngineError::AsyncUnavailable("async execution is disabled".into()));
        }
        let runtime = match &self.inner.runtime {
            Some(h) => h.clone(),
            None => Handle::try_current().map_err(|e| EngineError::AsyncUnavailable(e.to_string()))?,
        };
        let prepared = self.inner
                           .prepare_start(machine_name, tenant_id.unwrap_or(DEFAULT_TENANT), business_key, params)?;
        let snapshot = prepared.instance.clone();
        let handle = super::dispatch::spawn(&runtime, self.inner.clone(), prepared, callback);
        Ok((snapshot, handle))
    }

    pub fn forward(&self, instance_id: &str, params: Option<Value>) -> Result<StateMachineInstance, EngineError> {
        self.inner.forward(instance_id, params.as_ref())?.into_result()
    }

    pub fn compensate(&self, instance_id: &str, params: Option<Value>) -> Result<StateMachineInstance, EngineError> {
        self.inner.compensate(instance_id, params.as_ref())
    }

    pub fn get_instance(&self, instance_id: &str) -> Result<Option<StateMachineInstance>, EngineError> {
        Ok(self.inner.store.get_instance(instance_id)?)
    }

    pub fn get_instance_by_business_key(&self, business_key: &str, tenant_id: Option<&str>) -> Result<Option<StateMachineInstance>, EngineError> {
        Ok(self.inner
               .store
               .get_instance_by_business_key(business_key, tenant_id.unwrap_or(DEFAULT_TENANT))?)
    }

    /// Instancias hijas (sub-máquinas) de una instancia.
    pub fn get_children(&self, instance_id: &str) -> Result<Vec<StateMachineInstance>, EngineError> {
        Ok(self.inner.store.query_instances_by_parent_id(instance_id)?)
    }
}
