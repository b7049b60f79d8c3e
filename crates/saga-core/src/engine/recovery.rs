//! Recuperación de instancias no terminales.
//!
//! Un escaneo lista las instancias raíz pendientes, consulta al coordinador
//! global el estado de cada transacción y decide si reanudar hacia delante o
//! compensar. El bucle de sondeo repite el escaneo cada `recovery_interval`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::core::StateMachineEngine;
use crate::coordinator::GlobalStatus;
use crate::definition::RecoverStrategy;
use crate::errors::EngineError;
use crate::model::{ExecutionStatus, StateMachineInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Skip,
    Forward,
    Compensate,
}

/// Decide qué hacer con una instancia pendiente. El timeout cuenta desde el
/// arranque de la instancia, no desde su última escritura.
pub fn decide_action(instance: &StateMachineInstance,
                     global: GlobalStatus,
                     now: DateTime<Utc>,
                     timeout: Duration,
                     strategy: RecoverStrategy)
                     -> RecoveryAction {
    if instance.is_terminal() {
        return RecoveryAction::Skip;
    }
    if matches!(instance.compensation_status, Some(ExecutionStatus::Running | ExecutionStatus::Unknown)) {
        return RecoveryAction::Compensate;
    }
    if global.requests_rollback() {
        return RecoveryAction::Compensate;
    }
    let age = (now - instance.started_at).to_std().unwrap_or(Duration::ZERO);
    match instance.status {
        ExecutionStatus::Running if age > timeout => return RecoveryAction::Compensate,
        ExecutionStatus::Running => return RecoveryAction::Skip,
        ExecutionStatus::Unknown if age > timeout => return RecoveryAction::Compensate,
        _ => {}
    }
    if global.requests_commit() {
        return RecoveryAction::Forward;
    }
    if global.is_finished() {
        return RecoveryAction::Skip;
    }
    match strategy {
        RecoverStrategy::Compensate => RecoveryAction::Compensate,
        RecoverStrategy::Forward => RecoveryAction::Forward,
    }
}

/// Resultado de un escaneo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub forwarded: usize,
    pub compensated: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    engine: StateMachineEngine,
}

impl RecoveryCoordinator {
    pub fn new(engine: StateMachineEngine) -> Self { Self { engine } }

    pub fn scan_once(&self) -> Result<RecoveryReport, EngineError> {
        let inner = &self.engine.inner;
        let config = inner.config();
        let candidates = inner.store.list_recovery_candidates(config.recovery_batch_size)?;
        let mut report = RecoveryReport::default();
        for instance in candidates {
            report.scanned += 1;
            if inner.locks.is_locked(&instance.id) {
                debug!("recovery:locked instance_id={}", instance.id);
                report.skipped += 1;
                continue;
            }
            let global = inner.coordinator.reload(&instance.id).unwrap_or_else(|e| {
                                                                   warn!("recovery:reload_failed instance_id={} err={e}", instance.id);
                                                                   GlobalStatus::Unknown
                                                               });
            let strategy = match inner.machine(&instance.machine_name, &instance.tenant_id) {
                Ok(m) => m.recover_strategy,
                Err(e) => {
                    warn!("recovery:no_definition instance_id={} err={e}", instance.id);
                    report.failed += 1;
                    continue;
                }
            };
            let action = decide_action(&instance, global, Utc::now(), config.trans_operation_timeout, strategy);
            info!("recovery:decide instance_id={} status={} compensation={:?} global={global:?} action={action:?}",
                  instance.id,
                  instance.status.code(),
                  instance.compensation_status.map(|c| c.code()));
            let result = match action {
                RecoveryAction::Skip => {
                    report.skipped += 1;
                    continue;
                }
                RecoveryAction::Forward => inner.forward(&instance.id, None).map(|_| ()),
                RecoveryAction::Compensate => inner.compensate(&instance.id, None).map(|_| ()),
            };
            match (result, action) {
                (Ok(()), RecoveryAction::Forward) => report.forwarded += 1,
                (Ok(()), _) => report.compensated += 1,
                (Err(EngineError::InstanceLocked(_)), _) => report.skipped += 1,
                (Err(e), _) => {
                    error!("recovery:failed instance_id={} action={action:?} err={e}", instance.id);
                    report.failed += 1;
                }
            }
        }
        if report.scanned > 0 {
            info!("recovery:scan {report:?}");
        }
        Ok(report)
    }

    /// Lanza el bucle de sondeo en el runtime indicado (o el actual).
    pub fn spawn_loop(&self, runtime: Option<Handle>) -> Result<RecoveryLoop, EngineError> {
        let runtime = match runtime {
            Some(h) => h,
            None => Handle::try_current().map_err(|e| EngineError::AsyncUnavailable(e.to_string()))?,
        };
        let period = self.engine.config().recovery_interval;
        let this = self.clone();
        let handle = runtime.spawn(async move {
                                let mut ticker = tokio::time::interval(period);
                                loop {
                                    ticker.tick().await;
                                    let scanner = this.clone();
                                    match tokio::task::spawn_blocking(move || scanner.scan_once()).await {
                                        Ok(Ok(_)) => {}
                                        Ok(Err(e)) => warn!("recovery:scan_failed err={e}"),
                                        Err(e) => error!("recovery:scan_panicked err={e}"),
                                    }
                                }
                            });
        Ok(RecoveryLoop { handle })
    }
}

/// Bucle de recuperación en segundo plano.
#[derive(Debug)]
pub struct RecoveryLoop {
    handle: JoinHandle<()>,
}

impl RecoveryLoop {
    pub fn stop(self) { self.handle.abort(); }

    pub fn is_running(&self) -> bool { !self.handle.is_finished() }
}
