//! Contrato con el coordinador global de transacciones.
//!
//! El motor abre una transacción global por instancia raíz (`begin`), informa
//! el resultado al terminar (`report`) y, durante la recuperación, consulta el
//! estado que el coordinador considera vigente (`reload`).

use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalStatus {
    Begin,
    Committing,
    CommitRetrying,
    Committed,
    CommitFailed,
    Rollbacking,
    RollbackRetrying,
    TimeoutRollbacking,
    TimeoutRollbackRetrying,
    Rollbacked,
    RollbackFailed,
    Finished,
    Unknown,
}

impl GlobalStatus {
    /// El coordinador ya no espera ninguna acción del motor.
    pub fn is_finished(&self) -> bool {
        matches!(self,
                 GlobalStatus::Committed
                 | GlobalStatus::CommitFailed
                 | GlobalStatus::Rollbacked
                 | GlobalStatus::RollbackFailed
                 | GlobalStatus::Finished)
    }

    /// El coordinador pide deshacer.
    pub fn requests_rollback(&self) -> bool {
        matches!(self,
                 GlobalStatus::Rollbacking
                 | GlobalStatus::RollbackRetrying
                 | GlobalStatus::TimeoutRollbacking
                 | GlobalStatus::TimeoutRollbackRetrying)
    }

    /// El coordinador pide completar hacia delante.
    pub fn requests_commit(&self) -> bool { matches!(self, GlobalStatus::Committing | GlobalStatus::CommitRetrying) }
}

pub trait TransactionCoordinator: Send + Sync {
    fn begin(&self, xid: &str, machine_name: &str, timeout: Duration) -> Result<(), EngineError>;
    fn report(&self, xid: &str, status: GlobalStatus) -> Result<(), EngineError>;
    fn reload(&self, xid: &str) -> Result<GlobalStatus, EngineError>;
}

#[derive(Debug, Clone)]
struct GlobalTx {
    machine_name: String,
    status: GlobalStatus,
    began: Instant,
    timeout: Duration,
}

/// Coordinador local: guarda el último estado informado y, como haría un
/// coordinador remoto, pasa a `TimeoutRollbacking` las transacciones abiertas
/// que superan su timeout.
#[derive(Default)]
pub struct InMemoryTransactionCoordinator {
    txs: DashMap<String, GlobalTx>,
}

impl InMemoryTransactionCoordinator {
    pub fn new() -> Self { Self::default() }

    /// Fuerza un estado (simula una decisión del coordinador remoto).
    pub fn set_status(&self, xid: &str, status: GlobalStatus) {
        match self.txs.get_mut(xid) {
            Some(mut tx) => tx.status = status,
            None => {
                self.txs.insert(xid.to_string(),
                                GlobalTx { machine_name: String::new(),
                                           status,
                                           began: Instant::now(),
                                           timeout: Duration::MAX });
            }
        }
    }

    pub fn status_of(&self, xid: &str) -> Option<GlobalStatus> { self.txs.get(xid).map(|t| t.status) }
}

impl TransactionCoordinator for InMemoryTransactionCoordinator {
    fn begin(&self, xid: &str, machine_name: &str, timeout: Duration) -> Result<(), EngineError> {
        debug!("coordinator:begin xid={xid} machine={machine_name} timeout_ms={}", timeout.as_millis());
        self.txs.insert(xid.to_string(),
                        GlobalTx { machine_name: machine_name.to_string(),
                                   status: GlobalStatus::Begin,
                                   began: Instant::now(),
                                   timeout });
        Ok(())
    }

    fn report(&self, xid: &str, status: GlobalStatus) -> Result<(), EngineError> {
        let mut tx = self.txs
                         .get_mut(xid)
                         .ok_or_else(|| EngineError::Coordinator(format!("unknown global transaction '{xid}'")))?;
        info!("coordinator:report xid={xid} machine={} {:?} -> {:?}", tx.machine_name, tx.status, status);
        tx.status = status;
        Ok(())
    }

    fn reload(&self, xid: &str) -> Result<GlobalStatus, EngineError> {
        let Some(mut tx) = self.txs.get_mut(xid) else { return Ok(GlobalStatus::Unknown) };
        if tx.status == GlobalStatus::Begin && tx.began.elapsed() > tx.timeout {
            tx.status = GlobalStatus::TimeoutRollbacking;
        }
        Ok(tx.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_transactions_time_out_on_reload() {
        let c = InMemoryTransactionCoordinator::new();
        c.begin("x", "m", Duration::from_millis(0)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(c.reload("x").unwrap(), GlobalStatus::TimeoutRollbacking);
    }

    #[test]
    fn reported_status_is_kept() {
        let c = InMemoryTransactionCoordinator::new();
        c.begin("x", "m", Duration::from_secs(60)).unwrap();
        c.report("x", GlobalStatus::CommitRetrying).unwrap();
        assert_eq!(c.reload("x").unwrap(), GlobalStatus::CommitRetrying);
        assert_eq!(c.reload("nope").unwrap(), GlobalStatus::Unknown);
        assert!(c.report("nope", GlobalStatus::Committed).is_err());
    }
}
