//! Tabla de locks de escritor único por instancia.
//!
//! Cualquier operación que conduce una instancia (start, forward, compensate,
//! recuperación) toma el lock de su id; un segundo intento concurrente falla
//! con `InstanceLocked`. El guard libera al salir de ámbito.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;

use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPurpose {
    Start,
    Forward,
    Compensate,
    SubMachine,
}

#[derive(Debug, Default, Clone)]
pub struct InstanceLocks {
    held: Arc<DashMap<String, LockPurpose>>,
}

impl InstanceLocks {
    pub fn new() -> Self { Self::default() }

    pub fn acquire(&self, instance_id: &str, purpose: LockPurpose) -> Result<InstanceGuard, EngineError> {
        match self.held.entry(instance_id.to_string()) {
            Entry::Occupied(e) => {
                debug!("lock:busy instance_id={instance_id} holder={:?} wanted={purpose:?}", e.get());
                Err(EngineError::InstanceLocked(instance_id.to_string()))
            }
            Entry::Vacant(v) => {
                v.insert(purpose);
                Ok(InstanceGuard { held: self.held.clone(),
                                   instance_id: instance_id.to_string() })
            }
        }
    }

    pub fn is_locked(&self, instance_id: &str) -> bool { self.held.contains_key(instance_id) }

    pub fn holder(&self, instance_id: &str) -> Option<LockPurpose> { self.held.get(instance_id).map(|p| *p) }
}

#[derive(Debug)]
pub struct InstanceGuard {
    held: Arc<DashMap<String, LockPurpose>>,
    instance_id: String,
}

impl InstanceGuard {
    pub fn instance_id(&self) -> &str { &self.instance_id }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) { self.held.remove(&self.instance_id); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_guard_drops() {
        let locks = InstanceLocks::new();
        let g = locks.acquire("a", LockPurpose::Start).unwrap();
        assert!(matches!(locks.acquire("a", LockPurpose::Forward), Err(EngineError::InstanceLocked(_))));
        assert_eq!(locks.holder("a"), Some(LockPurpose::Start));
        assert!(locks.acquire("b", LockPurpose::Forward).is_ok());
        drop(g);
        assert!(!locks.is_locked("a"));
        assert!(locks.acquire("a", LockPurpose::Compensate).is_ok());
    }

    #[test]
    fn concurrent_acquire_has_single_winner() {
        let locks = InstanceLocks::new();
        let winners: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| {
                                            let locks = locks.clone();
                                            s.spawn(move || locks.acquire("x", LockPurpose::Forward).map(std::mem::forget).is_ok())
                                        })
                                        .collect();
            handles.into_iter().map(|h| h.join().unwrap_or(false)).collect()
        });
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);
    }
}
