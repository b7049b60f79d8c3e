//! Builder para `StateMachineEngine`.
//!
//! Dos estados:
//! - `EngineBuilderInit`: todavía sin log de estados; sólo permite fijarlo.
//! - `EngineBuilder`: log presente; el resto de piezas (repositorio,
//!   coordinador, servicios, configuración, runtime) son opcionales y toman
//!   implementaciones en memoria si no se indican.
//!
//! ```ignore
//! let engine = StateMachineEngine::builder()
//!     .store(InMemoryStateLogStore::new())
//!     .config(EngineConfig::from_env())
//!     .service("demo", DemoService::default())
//!     .build();
//! ```

use std::sync::{Arc, RwLock};

use log::warn;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::runtime::Handle;

use super::config::EngineConfig;
use super::core::{EngineInner, StateMachineEngine};
use super::lock::InstanceLocks;
use crate::coordinator::{InMemoryTransactionCoordinator, TransactionCoordinator};
use crate::definition::{InMemoryStateMachineRepository, StateMachineRepository};
use crate::service::{ServiceInvoker, ServiceRegistry};
use crate::store::StateLogStore;

/// Estado inicial: falta el log de estados.
#[derive(Debug, Default)]
pub struct EngineBuilderInit;

impl EngineBuilderInit {
    #[inline]
    pub fn store(self, store: impl StateLogStore + 'static) -> EngineBuilder { self.shared_store(Arc::new(store)) }

    /// Igual que `store`, compartiendo un log ya envuelto en `Arc`.
    #[inline]
    pub fn shared_store(self, store: Arc<dyn StateLogStore>) -> EngineBuilder {
        EngineBuilder { store,
                        repository: None,
                        coordinator: None,
                        services: ServiceRegistry::new(),
                        config: EngineConfig::default(),
                        runtime: None }
    }
}

pub struct EngineBuilder {
    store: Arc<dyn StateLogStore>,
    repository: Option<Arc<dyn StateMachineRepository>>,
    coordinator: Option<Arc<dyn TransactionCoordinator>>,
    services: ServiceRegistry,
    config: EngineConfig,
    runtime: Option<Handle>,
}

impl EngineBuilder {
    pub fn repository(mut self, repository: Arc<dyn StateMachineRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn service(self, name: impl Into<String>, service: impl ServiceInvoker + 'static) -> Self {
        self.services.register(name, service);
        self
    }

    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime donde se lanzan las ejecuciones asíncronas. Sin él se usa el
    /// runtime actual en el momento de `start_async`.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> StateMachineEngine {
        let branch_pool = branch_pool(self.config.parallel_threads);
        let inner = EngineInner { config: RwLock::new(self.config),
                                  repository: self.repository
                                                  .unwrap_or_else(|| Arc::new(InMemoryStateMachineRepository::new())),
                                  store: self.store,
                                  services: self.services,
                                  coordinator: self.coordinator
                                                   .unwrap_or_else(|| Arc::new(InMemoryTransactionCoordinator::new())),
                                  locks: InstanceLocks::new(),
                                  runtime: self.runtime,
                                  branch_pool };
        StateMachineEngine { inner: Arc::new(inner) }
    }
}

fn branch_pool(threads: usize) -> Option<ThreadPool> {
    match ThreadPoolBuilder::new().num_threads(threads.max(1))
                                  .thread_name(|i| format!("saga-branch-{i}"))
                                  .build()
    {
        Ok(pool) => Some(pool),
        Err(e) => {
            warn!("engine:branch_pool_unavailable threads={threads} err={e}; parallel states use the global pool");
            None
        }
    }
}
