//! saga-core: motor de sagas persistente y compensable
pub mod constants;
pub mod coordinator;
pub mod definition;
pub mod engine;
pub mod errors;
pub mod hashing;
pub mod model;
pub mod service;
pub mod store;

pub use coordinator::{GlobalStatus, InMemoryTransactionCoordinator, TransactionCoordinator};
pub use definition::{EndKind, Expr, PersistMode, RecoverStrategy, RetryRule, State, StateKind, StateMachine, StateType};
pub use engine::{AsyncHandle, EngineBuilder, EngineConfig, RecoveryCoordinator, RecoveryReport, RunOutcome, StateMachineEngine};
pub use errors::{EngineError, ErrorRecord, StoreError};
pub use model::{ExecutionContext, ExecutionStatus, ScopeSegment, StateInstance, StateMachineInstance};
pub use service::{ServiceError, ServiceInvoker, ServiceRegistry};
pub use store::{InMemoryStateLogStore, StateLogStore};
