//! Motor de ejecución: executor de estados, driver de compensación,
//! recuperación, ejecución asíncrona y tabla de locks por instancia.

pub mod builder;
mod compensation;
pub mod config;
pub mod core;
pub mod dispatch;
mod execution;
mod executor;
pub mod lock;
pub mod recovery;
pub mod replay;
pub mod status;

pub use builder::{EngineBuilder, EngineBuilderInit};
pub use config::EngineConfig;
pub use core::StateMachineEngine;
pub use dispatch::{AsyncCallback, AsyncHandle, AsyncResult};
pub use execution::RunOutcome;
pub use executor::{apply_output_mapping, eval_input};
pub use lock::{InstanceGuard, InstanceLocks, LockPurpose};
pub use recovery::{decide_action, RecoveryAction, RecoveryCoordinator, RecoveryLoop, RecoveryReport};
pub use replay::{rebuild_context, resume_point, ResumePoint};
