//! Ejecución asíncrona.
//!
//! La instancia se registra en el hilo llamador; la ejecución corre en el pool
//! bloqueante de tokio (los servicios y el log son síncronos). El resultado se
//! entrega una sola vez por un canal `oneshot` y, si lo hay, por el callback.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::{error, info};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use super::core::{EngineInner, Prepared};
use super::execution::RunOutcome;
use crate::errors::EngineError;

pub type AsyncResult = Result<RunOutcome, EngineError>;

/// Callback de fin de ejecución asíncrona.
pub type AsyncCallback = Box<dyn FnOnce(AsyncResult) + Send + 'static>;

/// Callback compartible que sólo puede dispararse una vez.
#[derive(Clone)]
pub(crate) struct OnceCallback(Arc<Mutex<Option<AsyncCallback>>>);

impl OnceCallback {
    pub fn new(callback: AsyncCallback) -> Self { Self(Arc::new(Mutex::new(Some(callback)))) }

    pub fn fire(&self, result: AsyncResult) {
        let taken = match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(cb) = taken {
            cb(result);
        }
    }
}

/// Handle de una ejecución lanzada con `start_async`.
#[derive(Debug)]
pub struct AsyncHandle {
    instance_id: String,
    rx: oneshot::Receiver<AsyncResult>,
}

impl AsyncHandle {
    pub fn instance_id(&self) -> &str { &self.instance_id }

    /// Espera el resultado desde código async.
    pub async fn wait(self) -> AsyncResult {
        let id = self.instance_id;
        self.rx
            .await
            .map_err(|_| EngineError::Internal(format!("async run of '{id}' dropped its result")))?
    }

    /// Espera bloqueando el hilo actual. No usar dentro de un contexto async.
    pub fn blocking_wait(self) -> AsyncResult {
        let id = self.instance_id;
        self.rx
            .blocking_recv()
            .map_err(|_| EngineError::Internal(format!("async run of '{id}' dropped its result")))?
    }
}

pub(crate) fn spawn(runtime: &Handle, inner: Arc<EngineInner>, prepared: Prepared, callback: Option<OnceCallback>) -> AsyncHandle {
    let instance_id = prepared.instance.id.clone();
    let (tx, rx) = oneshot::channel();
    let id = instance_id.clone();
    runtime.spawn_blocking(move || {
               info!("async:run instance_id={id}");
               let result = catch_unwind(AssertUnwindSafe(|| inner.run_prepared(prepared))).unwrap_or_else(|_| {
                                                                                              error!("async:panic instance_id={id}");
                                                                                              Err(EngineError::Internal(format!("execution of '{id}' panicked")))
                                                                                          });
               if let Some(cb) = callback {
                   cb.fire(result.clone());
               }
               let _ = tx.send(result);
           });
    AsyncHandle { instance_id, rx }
}
