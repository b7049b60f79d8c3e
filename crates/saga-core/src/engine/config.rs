//! Configuración del motor.
//!
//! Se pasa explícitamente al construir el motor. `from_env` permite tomarla
//! de variables de entorno (tras cargar `.env` una sola vez).

use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

use crate::constants::DEFAULT_TRANS_OPERATION_TIMEOUT_MS;
use crate::definition::PersistMode;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Tiempo máximo de una operación (start/forward) antes de que la
    /// compensación pase a ser la única salida.
    pub trans_operation_timeout: Duration,
    /// Modo por defecto para reintentos cuando ni el estado ni la máquina lo fijan.
    pub retry_persist_mode: PersistMode,
    /// Modo por defecto para re-ejecutar compensaciones.
    pub compensate_persist_mode: PersistMode,
    pub recovery_interval: Duration,
    pub recovery_batch_size: usize,
    pub max_sub_machine_depth: usize,
    pub enable_async: bool,
    /// Hilos del pool propio donde corren las ramas de los estados paralelos.
    /// Las ramas bloquean (servicios, backoff), así que no usan el pool global.
    pub parallel_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { trans_operation_timeout: Duration::from_millis(DEFAULT_TRANS_OPERATION_TIMEOUT_MS),
               retry_persist_mode: PersistMode::New,
               compensate_persist_mode: PersistMode::New,
               recovery_interval: Duration::from_secs(5),
               recovery_batch_size: 100,
               max_sub_machine_depth: 16,
               enable_async: true,
               parallel_threads: 16 }
    }
}

impl EngineConfig {
    /// Lee `SAGA_*` del entorno; lo ausente o inválido toma el valor por defecto.
    pub fn from_env() -> Self {
        Lazy::force(&DOTENV_LOADED);
        let d = Self::default();
        let mode = |var: &str, fallback: PersistMode| match env_bool(var) {
            Some(true) => PersistMode::Update,
            Some(false) => PersistMode::New,
            None => fallback,
        };
        Self { trans_operation_timeout: env_u64("SAGA_TRANS_TIMEOUT_MS").map(Duration::from_millis)
                                                                         .unwrap_or(d.trans_operation_timeout),
               retry_persist_mode: mode("SAGA_RETRY_PERSIST_MODE_UPDATE", d.retry_persist_mode),
               compensate_persist_mode: mode("SAGA_COMPENSATE_PERSIST_MODE_UPDATE", d.compensate_persist_mode),
               recovery_interval: env_u64("SAGA_RECOVERY_INTERVAL_MS").map(Duration::from_millis)
                                                                      .unwrap_or(d.recovery_interval),
               recovery_batch_size: env_u64("SAGA_RECOVERY_BATCH_SIZE").map(|v| v as usize)
                                                                      .unwrap_or(d.recovery_batch_size),
               parallel_threads: env_u64("SAGA_PARALLEL_THREADS").filter(|n| *n > 0)
                                                                 .map(|n| n as usize)
                                                                 .unwrap_or(d.parallel_threads),
               ..d }
    }

    pub fn with_trans_operation_timeout(mut self, timeout: Duration) -> Self {
        self.trans_operation_timeout = timeout;
        self
    }

    pub fn with_retry_persist_mode(mut self, mode: PersistMode) -> Self {
        self.retry_persist_mode = mode;
        self
    }

    pub fn with_compensate_persist_mode(mut self, mode: PersistMode) -> Self {
        self.compensate_persist_mode = mode;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    pub fn with_parallel_threads(mut self, threads: usize) -> Self {
        self.parallel_threads = threads.max(1);
        self
    }

    pub fn with_async(mut self, enabled: bool) -> Self {
        self.enable_async = enabled;
        self
    }
}

fn env_u64(var: &str) -> Option<u64> { env::var(var).ok().and_then(|v| v.trim().parse().ok()) }

fn env_bool(var: &str) -> Option<bool> {
    match env::var(var).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() { Lazy::force(&DOTENV_LOADED); }
