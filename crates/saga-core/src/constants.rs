//! Constantes del motor de sagas.
//!
//! Agrupa nombres reservados del contexto y valores por defecto que forman
//! parte del contrato observable (variables que los mapeos pueden leer).

/// Versión lógica del motor. Se incluye en el fingerprint de cada definición
/// registrada para que un cambio incompatible del motor invalide los hashes.
pub const ENGINE_VERSION: &str = "S1.0";

/// Tenant usado cuando el llamador no indica uno.
pub const DEFAULT_TENANT: &str = "default";

/// Variable del contexto donde se expone el último error capturado por un `catch`.
pub const VAR_LAST_ERROR: &str = "lastError";

/// Sufijo de la variable que guarda la business key generada por un estado
/// (`<estado>_businessKey`).
pub const BUSINESS_KEY_SUFFIX: &str = "_businessKey";

/// Tipo de error usado cuando una regla de estado marca como fallida una
/// salida que el servicio devolvió sin error.
pub const ERROR_STATUS_MATCHED_FAILED: &str = "StatusMatchedFailed";

/// Tipo de error de un script que no pudo evaluarse.
pub const ERROR_SCRIPT: &str = "ScriptError";

/// Tipo de error cuando una sub-máquina termina sin éxito.
pub const ERROR_SUB_MACHINE_FAILED: &str = "SubMachineFailed";

/// Tipo de error cuando un servicio no está registrado.
pub const ERROR_SERVICE_NOT_FOUND: &str = "ServiceNotFound";

/// Timeout por defecto de una operación de transacción (30 minutos).
pub const DEFAULT_TRANS_OPERATION_TIMEOUT_MS: u64 = 30 * 60 * 1000;

pub fn business_key_var(state_name: &str) -> String {
    format!("{state_name}{BUSINESS_KEY_SUFFIX}")
}
