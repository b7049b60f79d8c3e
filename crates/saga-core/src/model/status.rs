use serde::{Deserialize, Serialize};

/// Estado de ejecución de una instancia, de un estado o de la compensación.
///
/// Los códigos cortos (`RU`, `SU`, `FA`, `UN`) son los que se persisten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl ExecutionStatus {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RU",
            ExecutionStatus::Succeeded => "SU",
            ExecutionStatus::Failed => "FA",
            ExecutionStatus::Unknown => "UN",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "RU" => Some(ExecutionStatus::Running),
            "SU" => Some(ExecutionStatus::Succeeded),
            "FA" => Some(ExecutionStatus::Failed),
            "UN" => Some(ExecutionStatus::Unknown),
            _ => None,
        }
    }

    /// `Succeeded` y `Failed` son definitivos; `Running` y `Unknown` no.
    pub fn is_final(&self) -> bool { matches!(self, ExecutionStatus::Succeeded | ExecutionStatus::Failed) }
}
