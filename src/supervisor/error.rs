//! Error taxonomy surfaced by every supervisor operation. Each variant has a
//! stable machine-readable code so a client surface can branch on it.

use crate::importer::ImportError;
use crate::supervisor::state_machine::ServerStatus;
use crate::validator::{PortConflict, ValidationError};

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("Instance '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    PortInUse(PortConflict),

    #[error("Server '{0}' is not running")]
    NotRunning(String),

    #[error("Cannot {action} instance '{id}' while it is {state}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        state: ServerStatus,
    },

    #[error("Failed to launch instance '{id}': {source}")]
    SpawnFailure {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported modpack format: {0}")]
    UnsupportedModpackFormat(String),

    #[error("No launchable server jar or script found in {0}")]
    NoLaunchableEntryFound(String),

    #[error("Failed to persist instance catalog: {0}")]
    Persistence(#[source] std::io::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

impl SupervisorError {
    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::PortInUse(_) => "PORT_IN_USE",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::SpawnFailure { .. } => "SPAWN_FAILURE",
            Self::UnsupportedModpackFormat(_) => "UNSUPPORTED_MODPACK_FORMAT",
            Self::NoLaunchableEntryFound(_) => "NO_LAUNCHABLE_ENTRY_FOUND",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON error body for client surfaces.
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        });
        match self {
            Self::Validation(e) => {
                body["field"] = serde_json::json!(e.field);
            }
            Self::PortInUse(conflict) => {
                body["port"] = serde_json::json!(conflict.port);
                body["conflicting_instance"] = serde_json::json!(conflict.conflicting_instance_id);
            }
            _ => {}
        }
        body
    }

    pub(crate) fn spawn(id: &str, source: std::io::Error) -> Self {
        Self::SpawnFailure {
            id: id.to_string(),
            source,
        }
    }
}

impl From<ImportError> for SupervisorError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Validation(e) => Self::Validation(e),
            ImportError::UnsupportedModpackFormat(msg) => Self::UnsupportedModpackFormat(msg),
            ImportError::NoLaunchableEntryFound(path) => {
                Self::NoLaunchableEntryFound(path.display().to_string())
            }
            ImportError::Archive(zip::result::ZipError::Io(e)) | ImportError::Io(e) => {
                Self::Internal(anyhow::Error::new(e).context("import failed"))
            }
            ImportError::Archive(e) => Self::UnsupportedModpackFormat(e.to_string()),
        }
    }
}
