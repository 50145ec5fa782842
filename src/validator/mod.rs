//! Instance configuration checks.
//!
//! - `validate_draft`: field rules for a configuration about to be registered
//!   (name, memory bounds, port range, java path).
//! - `check_port_conflicts`: finds another instance already claiming a port.
//! - `require_file` / `require_dir`: path existence at import time.
//!
//! Everything here is a pure function of its inputs plus, for paths, the
//! filesystem at the moment of the call.

use crate::instance::{InstanceDraft, ServerInstance};
use serde::Serialize;
use std::path::Path;

/// A single rejected field.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub error_type: ValidationErrorType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorType {
    Required,
    OutOfRange,
    Duplicate,
    PathNotFound,
    InvalidOption,
}

impl ValidationError {
    pub fn new(field: &str, message: impl Into<String>, error_type: ValidationErrorType) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            error_type,
        }
    }
}

/// Another instance holding the requested port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConflict {
    pub port: u16,
    pub conflicting_instance_id: String,
    pub conflicting_instance_name: String,
}

impl std::fmt::Display for PortConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Port {} is already assigned to instance '{}'",
            self.port, self.conflicting_instance_name
        )
    }
}

/// Field checks for a new instance against the current catalog.
///
/// Port uniqueness is reported separately by [`check_port_conflicts`] because
/// it maps to its own error kind.
pub fn validate_draft(draft: &InstanceDraft, existing: &[ServerInstance]) -> Result<(), ValidationError> {
    validate_name(&draft.name, existing, None)?;
    validate_memory(draft.min_memory, draft.max_memory)?;
    validate_port(draft.port)?;
    validate_java_path(&draft.java_path)?;
    Ok(())
}

/// Names must be non-empty and unique (trimmed, case-insensitive).
/// `exclude_id` skips the instance being renamed.
pub fn validate_name(
    name: &str,
    existing: &[ServerInstance],
    exclude_id: Option<&str>,
) -> Result<(), ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(
            "name",
            "Name must not be empty",
            ValidationErrorType::Required,
        ));
    }

    let lowered = trimmed.to_lowercase();
    let duplicate = existing
        .iter()
        .filter(|i| Some(i.id.as_str()) != exclude_id)
        .find(|i| i.name.trim().to_lowercase() == lowered);
    if let Some(other) = duplicate {
        return Err(ValidationError::new(
            "name",
            format!("Name '{}' is already used by instance {}", trimmed, other.id),
            ValidationErrorType::Duplicate,
        ));
    }
    Ok(())
}

pub fn validate_memory(min_memory: u32, max_memory: u32) -> Result<(), ValidationError> {
    if min_memory < 1 {
        return Err(ValidationError::new(
            "minMemory",
            "Minimum memory must be at least 1 MB",
            ValidationErrorType::OutOfRange,
        ));
    }
    if max_memory < min_memory {
        return Err(ValidationError::new(
            "maxMemory",
            format!(
                "Maximum memory ({} MB) is below minimum memory ({} MB)",
                max_memory, min_memory
            ),
            ValidationErrorType::OutOfRange,
        ));
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::new(
            "port",
            "Port must be between 1 and 65535",
            ValidationErrorType::OutOfRange,
        ));
    }
    Ok(())
}

/// A bare command name (`java`) is left to `PATH` resolution at spawn time;
/// anything that looks like a path must point at an existing executable file.
pub fn validate_java_path(java_path: &str) -> Result<(), ValidationError> {
    let trimmed = java_path.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(
            "javaPath",
            "Java path must not be empty",
            ValidationErrorType::Required,
        ));
    }

    let path = Path::new(trimmed);
    let looks_like_path = path.is_absolute() || path.components().count() > 1;
    if looks_like_path && !path.is_file() {
        return Err(ValidationError::new(
            "javaPath",
            format!("Java executable not found: {}", trimmed),
            ValidationErrorType::PathNotFound,
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let executable = path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if looks_like_path && !executable {
            return Err(ValidationError::new(
                "javaPath",
                format!("Java executable is not executable: {}", trimmed),
                ValidationErrorType::InvalidOption,
            ));
        }
    }
    Ok(())
}

pub fn require_file(field: &str, path: &Path) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::new(
            field,
            "Path must not be empty",
            ValidationErrorType::Required,
        ));
    }
    if !path.is_file() {
        return Err(ValidationError::new(
            field,
            format!("File not found: {}", path.display()),
            ValidationErrorType::PathNotFound,
        ));
    }
    Ok(())
}

pub fn require_dir(field: &str, path: &Path) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::new(
            field,
            "Path must not be empty",
            ValidationErrorType::Required,
        ));
    }
    if !path.is_dir() {
        return Err(ValidationError::new(
            field,
            format!("Directory not found: {}", path.display()),
            ValidationErrorType::PathNotFound,
        ));
    }
    Ok(())
}

/// Returns the instance (other than `exclude_id`) that already claims `port`.
pub fn check_port_conflicts(
    port: u16,
    all_instances: &[ServerInstance],
    exclude_id: Option<&str>,
) -> Option<PortConflict> {
    all_instances
        .iter()
        .filter(|other| Some(other.id.as_str()) != exclude_id)
        .find(|other| other.port == port)
        .map(|other| PortConflict {
            port,
            conflicting_instance_id: other.id.clone(),
            conflicting_instance_name: other.name.clone(),
        })
}
