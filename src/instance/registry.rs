//! Authoritative instance catalog, persisted as `instances.json`.
//!
//! Every successful mutation rewrites the whole catalog through
//! [`write_atomic`](crate::utils::write_atomic). The in-memory list is only
//! committed once the file is safely on disk, so a failed write leaves both
//! the catalog file and the registry as they were.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{InstanceDraft, InstancePatch, ServerInstance};
use crate::supervisor::error::{Result, SupervisorError};
use crate::utils::{current_timestamp, write_atomic};
use crate::validator;

pub struct InstanceRegistry {
    file_path: PathBuf,
    instances: Mutex<Vec<ServerInstance>>,
}

impl InstanceRegistry {
    /// Load the catalog at `file_path`. A missing file is an empty catalog.
    pub fn open(file_path: impl Into<PathBuf>) -> Result<Self> {
        let file_path = file_path.into();
        let instances = Self::load(&file_path)?;
        Ok(Self {
            file_path,
            instances: Mutex::new(instances),
        })
    }

    fn load(file_path: &Path) -> Result<Vec<ServerInstance>> {
        if !file_path.exists() {
            tracing::info!("Instance catalog {} does not exist, starting empty", file_path.display());
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(file_path).map_err(SupervisorError::Persistence)?;
        let instances: Vec<ServerInstance> = serde_json::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Corrupt instance catalog {}: {}", file_path.display(), e)
        })?;
        tracing::info!("Loaded {} instances from {}", instances.len(), file_path.display());
        Ok(instances)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<ServerInstance>>> {
        self.instances.lock().map_err(|e| {
            tracing::error!("Instance catalog lock poisoned: {}", e);
            SupervisorError::Internal(anyhow::anyhow!("instance catalog lock poisoned"))
        })
    }

    fn save(&self, instances: &[ServerInstance]) -> Result<()> {
        let content = serde_json::to_vec_pretty(instances)
            .map_err(|e| anyhow::anyhow!("Failed to serialize instance catalog: {}", e))?;
        write_atomic(&self.file_path, &content).map_err(|e| {
            tracing::error!("Failed to save instance catalog {}: {}", self.file_path.display(), e);
            SupervisorError::Persistence(e)
        })?;
        tracing::debug!("Saved {} instances", instances.len());
        Ok(())
    }

    /// Validate, assign an id and persist a new instance.
    ///
    /// Name and port uniqueness are checked under the catalog lock so two
    /// concurrent creates can never claim the same port.
    pub fn create(&self, draft: InstanceDraft) -> Result<ServerInstance> {
        let mut instances = self.lock()?;

        validator::validate_draft(&draft, &instances)?;
        if let Some(conflict) = validator::check_port_conflicts(draft.port, &instances, None) {
            return Err(SupervisorError::PortInUse(conflict));
        }

        let id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !instances.iter().any(|i| i.id == candidate) {
                break candidate;
            }
        };
        let instance = draft.into_instance(id, current_timestamp());

        let mut next = instances.clone();
        next.push(instance.clone());
        self.save(&next)?;
        *instances = next;

        tracing::info!("Registered instance '{}' ({})", instance.name, instance.id);
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Result<ServerInstance> {
        self.lock()?
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.iter().any(|i| i.id == id))
    }

    /// All instances in creation order.
    pub fn list(&self) -> Result<Vec<ServerInstance>> {
        Ok(self.lock()?.clone())
    }

    /// Apply `patch` after re-validating every field it touches.
    pub fn update(&self, id: &str, patch: InstancePatch) -> Result<ServerInstance> {
        let mut instances = self.lock()?;
        let pos = instances
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;

        let mut updated = instances[pos].clone();
        patch.apply_to(&mut updated);

        if let Some(name) = &patch.name {
            validator::validate_name(name, &instances, Some(id))?;
        }
        if patch.port.is_some() {
            validator::validate_port(updated.port)?;
            if let Some(conflict) = validator::check_port_conflicts(updated.port, &instances, Some(id)) {
                return Err(SupervisorError::PortInUse(conflict));
            }
        }
        if patch.min_memory.is_some() || patch.max_memory.is_some() {
            validator::validate_memory(updated.min_memory, updated.max_memory)?;
        }
        if patch.java_path.is_some() {
            validator::validate_java_path(&updated.java_path)?;
        }

        let mut next = instances.clone();
        next[pos] = updated.clone();
        self.save(&next)?;
        *instances = next;
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<ServerInstance> {
        let mut instances = self.lock()?;
        let pos = instances
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;

        let mut next = instances.clone();
        let removed = next.remove(pos);
        self.save(&next)?;
        *instances = next;

        tracing::info!("Removed instance '{}' ({})", removed.name, removed.id);
        Ok(removed)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}
