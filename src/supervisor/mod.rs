pub mod error;
pub mod log_buffer;
pub mod managed_process;
pub mod state_machine;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use regex::Regex;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};

use crate::config::GlobalConfig;
use crate::importer::{self, modpack, properties};
use crate::instance::{
    AddExistingServerRequest, CreateServerRequest, ImportModpackRequest, ImportServerRequest,
    InstancePatch, InstanceRegistry, ServerInstance,
};
use crate::utils::current_timestamp;
use crate::validator;

pub use error::{Result, SupervisorError};
use log_buffer::LogRecord;
use managed_process::{ProcessController, SharedLogBuffer, SharedState, StopSettings};
use state_machine::{RuntimeState, ServerStatus};

/// Runtime side table entry for one registered instance. Never persisted.
pub struct InstanceRuntime {
    state: SharedState,
    logs: SharedLogBuffer,
    log_tx: broadcast::Sender<LogRecord>,
    /// Serializes lifecycle operations on this instance.
    control: Mutex<ProcessController>,
}

impl InstanceRuntime {
    fn new(controller: ProcessController) -> Self {
        Self {
            state: controller.state(),
            logs: controller.logs(),
            log_tx: controller.log_sender(),
            control: Mutex::new(controller),
        }
    }

    fn snapshot(&self) -> RuntimeState {
        self.state.borrow().clone()
    }
}

/// Catalog record merged with its live status, as returned by `list`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    #[serde(flatten)]
    pub instance: ServerInstance,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatusInfo {
    pub id: String,
    pub status: ServerStatus,
    pub pid: Option<u32>,
    /// Seconds. Frozen at the failure time for `Error`.
    pub uptime: Option<u64>,
    /// Failure reason while in `Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerStatusInfo {
    fn from_state(id: &str, state: &RuntimeState) -> Self {
        Self {
            id: id.to_string(),
            status: state.status(),
            pid: state.pid(),
            uptime: state.uptime(current_timestamp()),
            error: match state {
                RuntimeState::Error { reason, .. } => Some(reason.clone()),
                _ => None,
            },
        }
    }
}

pub struct Supervisor {
    config: GlobalConfig,
    registry: InstanceRegistry,
    runtimes: StdMutex<HashMap<String, Arc<InstanceRuntime>>>,
    log_pattern: Option<Arc<Regex>>,
}

impl Supervisor {
    /// Load the catalog. Every instance starts out `Stopped`: processes do
    /// not survive a daemon restart.
    pub fn load(config: GlobalConfig) -> Result<Self> {
        let log_pattern = match config.log_pattern.as_deref() {
            Some(pattern) => Some(Arc::new(Regex::new(pattern).map_err(|e| {
                anyhow::anyhow!("Invalid log_pattern '{}': {}", pattern, e)
            })?)),
            None => None,
        };
        let registry = InstanceRegistry::open(config.catalog_file())?;
        tracing::info!(
            "Supervisor loaded {} instances from {} (all Stopped)",
            registry.list()?.len(),
            registry.file_path().display()
        );

        Ok(Self {
            config,
            registry,
            runtimes: StdMutex::new(HashMap::new()),
            log_pattern,
        })
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    fn runtimes(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<InstanceRuntime>>>> {
        self.runtimes.lock().map_err(|e| {
            tracing::error!("Runtime table lock poisoned: {}", e);
            SupervisorError::Internal(anyhow::anyhow!("runtime table lock poisoned"))
        })
    }

    /// Runtime for a registered instance, created on first use.
    fn runtime(&self, id: &str) -> Result<Arc<InstanceRuntime>> {
        let mut runtimes = self.runtimes()?;
        if let Some(runtime) = runtimes.get(id) {
            return Ok(runtime.clone());
        }
        if !self.registry.contains(id)? {
            return Err(SupervisorError::NotFound(id.to_string()));
        }

        let controller = ProcessController::new(
            id,
            StopSettings {
                stop_command: self.config.stop_command.clone(),
                stop_timeout: self.config.stop_timeout(),
                kill_timeout: self.config.kill_timeout(),
            },
            self.config.log_capacity(),
            self.log_pattern.clone(),
        );
        let runtime = Arc::new(InstanceRuntime::new(controller));
        runtimes.insert(id.to_string(), runtime.clone());
        Ok(runtime)
    }

    fn existing_runtime(&self, id: &str) -> Result<Option<Arc<InstanceRuntime>>> {
        Ok(self.runtimes()?.get(id).cloned())
    }

    /// Field checks shared by every ingestion path, run before any file is
    /// inspected or extracted. The registry repeats them under its lock.
    fn precheck(&self, name: &str, min_memory: u32, max_memory: u32, port: u16, java_path: &str) -> Result<()> {
        let existing = self.registry.list()?;
        validator::validate_name(name, &existing, None)?;
        validator::validate_memory(min_memory, max_memory)?;
        validator::validate_port(port)?;
        validator::validate_java_path(java_path)?;
        if let Some(conflict) = validator::check_port_conflicts(port, &existing, None) {
            return Err(SupervisorError::PortInUse(conflict));
        }
        Ok(())
    }

    // ── ingestion ───────────────────────────────────────────

    pub async fn create(&self, req: CreateServerRequest) -> Result<ServerInstance> {
        self.precheck(&req.name, req.min_memory, req.max_memory, req.port, &req.java_path)?;
        let draft = importer::resolve_create(&req)?;
        self.register(self.registry.create(draft)?)
    }

    pub async fn import_server(&self, req: ImportServerRequest) -> Result<ServerInstance> {
        self.precheck(&req.name, req.min_memory, req.max_memory, req.port, &req.java_path)?;
        let draft = importer::resolve_jar(&req)?;
        let instance = self.registry.create(draft)?;

        let settings = [
            ("online-mode", req.online_mode.to_string()),
            ("server-port", instance.port.to_string()),
        ];
        if let Err(e) = properties::set_properties(&instance.path, &settings) {
            tracing::warn!("Failed to write server.properties for '{}': {}", instance.name, e);
        }
        self.register(instance)
    }

    /// Extract a modpack into `<data_dir>/servers/<uuid>` and register it.
    /// The extraction directory is removed again on any failure.
    pub async fn import_modpack(&self, req: ImportModpackRequest) -> Result<ServerInstance> {
        self.precheck(&req.name, req.min_memory, req.max_memory, req.port, &req.java_path)?;

        let target_dir = self.config.servers_dir().join(uuid::Uuid::new_v4().to_string());
        let resolved = {
            let target_dir = target_dir.clone();
            tokio::task::spawn_blocking(move || modpack::resolve_modpack(&req, &target_dir))
                .await
                .map_err(|e| anyhow::anyhow!("modpack extraction task failed: {}", e))
        };

        let registered = match resolved {
            Ok(Ok(draft)) => self.registry.create(draft),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        };
        match registered {
            Ok(instance) => {
                if let Err(e) = properties::set_properties(
                    &instance.path,
                    &[("server-port", instance.port.to_string())],
                ) {
                    tracing::warn!("Failed to write server.properties for '{}': {}", instance.name, e);
                }
                self.register(instance)
            }
            Err(e) => {
                tracing::warn!("Modpack import failed, removing {}: {}", target_dir.display(), e);
                remove_extraction(&target_dir);
                Err(e)
            }
        }
    }

    pub async fn add_existing_server(&self, req: AddExistingServerRequest) -> Result<ServerInstance> {
        self.precheck(&req.name, req.min_memory, req.max_memory, req.port, &req.java_path)?;
        let draft = importer::resolve_existing(&req)?;
        self.register(self.registry.create(draft)?)
    }

    fn register(&self, instance: ServerInstance) -> Result<ServerInstance> {
        self.runtime(&instance.id)?;
        tracing::info!(
            "Instance '{}' ({}) ready: {} {} on port {}",
            instance.name,
            instance.id,
            instance.core_type,
            instance.mc_version,
            instance.port
        );
        Ok(instance)
    }

    // ── lifecycle ───────────────────────────────────────────

    pub async fn start(&self, id: &str) -> Result<()> {
        let runtime = self.runtime(id)?;
        let mut control = runtime.control.lock().await;
        let instance = self.registry.get(id)?;

        if runtime.snapshot().is_settled() && instance.path.is_dir() {
            if let Err(e) = properties::set_properties(
                &instance.path,
                &[("server-port", instance.port.to_string())],
            ) {
                tracing::warn!("Failed to sync server-port for '{}': {}", instance.name, e);
            }
        }

        control.start(&instance).await?;

        let patch = InstancePatch {
            last_started_at: Some(current_timestamp()),
            ..InstancePatch::default()
        };
        if let Err(e) = self.registry.update(id, patch) {
            tracing::warn!("Failed to record start time for '{}': {}", instance.name, e);
        }
        Ok(())
    }

    /// Graceful stop. Idempotent for `Stopped` and `Error` instances.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let runtime = self.runtime(id)?;
        let mut control = runtime.control.lock().await;
        control.stop().await
    }

    pub async fn send_command(&self, id: &str, command: &str) -> Result<()> {
        let runtime = self.runtime(id)?;
        let control = runtime.control.lock().await;
        control.send_command(command).await
    }

    /// Stop the process if needed, then drop the catalog entry and the runtime.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let runtime = self.runtime(id)?;
        {
            let mut control = runtime.control.lock().await;
            control.stop().await?;
            self.registry.remove(id)?;
            control.retire();
        }
        self.runtimes()?.remove(id);
        tracing::info!("Instance '{}' deleted", id);
        Ok(())
    }

    pub async fn update_server_name(&self, id: &str, name: &str) -> Result<ServerInstance> {
        let updated = self.registry.update(id, InstancePatch::rename(name))?;
        tracing::info!("Instance '{}' renamed to '{}'", id, updated.name);
        Ok(updated)
    }

    /// Stop every live instance concurrently.
    pub async fn shutdown_all(&self) {
        let live: Vec<(String, Arc<InstanceRuntime>)> = match self.runtimes() {
            Ok(runtimes) => runtimes
                .iter()
                .filter(|(_, rt)| !rt.snapshot().is_settled())
                .map(|(id, rt)| (id.clone(), rt.clone()))
                .collect(),
            Err(e) => {
                tracing::error!("Cannot shut down instances: {}", e);
                return;
            }
        };
        if live.is_empty() {
            return;
        }

        tracing::info!("Stopping {} running instances", live.len());
        let mut tasks = tokio::task::JoinSet::new();
        for (id, runtime) in live {
            tasks.spawn(async move {
                let mut control = runtime.control.lock().await;
                if let Err(e) = control.stop().await {
                    tracing::error!("Failed to stop instance '{}': {}", id, e);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!("All instances stopped");
    }

    // ── queries ─────────────────────────────────────────────

    pub fn list(&self) -> Result<Vec<InstanceSummary>> {
        let instances = self.registry.list()?;
        let runtimes = self.runtimes()?;
        Ok(instances
            .into_iter()
            .map(|instance| {
                let status = runtimes
                    .get(&instance.id)
                    .map(|rt| rt.snapshot().status())
                    .unwrap_or(ServerStatus::Stopped);
                InstanceSummary { instance, status }
            })
            .collect())
    }

    pub fn get(&self, id: &str) -> Result<ServerInstance> {
        self.registry.get(id)
    }

    pub fn get_status(&self, id: &str) -> Result<ServerStatusInfo> {
        if !self.registry.contains(id)? {
            return Err(SupervisorError::NotFound(id.to_string()));
        }
        let state = self
            .existing_runtime(id)?
            .map(|rt| rt.snapshot())
            .unwrap_or(RuntimeState::Stopped);
        Ok(ServerStatusInfo::from_state(id, &state))
    }

    /// Status updates for one instance.
    pub fn watch_status(&self, id: &str) -> Result<watch::Receiver<RuntimeState>> {
        Ok(self.runtime(id)?.state.subscribe())
    }

    /// Log text with `seq > since`, oldest first.
    pub async fn get_logs(&self, id: &str, since: u64) -> Result<Vec<String>> {
        Ok(self
            .get_log_records(id, since)
            .await?
            .into_iter()
            .map(|r| r.line)
            .collect())
    }

    pub async fn get_log_records(&self, id: &str, since: u64) -> Result<Vec<LogRecord>> {
        let runtime = self.runtime(id)?;
        let logs = runtime.logs.lock().await;
        Ok(logs.read(since))
    }

    pub async fn recent_logs(&self, id: &str, count: usize) -> Result<Vec<LogRecord>> {
        let runtime = self.runtime(id)?;
        let logs = runtime.logs.lock().await;
        Ok(logs.recent(count))
    }

    /// Live log records as they are captured.
    pub fn subscribe_logs(&self, id: &str) -> Result<broadcast::Receiver<LogRecord>> {
        Ok(self.runtime(id)?.log_tx.subscribe())
    }

    /// Direct handle to the instance's buffer.
    pub fn log_buffer(&self, id: &str) -> Result<SharedLogBuffer> {
        Ok(self.runtime(id)?.logs.clone())
    }
}

fn remove_extraction(dir: &Path) {
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::error!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::StartupMode;
    use crate::validator::ValidationErrorType;

    fn setup() -> (tempfile::TempDir, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::load(GlobalConfig::with_data_dir(dir.path().join("data"))).unwrap();
        (dir, supervisor)
    }

    fn create_request(dir: &Path, name: &str, port: u16) -> CreateServerRequest {
        let jar = dir.join(format!("{}.jar", name));
        std::fs::write(&jar, b"x").unwrap();
        CreateServerRequest {
            name: name.to_string(),
            core_type: "vanilla".into(),
            mc_version: "1.20.4".into(),
            max_memory: 4096,
            min_memory: 1024,
            port,
            java_path: "java".into(),
            jar_path: jar.to_string_lossy().to_string(),
            startup_mode: StartupMode::Jar,
        }
    }

    #[tokio::test]
    async fn test_create_then_status_is_stopped() {
        let (dir, supervisor) = setup();
        let inst = supervisor.create(create_request(dir.path(), "survival", 25565)).await.unwrap();

        assert_eq!(inst.max_memory, 4096);
        assert_eq!(inst.path, dir.path());
        let status = supervisor.get_status(&inst.id).unwrap();
        assert_eq!(status.status, ServerStatus::Stopped);
        assert_eq!(status.pid, None);
        assert_eq!(status.uptime, None);

        let listed = supervisor.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ServerStatus::Stopped);
        let json = serde_json::to_value(&listed[0]).unwrap();
        assert_eq!(json["status"], "Stopped");
        assert_eq!(json["name"], "survival");
    }

    #[tokio::test]
    async fn test_validation_runs_before_resolution() {
        let (dir, supervisor) = setup();
        let mut req = create_request(dir.path(), "a", 25565);
        req.jar_path = "/missing/server.jar".into();
        req.min_memory = 0;

        match supervisor.create(req).await {
            Err(SupervisorError::Validation(e)) => {
                assert_eq!(e.field, "minMemory");
                assert_eq!(e.error_type, ValidationErrorType::OutOfRange);
            }
            other => panic!("unexpected: {:?}", other.map(|i| i.id)),
        }

        let mut req = create_request(dir.path(), "a", 25565);
        req.jar_path = "/missing/server.jar".into();
        assert!(matches!(
            supervisor.create(req).await,
            Err(SupervisorError::Validation(ref e)) if e.field == "jarPath"
        ));
        assert!(supervisor.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_command_when_stopped() {
        let (dir, supervisor) = setup();
        let inst = supervisor.create(create_request(dir.path(), "a", 25565)).await.unwrap();

        let err = supervisor.send_command(&inst.id, "say hi").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_RUNNING");
        assert_eq!(supervisor.get_status(&inst.id).unwrap().status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_id_everywhere() {
        let (_dir, supervisor) = setup();
        assert!(matches!(supervisor.start("nope").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(supervisor.stop("nope").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(supervisor.delete("nope").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(supervisor.get_status("nope"), Err(SupervisorError::NotFound(_))));
        assert!(matches!(supervisor.get_logs("nope", 0).await, Err(SupervisorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_log_cursor_through_supervisor() {
        let (dir, supervisor) = setup();
        let inst = supervisor.create(create_request(dir.path(), "a", 25565)).await.unwrap();

        let buffer = supervisor.log_buffer(&inst.id).unwrap();
        buffer.lock().await.append("Done (12.3s)!", log_buffer::LogStream::Stdout);

        let records = supervisor.get_log_records(&inst.id, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 1);
        assert_eq!(supervisor.get_logs(&inst.id, 0).await.unwrap(), vec!["Done (12.3s)!"]);
        assert!(supervisor.get_logs(&inst.id, 1).await.unwrap().is_empty());

        buffer.lock().await.append("Player joined", log_buffer::LogStream::Stdout);
        assert_eq!(supervisor.get_logs(&inst.id, 1).await.unwrap(), vec!["Player joined"]);
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let (dir, supervisor) = setup();
        let a = supervisor.create(create_request(dir.path(), "a", 25565)).await.unwrap();
        let b = supervisor.create(create_request(dir.path(), "b", 25566)).await.unwrap();

        assert_eq!(supervisor.update_server_name(&a.id, " lobby ").await.unwrap().name, "lobby");
        assert!(matches!(
            supervisor.update_server_name(&b.id, "LOBBY").await,
            Err(SupervisorError::Validation(_))
        ));
        assert!(matches!(
            supervisor.update_server_name(&b.id, "   ").await,
            Err(SupervisorError::Validation(_))
        ));

        supervisor.delete(&a.id).await.unwrap();
        assert!(matches!(supervisor.get_status(&a.id), Err(SupervisorError::NotFound(_))));
        let ids: Vec<String> = supervisor.list().unwrap().into_iter().map(|s| s.instance.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[tokio::test]
    async fn test_import_server_writes_properties() {
        let (dir, supervisor) = setup();
        let server_dir = dir.path().join("imported");
        std::fs::create_dir_all(&server_dir).unwrap();
        let jar = server_dir.join("paper-1.20.4-496.jar");
        std::fs::write(&jar, b"x").unwrap();

        let inst = supervisor
            .import_server(ImportServerRequest {
                name: "imported".into(),
                jar_path: jar.to_string_lossy().to_string(),
                startup_mode: StartupMode::Jar,
                java_path: "java".into(),
                max_memory: 2048,
                min_memory: 1024,
                port: 25590,
                online_mode: false,
            })
            .await
            .unwrap();

        assert_eq!(inst.core_type, "paper");
        assert_eq!(inst.online_mode, Some(false));
        assert_eq!(properties::get_property(&server_dir, "online-mode").as_deref(), Some("false"));
        assert_eq!(properties::get_property(&server_dir, "server-port").as_deref(), Some("25590"));
    }

    #[tokio::test]
    async fn test_failed_modpack_import_cleans_up() {
        let (dir, supervisor) = setup();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"not a zip").unwrap();

        let err = supervisor
            .import_modpack(ImportModpackRequest {
                name: "pack".into(),
                modpack_path: archive.to_string_lossy().to_string(),
                java_path: "java".into(),
                max_memory: 4096,
                min_memory: 2048,
                port: 25600,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED_MODPACK_FORMAT");

        let servers = supervisor.config().servers_dir();
        let leftovers = std::fs::read_dir(&servers).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
        assert!(supervisor.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_modpack_without_launcher_cleans_up() {
        use std::io::Write;

        let (dir, supervisor) = setup();
        let archive = dir.path().join("mods-only.zip");
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
        for (name, content) in [("mods/a.jar", "jar"), ("config/b.txt", "cfg")] {
            zip.start_file(name, zip::write::FileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();

        let err = supervisor
            .import_modpack(ImportModpackRequest {
                name: "pack".into(),
                modpack_path: archive.to_string_lossy().to_string(),
                java_path: "java".into(),
                max_memory: 4096,
                min_memory: 2048,
                port: 25601,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED_MODPACK_FORMAT");

        let servers = supervisor.config().servers_dir();
        let leftovers = std::fs::read_dir(&servers).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
        assert!(supervisor.list().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_log_pattern_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GlobalConfig::with_data_dir(dir.path());
        config.log_pattern = Some("(unclosed".into());
        assert!(matches!(Supervisor::load(config), Err(SupervisorError::Internal(_))));
    }
}
