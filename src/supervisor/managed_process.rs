//! Managed Process - spawning and controlling one server process
//!
//! A [`ProcessController`] owns at most one live child process at a time:
//! - launch command construction per startup mode
//! - stdout/stderr capture into the instance's [`LogBuffer`]
//! - stdin command injection
//! - exit detection and state transitions
//! - graceful stop with bounded escalation to forced termination

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};

use super::error::{Result, SupervisorError};
use super::log_buffer::{parse_log_level, LogBuffer, LogLevel, LogRecord, LogStream};
use super::state_machine::{RuntimeState, StateMachine, TransitionError};
use crate::instance::{ServerInstance, StartupMode};
use crate::utils::current_timestamp;
use crate::validator;

pub type SharedLogBuffer = Arc<Mutex<LogBuffer>>;
pub type SharedState = Arc<watch::Sender<RuntimeState>>;

/// Timing and quit command used by [`ProcessController::stop`].
#[derive(Debug, Clone)]
pub struct StopSettings {
    pub stop_command: String,
    pub stop_timeout: Duration,
    pub kill_timeout: Duration,
}

/// Program, arguments and working directory for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchPlan {
    /// Build the launch for `instance`. Memory flags are only passed for
    /// direct jar launches; scripts decide their own JVM options.
    pub fn for_instance(instance: &ServerInstance) -> io::Result<Self> {
        let entry = instance.jar_path.to_string_lossy().to_string();
        let (program, args) = match instance.startup_mode {
            StartupMode::Jar => {
                let mut args = vec![
                    format!("-Xms{}M", instance.min_memory),
                    format!("-Xmx{}M", instance.max_memory),
                ];
                args.extend(instance.jvm_args.iter().cloned());
                args.extend(["-jar".to_string(), entry, "nogui".to_string()]);
                (instance.java_path.trim().to_string(), args)
            }
            StartupMode::Sh => ("sh".to_string(), vec![entry]),
            StartupMode::Bat => {
                if !cfg!(target_os = "windows") {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "bat startup scripts can only be launched on Windows",
                    ));
                }
                ("cmd".to_string(), vec!["/C".to_string(), entry])
            }
        };
        Ok(Self {
            program,
            args,
            working_dir: instance.path.clone(),
        })
    }
}

/// Checks repeated right before every spawn, since paths and ports may have
/// changed since the instance was registered.
pub fn preflight(instance: &ServerInstance) -> io::Result<()> {
    if !instance.path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("working directory not found: {}", instance.path.display()),
        ));
    }

    let entry = resolve_entry(&instance.path, &instance.jar_path);
    if !entry.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("entry file not found: {}", entry.display()),
        ));
    }

    if instance.startup_mode == StartupMode::Jar {
        validator::validate_java_path(&instance.java_path)
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.message))?;
    }

    check_port_available(instance.port)
}

fn resolve_entry(working_dir: &Path, entry: &Path) -> PathBuf {
    if entry.is_absolute() {
        entry.to_path_buf()
    } else {
        working_dir.join(entry)
    }
}

/// Fails when something outside the supervisor already listens on `port`.
pub fn check_port_available(port: u16) -> io::Result<()> {
    match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) => Err(io::Error::new(
            e.kind(),
            format!("port {} is already bound by another process: {}", port, e),
        )),
    }
}

/// Apply `to` if the state machine allows it.
fn apply_transition(state: &watch::Sender<RuntimeState>, to: RuntimeState) -> std::result::Result<(), TransitionError> {
    let mut outcome = Ok(());
    state.send_if_modified(|current| {
        let mut sm = StateMachine {
            state: current.clone(),
        };
        match sm.transition(to) {
            Ok(()) => {
                *current = sm.state;
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        }
    });
    outcome
}

struct ProcessHandle {
    pid: u32,
    stdin_tx: mpsc::Sender<String>,
    kill_tx: Option<oneshot::Sender<()>>,
}

pub struct ProcessController {
    instance_id: String,
    state: SharedState,
    logs: SharedLogBuffer,
    log_tx: broadcast::Sender<LogRecord>,
    log_pattern: Option<Arc<Regex>>,
    settings: StopSettings,
    process: Option<ProcessHandle>,
    retired: bool,
}

impl ProcessController {
    pub fn new(
        instance_id: &str,
        settings: StopSettings,
        log_capacity: usize,
        log_pattern: Option<Arc<Regex>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(RuntimeState::Stopped);
        let (log_tx, _) = broadcast::channel(2048);
        Self {
            instance_id: instance_id.to_string(),
            state: Arc::new(state_tx),
            logs: Arc::new(Mutex::new(LogBuffer::new(log_capacity))),
            log_tx,
            log_pattern,
            settings,
            process: None,
            retired: false,
        }
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn logs(&self) -> SharedLogBuffer {
        self.logs.clone()
    }

    pub fn log_sender(&self) -> broadcast::Sender<LogRecord> {
        self.log_tx.clone()
    }

    /// Mark the controller as belonging to a deleted instance. Later start
    /// requests that were queued behind the delete fail with `NotFound`.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    /// Spawn the instance's process. Returns the pid.
    ///
    /// On failure the instance moves to `Error` and the OS error is returned
    /// as `SpawnFailure`.
    pub async fn start(&mut self, instance: &ServerInstance) -> Result<u32> {
        if self.retired {
            return Err(SupervisorError::NotFound(self.instance_id.clone()));
        }

        let since = current_timestamp();
        apply_transition(&self.state, RuntimeState::Starting { since }).map_err(|_| {
            SupervisorError::InvalidTransition {
                id: self.instance_id.clone(),
                action: "start",
                state: self.state.borrow().status(),
            }
        })?;

        match self.spawn(instance, since) {
            Ok(pid) => {
                // the waiter may already have recorded an early exit
                self.state.send_if_modified(|current| {
                    if matches!(current, RuntimeState::Starting { .. }) {
                        *current = RuntimeState::Running { pid, started_at: since };
                        true
                    } else {
                        false
                    }
                });
                tracing::info!("Instance '{}' started with PID {}", self.instance_id, pid);
                Ok(pid)
            }
            Err(e) => {
                tracing::error!("Failed to start instance '{}': {}", self.instance_id, e);
                if let Err(te) = apply_transition(&self.state, RuntimeState::error(None, None, e.to_string())) {
                    tracing::debug!("Instance '{}' not moved to error: {}", self.instance_id, te);
                }
                Err(SupervisorError::spawn(&self.instance_id, e))
            }
        }
    }

    fn spawn(&mut self, instance: &ServerInstance, started_at: u64) -> io::Result<u32> {
        preflight(instance)?;
        let plan = LaunchPlan::for_instance(instance)?;

        let mut cmd = TokioCommand::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(&plan.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        crate::utils::apply_creation_flags(&mut cmd);

        tracing::debug!(
            "Spawning '{}' {:?} in {}",
            plan.program,
            plan.args,
            plan.working_dir.display()
        );
        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "process exited before its pid could be read")
        })?;

        // ── output capture: readers feed one pump, the buffer's only writer ──
        let (line_tx, line_rx) = mpsc::channel::<(LogStream, String)>(1024);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, LogStream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, LogStream::Stderr, line_tx);
        } else {
            drop(line_tx);
        }
        spawn_log_pump(line_rx, self.logs.clone(), self.log_tx.clone(), self.log_pattern.clone());

        // ── stdin writer ─────────────────────────────────────
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(256);
        if let Some(mut stdin_handle) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(cmd) = stdin_rx.recv().await {
                    let data = if cmd.ends_with('\n') { cmd } else { format!("{}\n", cmd) };
                    if stdin_handle.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let state = self.state.clone();
        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let (clean, description) = match &exit {
                Ok(status) => (status.success(), format!("exited with {}", status)),
                Err(e) => (false, format!("could not be awaited: {}", e)),
            };
            tracing::info!("Instance '{}' process {} {}", instance_id, pid, description);

            state.send_if_modified(|current| {
                let next = match current {
                    RuntimeState::Stopping { .. } => RuntimeState::Stopped,
                    RuntimeState::Starting { .. } | RuntimeState::Running { .. } if clean => {
                        RuntimeState::Stopped
                    }
                    RuntimeState::Starting { .. } | RuntimeState::Running { .. } => {
                        tracing::warn!("Instance '{}' terminated unexpectedly", instance_id);
                        RuntimeState::error(
                            Some(pid),
                            Some(started_at),
                            format!("process {}", description),
                        )
                    }
                    RuntimeState::Stopped | RuntimeState::Error { .. } => return false,
                };
                *current = next;
                true
            });
        });

        self.process = Some(ProcessHandle {
            pid,
            stdin_tx,
            kill_tx: Some(kill_tx),
        });
        Ok(pid)
    }

    /// Write one line to the process's stdin. Only valid while `Running`.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let not_running = || SupervisorError::NotRunning(self.instance_id.clone());
        if !matches!(*self.state.borrow(), RuntimeState::Running { .. }) {
            return Err(not_running());
        }
        let handle = self.process.as_ref().ok_or_else(not_running)?;
        let line = command.trim_end_matches(['\r', '\n']).to_string();
        // never wait on a child that has stopped reading its console
        handle.stdin_tx.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SupervisorError::Internal(anyhow::anyhow!(
                "console input of instance '{}' is not being read",
                self.instance_id
            )),
            mpsc::error::TrySendError::Closed(_) => not_running(),
        })
    }

    /// Stop the process: quit command, then SIGTERM (Unix), then a forced
    /// kill, each bounded by the configured timeouts. A no-op when nothing
    /// is running.
    pub async fn stop(&mut self) -> Result<()> {
        let current = self.state.borrow().clone();
        let (pid, started_at) = match current {
            RuntimeState::Running { pid, started_at } | RuntimeState::Stopping { pid, started_at } => {
                (pid, started_at)
            }
            RuntimeState::Starting { .. } => {
                return Err(SupervisorError::InvalidTransition {
                    id: self.instance_id.clone(),
                    action: "stop",
                    state: current.status(),
                });
            }
            RuntimeState::Stopped | RuntimeState::Error { .. } => {
                self.process = None;
                return Ok(());
            }
        };

        if let Err(e) = apply_transition(&self.state, RuntimeState::Stopping { pid, started_at }) {
            tracing::debug!("Instance '{}' not moved to stopping: {}", self.instance_id, e);
        }
        let Some(mut handle) = self.process.take() else {
            // no handle means nothing we could signal
            if let Err(e) = apply_transition(&self.state, RuntimeState::Stopped) {
                tracing::debug!("Instance '{}' not moved to stopped: {}", self.instance_id, e);
            }
            return Ok(());
        };

        tracing::info!(
            "Stopping instance '{}' (pid {}) with '{}'",
            self.instance_id,
            handle.pid,
            self.settings.stop_command
        );
        if let Err(e) = handle.stdin_tx.try_send(self.settings.stop_command.clone()) {
            tracing::warn!(
                "Could not deliver quit command to instance '{}': {}",
                self.instance_id,
                e
            );
        }
        if self.wait_settled(self.settings.stop_timeout).await {
            return Ok(());
        }

        #[cfg(unix)]
        {
            tracing::warn!(
                "Instance '{}' ignored the quit command for {:?}, sending SIGTERM",
                self.instance_id,
                self.settings.stop_timeout
            );
            signal_group(handle.pid, nix::sys::signal::Signal::SIGTERM);
            if self.wait_settled(self.settings.kill_timeout).await {
                return Ok(());
            }
        }

        tracing::warn!("Force killing instance '{}' (pid {})", self.instance_id, handle.pid);
        #[cfg(unix)]
        signal_group(handle.pid, nix::sys::signal::Signal::SIGKILL);
        if let Some(kill_tx) = handle.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if self.wait_settled(self.settings.kill_timeout).await {
            return Ok(());
        }

        Err(SupervisorError::Internal(anyhow::anyhow!(
            "process {} of instance '{}' did not exit after a forced kill",
            handle.pid,
            self.instance_id
        )))
    }

    async fn wait_settled(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_settled())).await;
        matches!(settled, Ok(Ok(_)))
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!("Failed to send {:?} to process group {}: {}", signal, pid, e);
    }
}

/// Forward each line of `reader` to the pump. Bytes that are not valid UTF-8
/// are replaced rather than ending the capture.
fn spawn_line_reader<R>(reader: R, stream: LogStream, tx: mpsc::Sender<(LogStream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send((stream, line)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_log_pump(
    mut rx: mpsc::Receiver<(LogStream, String)>,
    logs: SharedLogBuffer,
    log_tx: broadcast::Sender<LogRecord>,
    pattern: Option<Arc<Regex>>,
) {
    tokio::spawn(async move {
        while let Some((stream, line)) = rx.recv().await {
            let mut level = parse_log_level(&line, pattern.as_deref());
            // stderr lines default to at least Warn
            if stream == LogStream::Stderr && level == LogLevel::Info {
                level = LogLevel::Warn;
            }
            let record = logs.lock().await.append_with_level(line, stream, level);
            let _ = log_tx.send(record);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_instance(mode: StartupMode) -> ServerInstance {
        ServerInstance {
            id: "abc".into(),
            name: "survival".into(),
            core_type: "paper".into(),
            core_version: String::new(),
            mc_version: "1.20.4".into(),
            path: PathBuf::from("/srv/mc"),
            jar_path: PathBuf::from("/srv/mc/paper.jar"),
            startup_mode: mode,
            java_path: "/opt/jdk/bin/java".into(),
            max_memory: 4096,
            min_memory: 1024,
            jvm_args: vec!["-XX:+UseG1GC".into()],
            port: 25565,
            online_mode: None,
            created_at: 0,
            last_started_at: None,
        }
    }

    fn settings() -> StopSettings {
        StopSettings {
            stop_command: "stop".into(),
            stop_timeout: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_jar_launch_plan() {
        let plan = LaunchPlan::for_instance(&make_instance(StartupMode::Jar)).unwrap();
        assert_eq!(plan.program, "/opt/jdk/bin/java");
        assert_eq!(
            plan.args,
            vec!["-Xms1024M", "-Xmx4096M", "-XX:+UseG1GC", "-jar", "/srv/mc/paper.jar", "nogui"]
        );
        assert_eq!(plan.working_dir, PathBuf::from("/srv/mc"));
    }

    #[test]
    fn test_script_launch_plan_has_no_memory_flags() {
        let mut inst = make_instance(StartupMode::Sh);
        inst.jar_path = PathBuf::from("run.sh");
        let plan = LaunchPlan::for_instance(&inst).unwrap();
        assert_eq!(plan.program, "sh");
        assert_eq!(plan.args, vec!["run.sh"]);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_bat_unsupported_off_windows() {
        let err = LaunchPlan::for_instance(&make_instance(StartupMode::Bat)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_preflight_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut inst = make_instance(StartupMode::Jar);
        inst.path = dir.path().to_path_buf();
        inst.jar_path = PathBuf::from("server.jar");
        inst.java_path = "java".into();
        inst.port = 0;

        let err = preflight(&inst).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("server.jar"));
    }

    #[test]
    fn test_port_bound_elsewhere() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(check_port_available(port).is_err());
        drop(listener);
    }

    #[tokio::test]
    async fn test_spawn_failure_moves_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut inst = make_instance(StartupMode::Jar);
        inst.path = dir.path().to_path_buf();
        inst.jar_path = dir.path().join("missing.jar");

        let mut controller = ProcessController::new("abc", settings(), 100, None);
        let err = controller.start(&inst).await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailure { .. }));
        assert_eq!(
            controller.state().borrow().status(),
            crate::supervisor::state_machine::ServerStatus::Error
        );
    }

    #[tokio::test]
    async fn test_command_and_stop_when_idle() {
        let mut controller = ProcessController::new("abc", settings(), 100, None);
        assert!(matches!(
            controller.send_command("say hi").await,
            Err(SupervisorError::NotRunning(_))
        ));
        assert!(controller.stop().await.is_ok());
        assert!(controller.stop().await.is_ok());
        assert_eq!(*controller.state().borrow(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn test_retired_controller_refuses_start() {
        let mut controller = ProcessController::new("abc", settings(), 100, None);
        controller.retire();
        let err = controller.start(&make_instance(StartupMode::Jar)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
    }
}
