pub mod registry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use registry::InstanceRegistry;

/// How an instance's process is launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupMode {
    /// `java ... -jar <entry> nogui`
    #[default]
    Jar,
    /// Windows batch script
    Bat,
    /// POSIX shell script
    Sh,
}

impl StartupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jar => "jar",
            Self::Bat => "bat",
            Self::Sh => "sh",
        }
    }

    /// Infer the mode from a file's extension, falling back to a `#!` shebang.
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("jar") => Some(Self::Jar),
            Some("bat") | Some("cmd") => Some(Self::Bat),
            Some("sh") => Some(Self::Sh),
            _ => {
                let mut head = [0u8; 2];
                let mut file = std::fs::File::open(path).ok()?;
                std::io::Read::read_exact(&mut file, &mut head).ok()?;
                (&head == b"#!").then_some(Self::Sh)
            }
        }
    }

    /// Script modes get no JVM memory flags.
    pub fn is_script(&self) -> bool {
        !matches!(self, Self::Jar)
    }
}

impl fmt::Display for StartupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StartupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jar" => Ok(Self::Jar),
            "bat" => Ok(Self::Bat),
            "sh" => Ok(Self::Sh),
            other => Err(format!("unknown startup mode '{}' (expected jar, bat or sh)", other)),
        }
    }
}

/// A persisted server instance. Runtime state lives in the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInstance {
    pub id: String,
    pub name: String,
    pub core_type: String,
    #[serde(default)]
    pub core_version: String,
    pub mc_version: String,
    /// Working directory of the process.
    pub path: PathBuf,
    /// Server jar or launch script, depending on `startup_mode`.
    pub jar_path: PathBuf,
    #[serde(default)]
    pub startup_mode: StartupMode,
    pub java_path: String,
    pub max_memory: u32,
    pub min_memory: u32,
    #[serde(default)]
    pub jvm_args: Vec<String>,
    pub port: u16,
    /// Only set for imported servers.
    #[serde(default)]
    pub online_mode: Option<bool>,
    pub created_at: u64,
    #[serde(default)]
    pub last_started_at: Option<u64>,
}

/// Normalized launch configuration produced by every ingestion path and
/// consumed by [`InstanceRegistry::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDraft {
    pub name: String,
    pub core_type: String,
    pub core_version: String,
    pub mc_version: String,
    pub path: PathBuf,
    pub jar_path: PathBuf,
    pub startup_mode: StartupMode,
    pub java_path: String,
    pub max_memory: u32,
    pub min_memory: u32,
    pub jvm_args: Vec<String>,
    pub port: u16,
    pub online_mode: Option<bool>,
}

impl InstanceDraft {
    pub(crate) fn into_instance(self, id: String, created_at: u64) -> ServerInstance {
        ServerInstance {
            id,
            name: self.name.trim().to_string(),
            core_type: self.core_type,
            core_version: self.core_version,
            mc_version: self.mc_version,
            path: self.path,
            jar_path: self.jar_path,
            startup_mode: self.startup_mode,
            java_path: self.java_path,
            max_memory: self.max_memory,
            min_memory: self.min_memory,
            jvm_args: self.jvm_args,
            port: self.port,
            online_mode: self.online_mode,
            created_at,
            last_started_at: None,
        }
    }
}

/// Partial update applied by [`InstanceRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub max_memory: Option<u32>,
    pub min_memory: Option<u32>,
    pub java_path: Option<String>,
    pub jvm_args: Option<Vec<String>>,
    pub last_started_at: Option<u64>,
}

impl InstancePatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub(crate) fn apply_to(&self, instance: &mut ServerInstance) {
        if let Some(name) = &self.name {
            instance.name = name.trim().to_string();
        }
        if let Some(port) = self.port {
            instance.port = port;
        }
        if let Some(max) = self.max_memory {
            instance.max_memory = max;
        }
        if let Some(min) = self.min_memory {
            instance.min_memory = min;
        }
        if let Some(java) = &self.java_path {
            instance.java_path = java.clone();
        }
        if let Some(args) = &self.jvm_args {
            instance.jvm_args = args.clone();
        }
        if let Some(ts) = self.last_started_at {
            instance.last_started_at = Some(ts);
        }
    }
}

fn default_startup_mode() -> StartupMode {
    StartupMode::Jar
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServerRequest {
    pub name: String,
    pub core_type: String,
    pub mc_version: String,
    pub max_memory: u32,
    pub min_memory: u32,
    pub port: u16,
    pub java_path: String,
    pub jar_path: String,
    #[serde(default = "default_startup_mode")]
    pub startup_mode: StartupMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportServerRequest {
    pub name: String,
    pub jar_path: String,
    pub startup_mode: StartupMode,
    pub java_path: String,
    pub max_memory: u32,
    pub min_memory: u32,
    pub port: u16,
    pub online_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportModpackRequest {
    pub name: String,
    pub modpack_path: String,
    pub java_path: String,
    pub max_memory: u32,
    pub min_memory: u32,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddExistingServerRequest {
    pub name: String,
    pub server_path: String,
    pub java_path: String,
    pub max_memory: u32,
    pub min_memory: u32,
    pub port: u16,
    pub startup_mode: StartupMode,
    #[serde(default)]
    pub executable_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_mode_parse() {
        assert_eq!("jar".parse::<StartupMode>().unwrap(), StartupMode::Jar);
        assert_eq!(" SH ".parse::<StartupMode>().unwrap(), StartupMode::Sh);
        assert!("exe".parse::<StartupMode>().is_err());
        assert!(StartupMode::Bat.is_script());
        assert!(!StartupMode::Jar.is_script());
    }

    #[test]
    fn test_startup_mode_detect() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("launch");
        std::fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        let plain = dir.path().join("notes");
        std::fs::write(&plain, "hello").unwrap();

        assert_eq!(StartupMode::detect(Path::new("server.JAR")), Some(StartupMode::Jar));
        assert_eq!(StartupMode::detect(Path::new("run.cmd")), Some(StartupMode::Bat));
        assert_eq!(StartupMode::detect(Path::new("run.sh")), Some(StartupMode::Sh));
        assert_eq!(StartupMode::detect(&script), Some(StartupMode::Sh));
        assert_eq!(StartupMode::detect(&plain), None);
    }

    #[test]
    fn test_create_request_defaults_to_jar() {
        let req: CreateServerRequest = serde_json::from_value(serde_json::json!({
            "name": "survival",
            "coreType": "paper",
            "mcVersion": "1.20.4",
            "maxMemory": 4096,
            "minMemory": 1024,
            "port": 25565,
            "javaPath": "java",
            "jarPath": "/srv/paper.jar"
        }))
        .unwrap();
        assert_eq!(req.startup_mode, StartupMode::Jar);
    }

    #[test]
    fn test_old_catalog_record_loads() {
        let inst: ServerInstance = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "name": "old",
            "core_type": "vanilla",
            "mc_version": "1.19.2",
            "path": "/srv/old",
            "jar_path": "/srv/old/server.jar",
            "java_path": "java",
            "max_memory": 2048,
            "min_memory": 512,
            "port": 25565,
            "created_at": 1
        }))
        .unwrap();
        assert_eq!(inst.startup_mode, StartupMode::Jar);
        assert!(inst.jvm_args.is_empty());
        assert_eq!(inst.online_mode, None);
    }

    #[test]
    fn test_patch_rename_trims() {
        let mut inst = InstanceDraft {
            name: "a".into(),
            core_type: "vanilla".into(),
            core_version: String::new(),
            mc_version: "1.20.1".into(),
            path: PathBuf::from("/srv"),
            jar_path: PathBuf::from("/srv/server.jar"),
            startup_mode: StartupMode::Jar,
            java_path: "java".into(),
            max_memory: 2048,
            min_memory: 1024,
            jvm_args: vec![],
            port: 25565,
            online_mode: None,
        }
        .into_instance("id-1".into(), 10);
        InstancePatch::rename("  lobby  ").apply_to(&mut inst);
        assert_eq!(inst.name, "lobby");
        assert_eq!(inst.port, 25565);
    }
}
