use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of log lines kept per instance.
pub const DEFAULT_LOG_BUFFER: usize = 10_000;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_KILL_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_STOP_COMMAND: &str = "stop";
/// Matches `[12:00:00] [Server thread/INFO]: ...` style lines.
pub const DEFAULT_LOG_PATTERN: &str = r"/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL|TRACE)\]";

/// Daemon-wide settings, read from `config/global.toml`.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// Holds `instances.json` and the `servers/` extraction root.
    pub data_dir: PathBuf,
    pub log_buffer_size: usize,
    /// Grace period after the quit command before signals are used.
    pub stop_timeout_secs: u64,
    /// Wait after each forced termination signal.
    pub kill_timeout_secs: u64,
    pub stop_command: String,
    /// Regex with a `level` capture group; `None` tags every line as info.
    pub log_pattern: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_buffer_size: DEFAULT_LOG_BUFFER,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            kill_timeout_secs: DEFAULT_KILL_TIMEOUT_SECS,
            stop_command: DEFAULT_STOP_COMMAND.to_string(),
            log_pattern: Some(DEFAULT_LOG_PATTERN.to_string()),
        }
    }
}

impl GlobalConfig {
    /// Load from `MCSM_CONFIG` (or `config/global.toml`), then apply the
    /// `MCSM_DATA_DIR` override.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("MCSM_CONFIG").unwrap_or_else(|_| "config/global.toml".to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        if let Ok(dir) = std::env::var("MCSM_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }

    /// A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&s)
            .map_err(|e| anyhow::anyhow!("Invalid config file {}: {}", path.display(), e))?;
        Ok(cfg)
    }

    /// Config rooted at `data_dir` with every other field defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.data_dir.join("instances.json")
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.data_dir.join("servers")
    }

    pub fn log_capacity(&self) -> usize {
        self.log_buffer_size.max(1)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_config_default() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.log_buffer_size, DEFAULT_LOG_BUFFER);
        assert_eq!(cfg.stop_command, "stop");
        assert_eq!(cfg.catalog_file(), PathBuf::from("./data").join("instances.json"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: GlobalConfig = toml::from_str(
            r#"
            data_dir = "/srv/mc"
            stop_timeout_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/mc"));
        assert_eq!(cfg.stop_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.kill_timeout_secs, DEFAULT_KILL_TIMEOUT_SECS);
        assert_eq!(cfg.servers_dir(), PathBuf::from("/srv/mc").join("servers"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = GlobalConfig::load_from(Path::new("./definitely/not/here.toml")).unwrap();
        assert_eq!(cfg.kill_timeout_secs, DEFAULT_KILL_TIMEOUT_SECS);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global.toml");
        std::fs::write(&path, "log_buffer_size = \"lots\"").unwrap();
        assert!(GlobalConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cfg = GlobalConfig::default();
        cfg.log_buffer_size = 0;
        assert_eq!(cfg.log_capacity(), 1);
    }
}
