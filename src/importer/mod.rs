//! Import resolution: turns a raw jar, an existing server directory or a
//! modpack archive into an [`InstanceDraft`].
//!
//! Nothing in this module touches the instance catalog. Resolution errors are
//! therefore always raised before any registry mutation.

pub mod modpack;
pub mod properties;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use glob::{MatchOptions, Pattern};
use regex::Regex;

use crate::instance::{
    AddExistingServerRequest, CreateServerRequest, ImportServerRequest, InstanceDraft, StartupMode,
};
use crate::validator::{self, ValidationError};

pub const UNKNOWN: &str = "unknown";

#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Unsupported modpack format: {0}")]
    UnsupportedModpackFormat(String),

    #[error("No launchable server jar or script found in {}", .0.display())]
    NoLaunchableEntryFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, ImportError>;

// ── ingestion paths ─────────────────────────────────────────

/// Fresh create: everything is supplied, only the jar must exist.
pub fn resolve_create(req: &CreateServerRequest) -> Result<InstanceDraft> {
    let jar_path = PathBuf::from(req.jar_path.trim());
    validator::require_file("jarPath", &jar_path)?;

    Ok(InstanceDraft {
        name: req.name.clone(),
        core_type: req.core_type.clone(),
        core_version: String::new(),
        mc_version: req.mc_version.clone(),
        path: parent_dir(&jar_path),
        jar_path,
        startup_mode: req.startup_mode,
        java_path: req.java_path.clone(),
        max_memory: req.max_memory,
        min_memory: req.min_memory,
        jvm_args: Vec::new(),
        port: req.port,
        online_mode: None,
    })
}

/// Raw jar import. Launch settings are taken as supplied; core type and game
/// version are detected from the jar.
pub fn resolve_jar(req: &ImportServerRequest) -> Result<InstanceDraft> {
    let jar_path = PathBuf::from(req.jar_path.trim());
    validator::require_file("jarPath", &jar_path)?;

    let file_name = file_name_of(&jar_path);
    Ok(InstanceDraft {
        name: req.name.clone(),
        core_type: detect_core_type(&file_name).to_string(),
        core_version: String::new(),
        mc_version: detect_mc_version(&jar_path),
        path: parent_dir(&jar_path),
        jar_path,
        startup_mode: req.startup_mode,
        java_path: req.java_path.clone(),
        max_memory: req.max_memory,
        min_memory: req.min_memory,
        jvm_args: Vec::new(),
        port: req.port,
        online_mode: Some(req.online_mode),
    })
}

/// Adopt a server directory that already exists on disk.
pub fn resolve_existing(req: &AddExistingServerRequest) -> Result<InstanceDraft> {
    let server_dir = PathBuf::from(req.server_path.trim());
    validator::require_dir("serverPath", &server_dir)?;

    let entry = match req.executable_path.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(exe) => {
            let exe = Path::new(exe);
            let exe = if exe.is_absolute() { exe.to_path_buf() } else { server_dir.join(exe) };
            validator::require_file("executablePath", &exe)?;
            exe
        }
        None => find_existing_entry(&server_dir, req.startup_mode)
            .ok_or_else(|| ImportError::NoLaunchableEntryFound(server_dir.clone()))?,
    };
    let startup_mode = StartupMode::detect(&entry).unwrap_or(req.startup_mode);

    // scripts say nothing about the server, the jar next to them might
    let identity_jar = if startup_mode == StartupMode::Jar {
        Some(entry.clone())
    } else {
        search_tiers(&server_dir, &[EntryTier::LoaderJars, EntryTier::GenericJars])
    };
    let (core_type, mc_version) = match &identity_jar {
        Some(jar) => (
            detect_core_type(&file_name_of(jar)).to_string(),
            detect_mc_version(jar),
        ),
        None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
    };

    tracing::info!(
        "Resolved existing server {} -> {} ({} mode, core {})",
        server_dir.display(),
        entry.display(),
        startup_mode,
        core_type
    );

    Ok(InstanceDraft {
        name: req.name.clone(),
        core_type,
        core_version: String::new(),
        mc_version,
        path: server_dir,
        jar_path: entry,
        startup_mode,
        java_path: req.java_path.clone(),
        max_memory: req.max_memory,
        min_memory: req.min_memory,
        jvm_args: Vec::new(),
        port: req.port,
        online_mode: None,
    })
}

// ── entry search ────────────────────────────────────────────

/// Groups of well-known launch entries, searched in the order given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTier {
    /// Mod loader launch jars.
    LoaderJars,
    /// `run`/`start`/`startserver`/`ServerStart` scripts.
    Scripts,
    /// Plain server jars.
    GenericJars,
}

const LOADER_JAR_PATTERNS: &[&str] = &[
    "fabric-server-launch.jar",
    "quilt-server-launch.jar",
    "neoforge-*.jar",
    "forge-*.jar",
    "*server-core*.jar",
];

const SCRIPT_STEMS: &[&str] = &["run", "start", "startserver", "ServerStart"];

const GENERIC_JAR_PATTERNS: &[&str] = &["server.jar", "minecraft_server*.jar"];

fn find_existing_entry(dir: &Path, preferred: StartupMode) -> Option<PathBuf> {
    let found = if preferred.is_script() {
        search_tiers(dir, &[EntryTier::Scripts, EntryTier::LoaderJars, EntryTier::GenericJars])
    } else {
        search_tiers(dir, &[EntryTier::LoaderJars, EntryTier::GenericJars, EntryTier::Scripts])
    };
    // last resort: any top-level jar named after a known server core
    found.or_else(|| {
        glob_files(dir, "*.jar")
            .into_iter()
            .find(|jar| !is_installer(jar) && detect_core_type(&file_name_of(jar)) != UNKNOWN)
    })
}

/// First match in `dir` (non-recursive) across `tiers`.
pub fn search_tiers(dir: &Path, tiers: &[EntryTier]) -> Option<PathBuf> {
    tiers.iter().find_map(|tier| match tier {
        EntryTier::LoaderJars => LOADER_JAR_PATTERNS.iter().find_map(|pattern| {
            glob_files(dir, pattern)
                .into_iter()
                .find(|p| !is_installer(p))
        }),
        EntryTier::Scripts => {
            let exts: [&str; 2] = if cfg!(target_os = "windows") { ["bat", "sh"] } else { ["sh", "bat"] };
            exts.iter().find_map(|ext| {
                SCRIPT_STEMS.iter().find_map(|stem| {
                    glob_files(dir, &format!("{}.{}", stem, ext)).into_iter().next()
                })
            })
        }
        EntryTier::GenericJars => GENERIC_JAR_PATTERNS
            .iter()
            .find_map(|pattern| glob_files(dir, pattern).into_iter().next()),
    })
}

fn is_installer(path: &Path) -> bool {
    file_name_of(path).to_ascii_lowercase().contains("installer")
}

fn glob_files(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full = format!("{}/{}", Pattern::escape(&dir.to_string_lossy()), pattern);
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    match glob::glob_with(&full, options) {
        Ok(paths) => paths.filter_map(|p| p.ok()).filter(|p| p.is_file()).collect(),
        Err(e) => {
            tracing::warn!("Invalid search pattern '{}': {}", full, e);
            Vec::new()
        }
    }
}

// ── detection ───────────────────────────────────────────────

/// Server flavor from a jar or script file name.
pub fn detect_core_type(file_name: &str) -> &'static str {
    let name = file_name.to_ascii_lowercase();
    const KNOWN: &[&str] = &[
        "neoforge", "forge", "fabric", "quilt", "purpur", "paper", "spigot", "mohist", "arclight",
    ];
    if let Some(core) = KNOWN.iter().copied().find(|core| name.contains(core)) {
        return core;
    }
    if name == "server.jar" || name.starts_with("minecraft_server") || name.contains("vanilla") {
        return "vanilla";
    }
    UNKNOWN
}

/// Game version of a server jar: `version.json` inside the jar when present,
/// else the first `N.N[.N]` in the file name.
pub fn detect_mc_version(jar: &Path) -> String {
    if let Some(version) = read_embedded_version(jar) {
        return version;
    }
    version_from_name(&file_name_of(jar)).unwrap_or_else(|| UNKNOWN.to_string())
}

fn read_embedded_version(jar: &Path) -> Option<String> {
    let file = std::fs::File::open(jar).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    let mut entry = archive.by_name("version.json").ok()?;
    let mut content = String::new();
    entry.read_to_string(&mut content).ok()?;
    let json: serde_json::Value = serde_json::from_str(&content).ok()?;
    json.get("id")
        .or_else(|| json.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

pub fn version_from_name(name: &str) -> Option<String> {
    static VERSION_RE: OnceLock<Option<Regex>> = OnceLock::new();
    VERSION_RE
        .get_or_init(|| Regex::new(r"\d+\.\d+(?:\.\d+)?").ok())
        .as_ref()?
        .find(name)
        .map(|m| m.as_str().to_string())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
