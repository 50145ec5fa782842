//! Modpack archive import.
//!
//! The archive is extracted into a fresh directory, manifests from the common
//! distribution formats are read for version information, and the server
//! launch entry is located by naming convention.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{detect_core_type, search_tiers, EntryTier, ImportError, Result, UNKNOWN};
use crate::instance::{ImportModpackRequest, InstanceDraft, StartupMode};
use crate::validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModpackFormat {
    CurseForge,
    Modrinth,
}

/// What a modpack manifest says about the server it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModpackManifest {
    pub format: ModpackFormat,
    pub mc_version: Option<String>,
    pub loader: Option<String>,
    pub loader_version: Option<String>,
}

// ── manifest formats ────────────────────────────────────────

#[derive(Deserialize)]
struct CurseForgeManifest {
    minecraft: CurseForgeMinecraft,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurseForgeMinecraft {
    version: Option<String>,
    #[serde(default)]
    mod_loaders: Vec<CurseForgeLoader>,
}

#[derive(Deserialize)]
struct CurseForgeLoader {
    id: String,
    #[serde(default)]
    primary: bool,
}

#[derive(Deserialize)]
struct ModrinthIndex {
    #[serde(default)]
    dependencies: std::collections::HashMap<String, String>,
}

/// Resolve an extracted modpack. `target_dir` must not exist yet; the caller
/// removes it again if anything after extraction fails.
pub fn resolve_modpack(req: &ImportModpackRequest, target_dir: &Path) -> Result<InstanceDraft> {
    let archive = PathBuf::from(req.modpack_path.trim());
    validator::require_file("modpackPath", &archive)?;

    let is_zip = archive
        .extension()
        .map(|e| e.eq_ignore_ascii_case("zip") || e.eq_ignore_ascii_case("mrpack"))
        .unwrap_or(false);
    if !is_zip {
        return Err(ImportError::UnsupportedModpackFormat(format!(
            "{} is not a zip archive",
            archive.display()
        )));
    }

    tracing::info!("Extracting modpack {} to {}", archive.display(), target_dir.display());
    let extracted = extract_archive(&archive, target_dir)?;
    tracing::info!("Extracted {} files", extracted);

    let root = server_root(target_dir)?;
    let manifest = read_manifest(&root)?;

    let entry = search_tiers(&root, &[EntryTier::LoaderJars, EntryTier::Scripts, EntryTier::GenericJars]);
    let Some(entry) = entry else {
        return Err(match &manifest {
            Some(m) => ImportError::UnsupportedModpackFormat(format!(
                "{:?} manifest found but the pack has no server launcher (client-only pack?)",
                m.format
            )),
            None => ImportError::UnsupportedModpackFormat(format!(
                "no manifest and no server jar or launch script in {}",
                root.display()
            )),
        });
    };
    let startup_mode = StartupMode::detect(&entry).unwrap_or_default();

    let entry_name = entry
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let manifest_loader = manifest.as_ref().and_then(|m| m.loader.clone());
    let core_type = manifest_loader.unwrap_or_else(|| detect_core_type(&entry_name).to_string());
    let mc_version = manifest
        .as_ref()
        .and_then(|m| m.mc_version.clone())
        .or_else(|| super::version_from_name(&entry_name))
        .unwrap_or_else(|| UNKNOWN.to_string());
    let core_version = manifest
        .as_ref()
        .and_then(|m| m.loader_version.clone())
        .unwrap_or_default();

    tracing::info!(
        "Modpack entry {} ({} mode, {} {} for {})",
        entry.display(),
        startup_mode,
        core_type,
        core_version,
        mc_version
    );

    Ok(InstanceDraft {
        name: req.name.clone(),
        core_type,
        core_version,
        mc_version,
        path: root,
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

/// Extract every entry of `archive` below `target_dir`. Entries whose names
/// would escape the target are rejected. Returns the number of files written.
pub fn extract_archive(archive: &Path, target_dir: &Path) -> Result<usize> {
    fs::create_dir_all(target_dir)?;
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(ImportError::UnsupportedModpackFormat(format!(
                "archive entry '{}' points outside the extraction directory",
                entry.name()
            )));
        };
        let out_path = target_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = fs::File::create(&out_path)?;
            io::copy(&mut entry, &mut outfile)?;
            files += 1;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
    }
    Ok(files)
}

/// Archives often wrap everything in one top-level folder; descend into it.
fn server_root(extracted: &Path) -> Result<PathBuf> {
    let entries: Vec<fs::DirEntry> = fs::read_dir(extracted)?.collect::<io::Result<_>>()?;
    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(only.path()),
        _ => Ok(extracted.to_path_buf()),
    }
}

/// Read a CurseForge `manifest.json` or Modrinth `modrinth.index.json`.
/// Missing manifests are fine; unreadable ones are an unsupported format.
pub fn read_manifest(root: &Path) -> Result<Option<ModpackManifest>> {
    let curseforge = root.join("manifest.json");
    if curseforge.is_file() {
        let content = fs::read_to_string(&curseforge)?;
        let parsed: CurseForgeManifest = serde_json::from_str(&content).map_err(|e| {
            ImportError::UnsupportedModpackFormat(format!("invalid manifest.json: {}", e))
        })?;
        let loader = parsed
            .minecraft
            .mod_loaders
            .iter()
            .find(|l| l.primary)
            .or_else(|| parsed.minecraft.mod_loaders.first());
        // ids look like "forge-47.2.0" or "fabric-0.15.3"
        let (loader, loader_version) = match loader.and_then(|l| l.id.split_once('-')) {
            Some((name, version)) => (Some(name.to_ascii_lowercase()), Some(version.to_string())),
            None => (loader.map(|l| l.id.to_ascii_lowercase()), None),
        };
        return Ok(Some(ModpackManifest {
            format: ModpackFormat::CurseForge,
            mc_version: parsed.minecraft.version,
            loader,
            loader_version,
        }));
    }

    let modrinth = root.join("modrinth.index.json");
    if modrinth.is_file() {
        let content = fs::read_to_string(&modrinth)?;
        let parsed: ModrinthIndex = serde_json::from_str(&content).map_err(|e| {
            ImportError::UnsupportedModpackFormat(format!("invalid modrinth.index.json: {}", e))
        })?;
        let loader = [
            ("neoforge", "neoforge"),
            ("forge", "forge"),
            ("fabric-loader", "fabric"),
            ("quilt-loader", "quilt"),
        ]
        .iter()
        .find_map(|(key, name)| parsed.dependencies.get(*key).map(|v| (name.to_string(), v.clone())));
        return Ok(Some(ModpackManifest {
            format: ModpackFormat::Modrinth,
            mc_version: parsed.dependencies.get("minecraft").cloned(),
            loader: loader.as_ref().map(|(name, _)| name.clone()),
            loader_version: loader.map(|(_, version)| version),
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
        for (name, content) in files {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    fn request(archive: &Path) -> ImportModpackRequest {
        ImportModpackRequest {
            name: "pack".into(),
            modpack_path: archive.to_string_lossy().to_string(),
            java_path: "java".into(),
            max_memory: 6144,
            min_memory: 2048,
            port: 25580,
        }
    }

    #[test]
    fn test_curseforge_server_pack_in_wrapper_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.zip");
        write_zip(
            &archive,
            &[
                ("ServerFiles/manifest.json", r#"{"minecraft":{"version":"1.20.1","modLoaders":[{"id":"forge-47.2.0","primary":true}]}}"#),
                ("ServerFiles/forge-1.20.1-47.2.0-installer.jar", "x"),
                ("ServerFiles/startserver.sh", "#!/bin/sh\n"),
                ("ServerFiles/mods/jei.jar", "x"),
            ],
        );

        let target = dir.path().join("servers/abc");
        let draft = resolve_modpack(&request(&archive), &target).unwrap();
        assert_eq!(draft.path, target.join("ServerFiles"));
        assert_eq!(draft.jar_path, target.join("ServerFiles/startserver.sh"));
        assert_eq!(draft.startup_mode, StartupMode::Sh);
        assert_eq!(draft.core_type, "forge");
        assert_eq!(draft.core_version, "47.2.0");
        assert_eq!(draft.mc_version, "1.20.1");
    }

    #[test]
    fn test_fabric_launcher_preferred_over_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.zip");
        write_zip(
            &archive,
            &[
                ("modrinth.index.json", r#"{"dependencies":{"minecraft":"1.20.4","fabric-loader":"0.15.3"}}"#),
                ("fabric-server-launch.jar", "x"),
                ("start.sh", "#!/bin/sh\n"),
            ],
        );

        let target = dir.path().join("out");
        let draft = resolve_modpack(&request(&archive), &target).unwrap();
        assert_eq!(draft.jar_path, target.join("fabric-server-launch.jar"));
        assert_eq!(draft.startup_mode, StartupMode::Jar);
        assert_eq!(draft.core_type, "fabric");
        assert_eq!(draft.mc_version, "1.20.4");
    }

    #[test]
    fn test_client_only_pack_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("client.zip");
        write_zip(
            &archive,
            &[
                ("manifest.json", r#"{"minecraft":{"version":"1.20.1","modLoaders":[]}}"#),
                ("overrides/config/a.toml", "x"),
            ],
        );

        let err = resolve_modpack(&request(&archive), &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedModpackFormat(_)));
    }

    #[test]
    fn test_no_manifest_no_entry_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("junk.zip");
        write_zip(&archive, &[("readme.txt", "hi"), ("world/level.dat", "x")]);

        let err = resolve_modpack(&request(&archive), &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedModpackFormat(_)));
    }

    #[test]
    fn test_mods_only_pack_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mods-only.zip");
        write_zip(&archive, &[("mods/a.jar", "jar"), ("config/b.txt", "cfg")]);

        let err = resolve_modpack(&request(&archive), &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedModpackFormat(_)));
    }

    #[test]
    fn test_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.zip");
        fs::write(&archive, "definitely not a zip").unwrap();
        let err = resolve_modpack(&request(&archive), &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ImportError::Archive(_)));

        let rar = dir.path().join("pack.rar");
        fs::write(&rar, "x").unwrap();
        let err = resolve_modpack(&request(&rar), &dir.path().join("out2")).unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedModpackFormat(_)));
    }
}
