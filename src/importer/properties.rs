//! Minimal `server.properties` editing. Unknown keys, comments and ordering
//! are preserved; only the given keys are replaced or appended.

use std::io;
use std::path::Path;

use crate::utils::write_atomic;

pub const FILE_NAME: &str = "server.properties";

/// Set `pairs` in `<server_dir>/server.properties`, creating the file if needed.
pub fn set_properties(server_dir: &Path, pairs: &[(&str, String)]) -> io::Result<()> {
    let path = server_dir.join(FILE_NAME);
    let existing = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let mut remaining: Vec<&(&str, String)> = pairs.iter().collect();
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let key = line.split_once('=').map(|(k, _)| k.trim());
            match key.and_then(|k| remaining.iter().position(|(name, _)| *name == k)) {
                Some(idx) if !line.trim_start().starts_with('#') => {
                    let (name, value) = remaining.remove(idx);
                    format!("{}={}", name, value)
                }
                _ => line.to_string(),
            }
        })
        .collect();
    lines.extend(remaining.into_iter().map(|(name, value)| format!("{}={}", name, value)));

    let mut content = lines.join("\n");
    content.push('\n');
    write_atomic(&path, content.as_bytes())
}

pub fn get_property(server_dir: &Path, key: &str) -> Option<String> {
    let content = std::fs::read_to_string(server_dir.join(FILE_NAME)).ok()?;
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().to_string())
}
