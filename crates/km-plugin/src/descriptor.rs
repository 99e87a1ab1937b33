//! Plugin discovery: installed plugin binaries under the plugin directory.

use std::path::{Path, PathBuf};

use crate::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginSource {
    Installed,
    Development,
}

/// A plugin binary known to the host. Name and path come from discovery;
/// the version is learned at handshake.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: Option<String>,
    pub path: PathBuf,
    pub source: PluginSource,
}

/// Scan `dir` for executable plugin binaries. A missing directory yields an
/// empty set, not an error.
pub fn discover(dir: &Path) -> Result<Vec<PluginDescriptor>, PluginError> {
    let mut found = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(PluginError::Io(e)),
    };

    for entry in entries {
        let entry = entry.map_err(PluginError::Io)?;
        let path = entry.path();
        if !path.is_file() || !is_executable(&path) {
            continue;
        }
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        found.push(PluginDescriptor {
            name,
            version: None,
            path,
            source: PluginSource::Installed,
        });
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "exe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dir_is_empty() {
        let found = discover(Path::new("/nope/definitely/missing")).unwrap();
        assert!(found.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn discovers_only_executables_sorted() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();

        for (name, mode) in [("zeta", 0o755), ("alpha", 0o755), ("notes.txt", 0o644)] {
            let path = dir.path().join(name);
            std::fs::write(&path, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        }
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let found = discover(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(found.iter().all(|d| d.source == PluginSource::Installed));
    }
}
