//! Auto-discovery of engine executables under a configured directory,
//! grounded on the original deployment script's `discover_engines`: a
//! single, non-recursive directory listing filtered by executable bit and
//! a list of well-known non-engine names/extensions.

use std::path::{Path, PathBuf};

const SKIP_NAMES: &[&str] = &[
    "readme",
    "license",
    "licence",
    "changelog",
    "changes",
    "copying",
    "notice",
    "authors",
    "contributors",
    "todo",
    "makefile",
    "cmakelists",
];

const SKIP_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "html", "json", "yml", "yaml", "xml", "cfg", "ini", "log", "sh", "bat", "py", "c", "h",
    "cpp", "zip", "tar", "gz", "7z", "dll", "so", "dylib", "pdf",
];

/// One discovered engine executable: its name (derived from the filename,
/// extension stripped) and absolute path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveredEngine {
    pub name: String,
    pub path: PathBuf,
}

/// Scans `directory`'s top-level entries for files that look like chess
/// engine executables. Returns entries sorted by name. An absent or
/// non-directory path yields an empty list rather than an error, matching
/// the "auto-discovery is optional" framing of `engine_directory`.
pub fn discover_engines(directory: &Path) -> Vec<DiscoveredEngine> {
    let Ok(entries) = std::fs::read_dir(directory) else {
        return Vec::new();
    };

    let mut names = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if is_engine_candidate(&path) {
            if let Some(name) = engine_name(&path) {
                names.push(DiscoveredEngine { name, path });
            }
        }
    }
    names.sort_by(|a, b| a.name.cmp(&b.name));
    names
}

fn engine_name(path: &Path) -> Option<String> {
    path.file_stem()?.to_str().map(str::to_string)
}

fn is_engine_candidate(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name)
        .to_lowercase();
    if SKIP_NAMES.contains(&stem.as_str()) {
        return false;
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if SKIP_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return false;
        }
    }
    is_executable(path)
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
    path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("exe")).unwrap_or(false)
}

/// Assigns sequential ports starting at `base_port` to a sorted engine
/// list, matching the original `assign_ports` helper.
pub fn assign_ports(engines: &[DiscoveredEngine], base_port: u16) -> Vec<(String, PathBuf, u16)> {
    engines
        .iter()
        .enumerate()
        .map(|(i, engine)| {
            (
                engine.name.clone(),
                engine.path.clone(),
                base_port.saturating_add(i as u16),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn discovers_executables_and_skips_known_non_engines() {
        let dir = tempfile::tempdir().unwrap();

        let engine_path = dir.path().join("stockfish");
        std::fs::File::create(&engine_path).unwrap().write_all(b"#!/bin/sh\n").unwrap();
        make_executable(&engine_path);

        let readme_path = dir.path().join("README.md");
        std::fs::File::create(&readme_path).unwrap();

        let non_executable = dir.path().join("lc0");
        std::fs::File::create(&non_executable).unwrap();

        let found = discover_engines(dir.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "stockfish");
    }

    #[test]
    fn missing_directory_yields_empty_list() {
        let found = discover_engines(Path::new("/no/such/directory"));
        assert!(found.is_empty());
    }

    #[test]
    fn assign_ports_is_sequential_from_base() {
        let engines = vec![
            DiscoveredEngine {
                name: "a".to_string(),
                path: PathBuf::from("/bin/a"),
            },
            DiscoveredEngine {
                name: "b".to_string(),
                path: PathBuf::from("/bin/b"),
            },
        ];
        let assigned = assign_ports(&engines, 9998);
        assert_eq!(assigned[0].2, 9998);
        assert_eq!(assigned[1].2, 9999);
    }
}
