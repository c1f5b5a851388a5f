//! `--add-engine`: edits the TOML configuration in place, grounded on the
//! original deployment script's `run_add_engine`. Auto-assigns a name from
//! the file stem and a port one past the highest port already configured
//! when the caller doesn't supply them.

use std::path::{Path, PathBuf};

pub enum AddEngineError {
    PathNotFound(PathBuf),
    ConfigNotFound,
    ConfigParse(String),
    ConfigNotATable,
    EnginesNotATable,
    DuplicateName(String),
    PortConflict { port: u16, owner: String },
}

impl std::fmt::Display for AddEngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PathNotFound(p) => write!(f, "engine path does not exist: {}", p.display()),
            Self::ConfigNotFound => write!(f, "configuration file not found; run with a valid --config first"),
            Self::ConfigParse(e) => write!(f, "invalid configuration: {e}"),
            Self::ConfigNotATable => write!(f, "configuration root must be a table"),
            Self::EnginesNotATable => write!(f, "'engines' key must be a table"),
            Self::DuplicateName(n) => write!(f, "engine '{n}' already exists in config"),
            Self::PortConflict { port, owner } => write!(f, "port {port} already used by engine '{owner}'"),
        }
    }
}

/// Adds one engine entry to the configuration file at `config_path`.
/// Returns the name and port actually assigned.
pub fn add_engine(
    config_path: &Path,
    engine_path: &Path,
    name: Option<String>,
    port: Option<u16>,
) -> Result<(String, u16), AddEngineError> {
    let engine_path = std::fs::canonicalize(engine_path).map_err(|_| AddEngineError::PathNotFound(engine_path.to_path_buf()))?;

    let name = name.unwrap_or_else(|| {
        engine_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("engine")
            .to_string()
    });

    let text = std::fs::read_to_string(config_path).map_err(|_| AddEngineError::ConfigNotFound)?;
    let mut doc: toml::Value = toml::from_str(&text).map_err(|e| AddEngineError::ConfigParse(e.to_string()))?;

    let base_port = doc
        .get("base_port")
        .and_then(toml::Value::as_integer)
        .unwrap_or(9998);

    let table = doc.as_table_mut().ok_or(AddEngineError::ConfigNotATable)?;
    let engines = table
        .entry("engines")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let engines = engines.as_table_mut().ok_or(AddEngineError::EnginesNotATable)?;

    if engines.contains_key(&name) {
        return Err(AddEngineError::DuplicateName(name));
    }

    let existing_ports: Vec<i64> = engines
        .values()
        .filter_map(|v| v.as_table()?.get("port")?.as_integer())
        .collect();

    let port = match port {
        Some(p) => p,
        None => {
            let highest = existing_ports.into_iter().max().unwrap_or(base_port - 1);
            (highest + 1) as u16
        }
    };

    if let Some((owner, _)) = engines
        .iter()
        .find(|(_, v)| v.as_table().and_then(|t| t.get("port")).and_then(toml::Value::as_integer) == Some(i64::from(port)))
    {
        return Err(AddEngineError::PortConflict {
            port,
            owner: owner.clone(),
        });
    }

    let mut entry = toml::Table::new();
    entry.insert("path".to_string(), toml::Value::String(engine_path.display().to_string()));
    entry.insert("port".to_string(), toml::Value::Integer(i64::from(port)));
    engines.insert(name.clone(), toml::Value::Table(entry));

    let rendered = toml::to_string_pretty(&doc).map_err(|e| AddEngineError::ConfigParse(e.to_string()))?;
    std::fs::write(config_path, rendered).map_err(|_| AddEngineError::ConfigNotFound)?;

    Ok((name, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn fake_engine(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::File::create(&path).unwrap();
        path
    }

    #[test]
    fn assigns_name_from_path_and_next_port() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(
            &dir,
            "listen_address = \"0.0.0.0\"\nmax_connections = 10\nbase_port = 9998\n\n[engines.alpha]\npath = \"/bin/true\"\nport = 9998\n",
        );
        let engine = fake_engine(&dir, "stockfish");
        let (name, port) = add_engine(&config, &engine, None, None).unwrap();
        assert_eq!(name, "stockfish");
        assert_eq!(port, 9999);
    }

    #[test]
    fn rejects_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(
            &dir,
            "listen_address = \"0.0.0.0\"\nmax_connections = 10\n\n[engines.stockfish]\npath = \"/bin/true\"\nport = 9000\n",
        );
        let engine = fake_engine(&dir, "stockfish");
        let err = add_engine(&config, &engine, None, None).unwrap_err();
        assert!(matches!(err, AddEngineError::DuplicateName(n) if n == "stockfish"));
    }

    #[test]
    fn rejects_explicit_port_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(
            &dir,
            "listen_address = \"0.0.0.0\"\nmax_connections = 10\n\n[engines.alpha]\npath = \"/bin/true\"\nport = 9000\n",
        );
        let engine = fake_engine(&dir, "beta");
        let err = add_engine(&config, &engine, None, Some(9000)).unwrap_err();
        assert!(matches!(err, AddEngineError::PortConflict { port: 9000, .. }));
    }
}
