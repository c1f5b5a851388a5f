//! Engine descriptors and the process-wide engine registry.
//!
//! A descriptor is built once at startup from configuration plus
//! auto-discovery and is immutable thereafter; callers pass resolved
//! descriptors through explicit `Arc` values rather than mutating a shared
//! registry in place.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A UCI option override policy entry.
///
/// Two-variant sum type rather than a boolean flag: either the client's
/// value is replaced with a literal substitute, or it is passed through
/// unmodified via the `Override` sentinel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OptionOverride {
    /// Replace the client-supplied value with this literal string.
    Substitute(String),
    /// Pass the client's value through unmodified.
    Override,
}

/// An immutable description of one engine subprocess reachable through the
/// bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineDescriptor {
    /// Unique, non-empty engine name used in the multiplex sub-protocol and logs.
    pub name: String,
    /// Path to the engine executable.
    pub path: PathBuf,
    /// TCP port this engine is reachable on in per-engine listener mode.
    pub port: u16,
    /// Per-engine UCI option overrides, keyed by option name.
    pub overrides: BTreeMap<String, OptionOverride>,
}

impl EngineDescriptor {
    /// Builds a descriptor, rejecting an empty name.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        port: u16,
        overrides: BTreeMap<String, OptionOverride>,
    ) -> Result<Self, DescriptorError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        Ok(Self {
            name,
            path: path.into(),
            port,
            overrides,
        })
    }

    /// Startup `setoption` lines derived from literal substitutions only.
    ///
    /// `Override` sentinels are never applied at startup — there is no
    /// client value yet to pass through.
    pub fn startup_setoption_lines(&self) -> Vec<String> {
        self.overrides
            .iter()
            .filter_map(|(name, value)| match value {
                OptionOverride::Substitute(v) => {
                    Some(format!("setoption name {name} value {v}"))
                }
                OptionOverride::Override => None,
            })
            .collect()
    }
}

/// Errors constructing an [`EngineDescriptor`].
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    /// The engine name was empty or whitespace-only.
    #[error("engine name must not be empty")]
    EmptyName,
}

/// Process-wide mapping from engine name to descriptor, built once at
/// startup and never mutated afterward.
#[derive(Clone, Debug, Default)]
pub struct EngineRegistry {
    engines: BTreeMap<String, Arc<EngineDescriptor>>,
    default_engine: Option<String>,
}

impl EngineRegistry {
    /// Builds a registry from an ordered collection of descriptors.
    ///
    /// Insertion order is preserved for the "first descriptor by insertion
    /// order" default-engine fallback; `default_engine`, when `Some`, must
    /// name a descriptor present in `descriptors`.
    pub fn new(
        descriptors: impl IntoIterator<Item = EngineDescriptor>,
        default_engine: Option<String>,
    ) -> Result<Self, RegistryError> {
        let mut engines = BTreeMap::new();
        let mut insertion_order = Vec::new();
        for descriptor in descriptors {
            if engines
                .insert(descriptor.name.clone(), Arc::new(descriptor.clone()))
                .is_some()
            {
                return Err(RegistryError::DuplicateName(descriptor.name));
            }
            insertion_order.push(descriptor.name);
        }

        if let Some(name) = &default_engine {
            if !engines.contains_key(name) {
                return Err(RegistryError::UnknownDefault(name.clone()));
            }
        }

        let default_engine = default_engine.or_else(|| insertion_order.into_iter().next());

        Ok(Self {
            engines,
            default_engine,
        })
    }

    /// Looks up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<Arc<EngineDescriptor>> {
        self.engines.get(name).cloned()
    }

    /// Names of all registered engines, in sorted order (for `ENGINE_LIST`).
    pub fn sorted_names(&self) -> Vec<&str> {
        self.engines.keys().map(String::as_str).collect()
    }

    /// The configured default engine, or the first descriptor by insertion
    /// order if none was configured.
    pub fn default_engine(&self) -> Option<Arc<EngineDescriptor>> {
        self.default_engine.as_ref().and_then(|n| self.get(n))
    }

    /// All descriptors in the registry.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EngineDescriptor>> {
        self.engines.values()
    }

    /// Number of registered engines.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether the registry holds no engines.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

/// Errors building an [`EngineRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two descriptors shared the same name.
    #[error("duplicate engine name: '{0}'")]
    DuplicateName(String),
    /// `default_engine` named an engine absent from the descriptor set.
    #[error("default engine '{0}' not found in engine map")]
    UnknownDefault(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, port: u16) -> EngineDescriptor {
        EngineDescriptor::new(name, "/bin/true", port, BTreeMap::new()).unwrap()
    }

    #[test]
    fn rejects_empty_name() {
        let err = EngineDescriptor::new("", "/bin/true", 1, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, DescriptorError::EmptyName));
    }

    #[test]
    fn default_engine_falls_back_to_first_insertion() {
        let registry = EngineRegistry::new([desc("b", 2), desc("a", 1)], None).unwrap();
        assert_eq!(registry.default_engine().unwrap().name, "b");
    }

    #[test]
    fn default_engine_honors_explicit_choice() {
        let registry =
            EngineRegistry::new([desc("a", 1), desc("b", 2)], Some("b".to_string())).unwrap();
        assert_eq!(registry.default_engine().unwrap().name, "b");
    }

    #[test]
    fn rejects_unknown_default() {
        let err = EngineRegistry::new([desc("a", 1)], Some("missing".to_string())).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDefault(_)));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = EngineRegistry::new([desc("a", 1), desc("a", 2)], None).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
    }

    #[test]
    fn sorted_names_are_sorted() {
        let registry = EngineRegistry::new([desc("charlie", 1), desc("alpha", 2)], None).unwrap();
        assert_eq!(registry.sorted_names(), vec!["alpha", "charlie"]);
    }

    #[test]
    fn startup_lines_skip_override_sentinel() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "Hash".to_string(),
            OptionOverride::Substitute("256".to_string()),
        );
        overrides.insert("Threads".to_string(), OptionOverride::Override);
        let descriptor = EngineDescriptor::new("e", "/bin/true", 1, overrides).unwrap();
        let lines = descriptor.startup_setoption_lines();
        assert_eq!(lines, vec!["setoption name Hash value 256"]);
    }
}
