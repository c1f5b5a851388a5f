#![deny(unsafe_code)]

//! Verbosity flag system and `tracing-subscriber` wiring for the bridge
//! binaries. Both binaries call [`init`] once at startup; nothing else in
//! the workspace should touch `tracing_subscriber` directly.

use tracing_subscriber::EnvFilter;

/// The four verbosity levels the CLI surface exposes, from quietest to
/// loudest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Only warnings and errors.
    Quiet,
    /// The default: informational connection and lifecycle events.
    #[default]
    Normal,
    /// Adds debug-level detail from bridge internals.
    Verbose,
    /// Adds trace-level detail, including per-line throttler decisions.
    Debug,
}

impl Verbosity {
    fn directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "warn",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
            Verbosity::Debug => "trace",
        }
    }

    /// Increments by one step, saturating at [`Verbosity::Debug`]. Intended
    /// for a repeatable `-v` CLI flag.
    #[must_use]
    pub fn bump(self) -> Self {
        match self {
            Verbosity::Quiet => Verbosity::Normal,
            Verbosity::Normal => Verbosity::Verbose,
            Verbosity::Verbose | Verbosity::Debug => Verbosity::Debug,
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG`, when set, takes precedence over `verbosity` entirely — this
/// matches the usual `tracing-subscriber` convention and lets operators
/// override logging without touching the configuration file.
pub fn init(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_saturates_at_debug() {
        let mut v = Verbosity::Quiet;
        for _ in 0..10 {
            v = v.bump();
        }
        assert_eq!(v, Verbosity::Debug);
    }

    #[test]
    fn directives_are_valid_filter_strings() {
        for v in [Verbosity::Quiet, Verbosity::Normal, Verbosity::Verbose, Verbosity::Debug] {
            assert!(EnvFilter::try_new(v.directive()).is_ok());
        }
    }
}
