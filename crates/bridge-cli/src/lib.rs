#![deny(unsafe_code)]

//! Argument parsing for the `chess-uci-bridge` binary.
//!
//! Flags are flat, matching the original deployment script's
//! `sys.argv`-scanning style, rather than subcommands: `--add-engine`,
//! `--name`, and `--port` can all appear alongside each other. [`Cli::parse_args`]
//! turns the raw argument vector into one [`Command`], resolving which
//! one-shot action (if any) takes precedence over the default "serve"
//! behavior.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "chess-uci-bridge",
    version,
    about = "Network bridge exposing local UCI chess engines to remote clients"
)]
pub struct Cli {
    /// Path to the TOML configuration document.
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Increases log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Runs the interactive setup wizard. Not implemented in this build.
    #[arg(long)]
    pub setup: bool,

    /// Stops a running instance via its PID file.
    #[arg(long)]
    pub stop: bool,

    /// Adds an engine to the configuration and exits.
    #[arg(long, value_name = "PATH")]
    pub add_engine: Option<PathBuf>,

    /// Engine name to use with `--add-engine`.
    #[arg(long, requires = "add_engine")]
    pub name: Option<String>,

    /// Engine port to use with `--add-engine`.
    #[arg(long, requires = "add_engine")]
    pub port: Option<u16>,

    /// Emits a pairing QR code and connection file, then continues to serve.
    #[arg(long)]
    pub pair: bool,

    /// Emits a pairing QR code and connection file, then exits.
    #[arg(long)]
    pub pair_only: bool,

    /// Emits a connection file only, then exits.
    #[arg(long)]
    pub connection_file: bool,
}

/// The one action this invocation resolves to. Exactly one of these ever
/// applies; [`Cli::command`] picks the first that matches, in the same
/// precedence order the original script checked `sys.argv` flags in.
#[derive(Debug, Eq, PartialEq)]
pub enum Command {
    /// Run the interactive setup wizard — explicitly unsupported here.
    SetupUnsupported,
    /// Stop the running instance named by the configured PID file.
    Stop,
    /// Add one engine to the configuration file.
    AddEngine {
        path: PathBuf,
        name: Option<String>,
        port: Option<u16>,
    },
    /// Emit a connection file only, then exit.
    ConnectionFileOnly,
    /// Emit a QR code and connection file, then exit.
    PairOnly,
    /// Emit a QR code and connection file, then continue serving.
    PairAndServe,
    /// Normal server startup.
    Serve,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Resolves the flags on this invocation to a single [`Command`].
    pub fn command(&self) -> Command {
        if self.setup {
            return Command::SetupUnsupported;
        }
        if self.stop {
            return Command::Stop;
        }
        if let Some(path) = &self.add_engine {
            return Command::AddEngine {
                path: path.clone(),
                name: self.name.clone(),
                port: self.port,
            };
        }
        if self.pair_only {
            return Command::PairOnly;
        }
        if self.connection_file {
            return Command::ConnectionFileOnly;
        }
        if self.pair {
            return Command::PairAndServe;
        }
        Command::Serve
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["chess-uci-bridge"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn default_is_serve() {
        assert_eq!(parse(&[]).command(), Command::Serve);
    }

    #[test]
    fn stop_takes_precedence_over_pair() {
        let cli = parse(&["--stop", "--pair"]);
        assert_eq!(cli.command(), Command::Stop);
    }

    #[test]
    fn add_engine_carries_optional_name_and_port() {
        let cli = parse(&["--add-engine", "/bin/true", "--name", "stockfish", "--port", "9001"]);
        assert_eq!(
            cli.command(),
            Command::AddEngine {
                path: PathBuf::from("/bin/true"),
                name: Some("stockfish".to_string()),
                port: Some(9001),
            }
        );
    }

    #[test]
    fn pair_only_takes_precedence_over_pair() {
        let cli = parse(&["--pair", "--pair-only"]);
        assert_eq!(cli.command(), Command::PairOnly);
    }

    #[test]
    fn verbose_count_accumulates() {
        let cli = parse(&["-vv"]);
        assert_eq!(cli.verbose, 2);
    }
}
