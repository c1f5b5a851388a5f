#![deny(unsafe_code)]

//! Entry point for the `chess-uci-bridge` binary: resolves the CLI flags to
//! one action and dispatches to the matching handler.

mod add_engine;
mod collaborators;
mod engines;
mod pairing;
mod pidfile;
mod serve;

use std::process::ExitCode;

use bridge_cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let mut verbosity = bridge_logging::Verbosity::default();
    for _ in 0..cli.verbose {
        verbosity = verbosity.bump();
    }
    bridge_logging::init(verbosity);

    match cli.command() {
        Command::SetupUnsupported => {
            eprintln!("--setup is not implemented in this build; edit the configuration file directly");
            ExitCode::FAILURE
        }
        Command::Stop => run_stop(&cli.config).await,
        Command::AddEngine { path, name, port } => run_add_engine(&cli.config, &path, name, port),
        Command::ConnectionFileOnly => run_pairing(&cli.config, false).await,
        Command::PairOnly => run_pairing(&cli.config, true).await,
        Command::PairAndServe => {
            let exit = run_pairing(&cli.config, true).await;
            if exit != ExitCode::SUCCESS {
                return exit;
            }
            run_serve(&cli.config).await
        }
        Command::Serve => run_serve(&cli.config).await,
    }
}

async fn run_stop(config_path: &std::path::Path) -> ExitCode {
    let config = match bridge_config::load(config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    if pidfile::stop(&config.pid_file).await {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_add_engine(config_path: &std::path::Path, engine_path: &std::path::Path, name: Option<String>, port: Option<u16>) -> ExitCode {
    match add_engine::add_engine(config_path, engine_path, name, port) {
        Ok((name, port)) => {
            println!("Added engine '{name}' on port {port}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("failed to add engine: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run_pairing(config_path: &std::path::Path, print_qr: bool) -> ExitCode {
    let config = match bridge_config::load(config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    let server_secret = match bridge_config::ensure_server_secret(config_path) {
        Ok(secret) => secret,
        Err(error) => {
            eprintln!("failed to ensure server secret: {error}");
            return ExitCode::FAILURE;
        }
    };

    let (_registry, resolved) = match engines::build(&config, &config.listen_address) {
        Ok(built) => built,
        Err(error) => {
            eprintln!("failed to resolve engines: {error}");
            return ExitCode::FAILURE;
        }
    };

    let host_ip = engines::guess_local_ip();
    let certificate_fingerprint = config
        .tls_cert_path
        .as_ref()
        .and_then(|path| bridge_tls::certificate_fingerprint(path).ok());
    let external_host = if config.enable_upnp {
        crate::collaborators::upnp(&config)
            .map_port(config.base_port, "chess-uci-bridge:pairing", config.upnp_lease_duration)
            .await
            .map(|(ip, _)| ip)
    } else {
        None
    };
    let relay_sessions = pairing::relay_sessions(&config, &resolved, &server_secret);

    let ctx = pairing::build_context(&config, host_ip, &resolved, external_host, certificate_fingerprint, relay_sessions);

    if print_qr {
        if let Err(error) = pairing::print_qr(&ctx) {
            eprintln!("failed to render pairing QR code: {error}");
            return ExitCode::FAILURE;
        }
    }

    match pairing::write_connection_file(&ctx, config_path) {
        Ok(path) => {
            println!("Connection file written to {}", path.display());
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("failed to write connection file: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(config_path: &std::path::Path) -> ExitCode {
    let server_secret = match bridge_config::ensure_server_secret(config_path) {
        Ok(secret) => secret,
        Err(error) => {
            eprintln!("failed to ensure server secret: {error}");
            return ExitCode::FAILURE;
        }
    };
    let config = match bridge_config::load(config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    serve::run(config, server_secret).await
}
