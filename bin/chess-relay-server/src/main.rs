#![deny(unsafe_code)]

use clap::Parser;
use tokio_util::sync::CancellationToken;

/// Standalone rendezvous service for bridges that cannot be reached
/// directly; pairs a `server`-role leg with a `client`-role leg by session
/// id and relays bytes between them.
#[derive(Parser, Debug)]
#[command(name = "chess-relay-server", version, about = "Chess UCI relay rendezvous server")]
struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 19000)]
    port: u16,

    /// Maximum concurrent sessions.
    #[arg(long = "max-sessions", default_value_t = 100)]
    max_sessions: usize,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    bridge_logging::init(bridge_logging::Verbosity::Normal);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(port = args.port, %error, "failed to bind relay listener");
            return std::process::ExitCode::FAILURE;
        }
    };
    tracing::info!(port = args.port, max_sessions = args.max_sessions, "relay server listening");

    let registry = bridge_relay::RelayRegistry::new(args.max_sessions);
    let cancel = CancellationToken::new();

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_cancel.cancel();
    });

    bridge_relay::run_rendezvous_server(listener, registry, cancel).await;
    std::process::ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
