//! Wires every collaborator into a running server: trust/rate limiting,
//! firewall and TLS setup, per-engine or multiplexed listeners, relay
//! dialers, UPnP renewal, mDNS advertisement, and graceful shutdown.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bridge_config::Config;
use bridge_engine_bridge::{run_bridge, BridgeContext};
use bridge_tls::Connection;
use bridge_trust::{ConnectionLedger, RateLimitConfig, TrustConfig, TrustFilter};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_rustls::TlsAcceptor;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_UPNP_RENEWAL: Duration = Duration::from_secs(1800);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub async fn run(config: Config, server_secret: String) -> std::process::ExitCode {
    if !crate::pidfile::check_and_clear_stale(&config.pid_file) {
        return std::process::ExitCode::FAILURE;
    }
    if let Err(error) = crate::pidfile::write(&config.pid_file) {
        tracing::error!(%error, path = %config.pid_file.display(), "failed to write PID file");
        return std::process::ExitCode::FAILURE;
    }

    let exit = run_inner(&config, &server_secret).await;
    crate::pidfile::remove(&config.pid_file);
    exit
}

async fn run_inner(config: &Config, server_secret: &str) -> std::process::ExitCode {
    let listen_ip: IpAddr = match config.listen_address.parse() {
        Ok(ip) => ip,
        Err(_) => {
            tracing::error!(address = %config.listen_address, "listen_address is not a valid IP address");
            return std::process::ExitCode::FAILURE;
        }
    };

    let (registry, resolved) = match crate::engines::build(config, &config.listen_address) {
        Ok(built) => built,
        Err(error) => {
            tracing::error!(%error, "failed to build engine registry");
            return std::process::ExitCode::FAILURE;
        }
    };
    if registry.is_empty() {
        tracing::warn!("no engines configured or discovered; listeners will accept but negotiate nothing");
    }
    let registry = Arc::new(registry);

    let trust = if config.enable_trusted_sources {
        Some(Arc::new(TrustFilter::new(TrustConfig {
            trusted_addresses: config.trusted_addresses.iter().copied().collect(),
            trusted_networks: config.trusted_networks.clone(),
        })))
    } else {
        None
    };

    let rate_limit = RateLimitConfig {
        retention: config.connection_attempt_period,
        max_per_address: config.max_connection_attempts,
        max_per_subnet: config.max_connection_attempts_from_untrusted_subnet,
        subnet_prefix_v4: bridge_core::net::DEFAULT_SUBNET_PREFIX_V4,
        subnet_prefix_v6: config.untrusted_subnet_prefix_v6,
    };

    let firewall = crate::collaborators::firewall(config);
    let trusted_network_strings: Vec<String> =
        config.trusted_networks.iter().map(crate::collaborators::cidr_to_string).collect();
    firewall.unblock_trusted(&config.trusted_addresses, &trusted_network_strings).await;
    if config.enable_firewall_rules {
        firewall.configure().await;
    }

    let tls_acceptor: Option<Arc<TlsAcceptor>> = if config.enable_tls {
        match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => match bridge_tls::load_acceptor(cert, key) {
                Ok(acceptor) => Some(Arc::new(acceptor)),
                Err(error) => {
                    tracing::error!(%error, "failed to initialize TLS, refusing to start");
                    return std::process::ExitCode::FAILURE;
                }
            },
            _ => {
                tracing::error!("enable_tls is set but certificate or key path is missing");
                return std::process::ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let ctx = Arc::new(BridgeContext {
        trust,
        ledger: Arc::new(ConnectionLedger::new()),
        rate_limit,
        enable_auto_trust: config.enable_auto_trust,
        enable_firewall_ip_blocking: config.enable_firewall_ip_blocking,
        enable_firewall_subnet_blocking: config.enable_firewall_subnet_blocking,
        firewall: firewall.clone(),
        auth: config.auth_config(),
        sessions: bridge_sessions::SessionManager::new(),
        global_overrides: config.global_overrides.clone(),
        log_untrusted_connection_attempts: config.log_untrusted_connection_attempts,
        inactivity_timeout: config.inactivity_timeout,
        heartbeat_time: config.heartbeat_time,
        watchdog_timer_interval: config.watchdog_timer_interval,
        session_keepalive: config.session_keepalive_timeout,
        info_throttle: Duration::from_millis(config.info_throttle_ms),
    });

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    let mut upnp_targets: Vec<(String, u16)> = Vec::new();
    let mut mdns_registered = Vec::new();

    let mdns = crate::collaborators::mdns(config, "chess-uci-bridge.local.");

    if config.enable_single_port {
        let actual_port = match bridge_listener::resolve_single_port(&config.listen_address, config.base_port) {
            Ok(port) => port,
            Err(error) => {
                tracing::error!(%error, "failed to resolve single listening port");
                return std::process::ExitCode::FAILURE;
            }
        };
        let addr = SocketAddr::new(listen_ip, actual_port);
        let Some(listener) = bridge_listener::bind_with_retry(addr, "multiplex").await else {
            return std::process::ExitCode::FAILURE;
        };

        upnp_targets.push(("multiplex".to_string(), actual_port));
        if config.enable_mdns {
            match mdns.register("chess-uci-bridge", actual_port) {
                Ok(()) => mdns_registered.push("chess-uci-bridge".to_string()),
                Err(error) => tracing::warn!(%error, "mDNS registration failed"),
            }
        }

        let registry = registry.clone();
        let ctx = ctx.clone();
        let tls_acceptor = tls_acceptor.clone();
        let listener_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            bridge_listener::serve(listener, "multiplex".to_string(), listener_cancel, move |stream, peer| {
                let registry = registry.clone();
                let ctx = ctx.clone();
                let tls_acceptor = tls_acceptor.clone();
                async move { handle_multiplex_connection(stream, peer, registry, ctx, tls_acceptor).await }
            })
            .await;
        }));

        if let Some(relay_host) = config.relay_server_url.clone() {
            let session_id = bridge_relay::derive_session_id(server_secret, bridge_relay::MULTIPLEX_SESSION_LABEL);
            let registry = registry.clone();
            let ctx = ctx.clone();
            let relay_cancel = cancel.clone();
            let relay_port = config.relay_server_port;
            tasks.push(tokio::spawn(async move {
                let dialer = bridge_relay::RelayDialer::new(relay_host, relay_port, session_id);
                dialer
                    .run(relay_cancel, move |reader, writer| {
                        let registry = registry.clone();
                        let ctx = ctx.clone();
                        async move { handle_relay_multiplex_session(reader, writer, registry, ctx).await }
                    })
                    .await;
            }));
        }
    } else {
        for engine in &resolved {
            let addr = SocketAddr::new(listen_ip, engine.listen_port);
            let label = engine.descriptor.name.clone();
            let Some(listener) = bridge_listener::bind_with_retry(addr, &label).await else {
                tracing::error!(engine = %label, "failed to bind listener, skipping this engine");
                continue;
            };

            upnp_targets.push((label.clone(), engine.listen_port));
            if config.enable_mdns {
                match mdns.register(&label, engine.listen_port) {
                    Ok(()) => mdns_registered.push(label.clone()),
                    Err(error) => tracing::warn!(%error, engine = %label, "mDNS registration failed"),
                }
            }

            let descriptor = Arc::new(engine.descriptor.clone());
            let ctx = ctx.clone();
            let tls_acceptor = tls_acceptor.clone();
            let listener_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                bridge_listener::serve(listener, label, listener_cancel, move |stream, peer| {
                    let descriptor = descriptor.clone();
                    let ctx = ctx.clone();
                    let tls_acceptor = tls_acceptor.clone();
                    async move { handle_direct_connection(stream, peer, descriptor, ctx, tls_acceptor).await }
                })
                .await;
            }));

            if let Some(relay_host) = config.relay_server_url.clone() {
                let session_id = bridge_relay::derive_session_id(server_secret, &engine.descriptor.name);
                let descriptor = Arc::new(engine.descriptor.clone());
                let ctx = ctx.clone();
                let relay_cancel = cancel.clone();
                let relay_port = config.relay_server_port;
                tasks.push(tokio::spawn(async move {
                    let dialer = bridge_relay::RelayDialer::new(relay_host, relay_port, session_id);
                    dialer
                        .run(relay_cancel, move |reader, writer| {
                            let descriptor = descriptor.clone();
                            let ctx = ctx.clone();
                            async move {
                                let peer = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
                                if let Err(error) = run_bridge(reader, writer, peer, descriptor, ctx, false, now_ms).await
                                {
                                    tracing::debug!(%error, "relay bridge session ended with error");
                                }
                            }
                        })
                        .await;
                }));
            }
        }
    }

    if config.enable_upnp {
        for (label, port) in upnp_targets {
            let upnp = crate::collaborators::upnp(config);
            let description = format!("chess-uci-bridge:{label}");
            let lease = config.upnp_lease_duration;
            let upnp_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match upnp.map_port(port, &description, lease).await {
                        Some((ip, mapped)) => tracing::info!(%ip, mapped, port, label = %label, "UPnP mapping active"),
                        None => tracing::warn!(port, label = %label, "UPnP mapping failed"),
                    }
                    let renew_after = if lease.is_zero() { DEFAULT_UPNP_RENEWAL } else { lease / 2 };
                    tokio::select! {
                        _ = tokio::time::sleep(renew_after) => {}
                        () = upnp_cancel.cancelled() => break,
                    }
                }
            }));
        }
    }

    let shutdown_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_cancel.cancel();
    });

    cancel.cancelled().await;
    for task in tasks {
        let _ = task.await;
    }
    let _ = signal_task.await;

    for name in &mdns_registered {
        mdns.unregister(name);
    }
    ctx.sessions.shutdown_all().await;

    std::process::ExitCode::SUCCESS
}

async fn accept_connection(stream: TcpStream, tls_acceptor: &Option<Arc<TlsAcceptor>>, peer: SocketAddr) -> Option<Connection> {
    match tls_acceptor {
        Some(acceptor) => match bridge_tls::accept_with_timeout(acceptor, stream, TLS_HANDSHAKE_TIMEOUT).await {
            Ok(conn) => Some(conn),
            Err(error) => {
                tracing::warn!(%error, %peer, "TLS handshake failed");
                None
            }
        },
        None => Some(Connection::plain(stream)),
    }
}

async fn handle_direct_connection(
    stream: TcpStream,
    peer: SocketAddr,
    descriptor: Arc<bridge_core::EngineDescriptor>,
    ctx: Arc<BridgeContext>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
) {
    let Some(conn) = accept_connection(stream, &tls_acceptor, peer).await else {
        return;
    };
    let (read_half, write_half) = bridge_tls::split(conn);
    let reader = BufReader::new(read_half);
    if let Err(error) = run_bridge(reader, write_half, peer.ip(), descriptor, ctx, true, now_ms).await {
        tracing::debug!(%error, %peer, "bridge session ended with error");
    }
}

async fn handle_multiplex_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<bridge_core::EngineRegistry>,
    ctx: Arc<BridgeContext>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
) {
    let Some(conn) = accept_connection(stream, &tls_acceptor, peer).await else {
        return;
    };
    let (read_half, write_half) = bridge_tls::split(conn);
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    let negotiated = match bridge_listener::negotiate(&mut reader, &mut writer, &registry).await {
        Ok(negotiated) => negotiated,
        Err(error) => {
            tracing::debug!(%error, %peer, "multiplex negotiation failed");
            return;
        }
    };
    let Some(descriptor) = registry.get(&negotiated.engine) else {
        tracing::warn!(engine = %negotiated.engine, "negotiated engine is no longer registered");
        return;
    };

    if let Err(error) = run_bridge(reader, writer, peer.ip(), descriptor, ctx, true, now_ms).await {
        tracing::debug!(%error, %peer, "bridge session ended with error");
    }
}

async fn handle_relay_multiplex_session(
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    registry: Arc<bridge_core::EngineRegistry>,
    ctx: Arc<BridgeContext>,
) {
    let mut reader = reader;
    let mut writer = writer;
    let negotiated = match bridge_listener::negotiate(&mut reader, &mut writer, &registry).await {
        Ok(negotiated) => negotiated,
        Err(error) => {
            tracing::debug!(%error, "relay multiplex negotiation failed");
            return;
        }
    };
    let Some(descriptor) = registry.get(&negotiated.engine) else {
        return;
    };
    let peer = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    if let Err(error) = run_bridge(reader, writer, peer, descriptor, ctx, false, now_ms).await {
        tracing::debug!(%error, "relay bridge session ended with error");
    }
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
