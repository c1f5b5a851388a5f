use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bridge_core::descriptor::{EngineDescriptor, OptionOverride};
use bridge_throttle::{Decision, Throttler};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityClock;
use crate::context::BridgeContext;
use crate::error::BridgeError;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const STEADY_STATE_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs one client-to-engine bridge to completion.
///
/// `apply_trust_gate` is `false` for connections already vetted upstream
/// (multiplex negotiation already ran the trust gate once; a relay-paired
/// connection is authenticated by its session id instead of its peer
/// address), mirroring how a delegated handler is invoked with trust
/// checks already satisfied.
pub async fn run_bridge<R, W>(
    client_reader: BufReader<R>,
    client_writer: W,
    peer: IpAddr,
    descriptor: Arc<EngineDescriptor>,
    ctx: Arc<BridgeContext>,
    apply_trust_gate: bool,
    now_ms: impl Fn() -> u64,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    if apply_trust_gate {
        if let Err(()) = trust_gate(peer, &ctx, &now_ms).await {
            return Err(BridgeError::Untrusted);
        }
    }

    let mut client_reader = client_reader;
    let mut client_writer = client_writer;

    bridge_auth::handshake(&mut client_reader, &mut client_writer, &ctx.auth).await?;

    let (mut session, reattached, cancel) = ctx.sessions.acquire(&descriptor.name, &descriptor.path).await?;
    info!(engine = %descriptor.name, %peer, reattached, "bridge established");

    let activity = Arc::new(ActivityClock::new());

    let (heartbeat_tx, heartbeat_rx) = tokio::sync::mpsc::unbounded_channel();
    let heartbeat = tokio::spawn(heartbeat_task(heartbeat_tx, ctx.heartbeat_time, cancel.clone()));
    let watchdog = tokio::spawn(watchdog_task(
        activity.clone(),
        ctx.inactivity_timeout,
        ctx.watchdog_timer_interval,
        cancel.clone(),
    ));

    let result = run_session(
        &mut session,
        &mut client_reader,
        &mut client_writer,
        &descriptor,
        &ctx,
        &activity,
        &cancel,
        heartbeat_rx,
    )
    .await;

    cancel.cancel();
    heartbeat.abort();
    watchdog.abort();
    let keepalive = if result.as_ref().is_err_and(BridgeError::is_startup_failure) {
        Duration::ZERO
    } else {
        ctx.session_keepalive
    };
    ctx.sessions.release(session, keepalive).await;
    let _ = client_writer.shutdown().await;

    match &result {
        Ok(()) => info!(engine = %descriptor.name, %peer, "bridge closed"),
        Err(err) if err.is_startup_failure() => {
            error!(engine = %descriptor.name, %peer, error = %err, "bridge failed during startup")
        }
        Err(err) => warn!(engine = %descriptor.name, %peer, error = %err, "bridge closed"),
    }

    result
}

async fn trust_gate(peer: IpAddr, ctx: &BridgeContext, now_ms: &impl Fn() -> u64) -> Result<(), ()> {
    let Some(trust) = &ctx.trust else {
        return Ok(());
    };
    if trust.classify(peer) {
        return Ok(());
    }
    if ctx.enable_auto_trust {
        trust.add_auto_trust(peer);
        return Ok(());
    }

    // The subnet-key computation behind `record_attempt` is address-exclusion
    // arithmetic over fixed network ranges; run it off the event loop rather
    // than inline on the connection's own task.
    let ledger = ctx.ledger.clone();
    let rate_limit = ctx.rate_limit;
    let attempt_at = now_ms();
    let outcome = tokio::task::spawn_blocking(move || ledger.record_attempt(peer, attempt_at, &rate_limit))
        .await
        .expect("rate-limit worker task panicked");
    if ctx.log_untrusted() {
        warn!(target: "chess_bridge::trust::untrusted", %peer, "rejected connection attempt from untrusted address");
    }
    if ctx.enable_firewall_ip_blocking && outcome.address_exceeded {
        ctx.firewall.block_address(peer, &[]).await;
    }
    if ctx.enable_firewall_subnet_blocking && outcome.subnet_exceeded {
        ctx.firewall.block_network(&outcome.subnet_key, &[]).await;
    }
    Err(())
}

/// Sends a tick over `heartbeat_tx` on every interval, forever, until
/// cancelled. The actual `isready\n` write happens in the steady-state
/// loop's `select!` (see [`run_session`]), since `ChildStdin` has a single
/// owner; this task only supplies the schedule.
async fn heartbeat_task(
    heartbeat_tx: tokio::sync::mpsc::UnboundedSender<()>,
    interval: Duration,
    cancel: CancellationToken,
) {
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if heartbeat_tx.send(()).is_err() {
                    break;
                }
            }
        }
    }
}

async fn watchdog_task(
    activity: Arc<ActivityClock>,
    inactivity_timeout: Duration,
    check_interval: Duration,
    cancel: CancellationToken,
) {
    if inactivity_timeout.is_zero() {
        return;
    }
    let interval = if check_interval.is_zero() {
        Duration::from_secs(60)
    } else {
        check_interval
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if activity.idle_for() > inactivity_timeout {
                    debug!("inactivity watchdog closing idle bridge");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session<R, W>(
    session: &mut bridge_sessions::Session,
    client_reader: &mut BufReader<R>,
    client_writer: &mut W,
    descriptor: &EngineDescriptor,
    ctx: &BridgeContext,
    activity: &Arc<ActivityClock>,
    cancel: &CancellationToken,
    mut heartbeat_rx: tokio::sync::mpsc::UnboundedReceiver<()>,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    session.stdin.write_all(b"uci\n").await?;
    for line in descriptor.startup_setoption_lines() {
        session.stdin.write_all(format!("{line}\n").as_bytes()).await?;
    }
    session.stdin.flush().await?;

    wait_for_uciok(session).await?;

    let mut throttler = Throttler::new(ctx.info_throttle);
    let mut client_line = String::new();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            tick = heartbeat_rx.recv() => {
                match tick {
                    None => {}
                    Some(()) => {
                        // A write failure here (broken pipe, process exit)
                        // ends the whole bridge rather than just the
                        // heartbeat, since the pipe is shared with the
                        // client->engine loop.
                        if session.stdin.write_all(b"isready\n").await.is_err()
                            || session.stdin.flush().await.is_err()
                        {
                            return Ok(());
                        }
                    }
                }
            }
            read = timeout(STEADY_STATE_READ_TIMEOUT, async { client_line.clear(); client_reader.read_line(&mut client_line).await }) => {
                match read {
                    Err(_) => continue,
                    Ok(Ok(0)) => return Ok(()),
                    Ok(Err(err)) => return Err(classify_io_error(err)),
                    Ok(Ok(_)) => {
                        activity.touch();
                        let forwarded = rewrite_setoption(&client_line, descriptor, ctx);
                        session.stdin.write_all(forwarded.as_bytes()).await?;
                        session.stdin.write_all(b"\n").await?;
                        session.stdin.flush().await?;
                    }
                }
            }
            read = timeout(STEADY_STATE_READ_TIMEOUT, session.read_line()) => {
                match read {
                    Err(_) => continue,
                    Ok(None) => return Ok(()),
                    Ok(Some(line)) => {
                        if matches!(throttler.should_forward(&line, engine_clock_ms()), Decision::Forward) {
                            client_writer.write_all(line.as_bytes()).await?;
                            client_writer.write_all(b"\n").await?;
                            client_writer.flush().await?;
                        }
                    }
                }
            }
        }
    }
}

async fn wait_for_uciok(session: &mut bridge_sessions::Session) -> Result<(), BridgeError> {
    match timeout(STARTUP_TIMEOUT, async {
        loop {
            match session.read_line().await {
                Some(line) if line.contains("uciok") => return Ok(()),
                Some(_) => continue,
                None => return Err(BridgeError::EngineExitedEarly),
            }
        }
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(BridgeError::UciokTimeout),
    }
}

/// Applies the option-override precedence to one client-sent line: a
/// `setoption name <opt> value <val>` line is rewritten per the engine's
/// own override map, falling back to the global map, and passed through
/// unmodified in every other case.
fn rewrite_setoption(line: &str, descriptor: &EngineDescriptor, ctx: &BridgeContext) -> String {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let Some(option_name) = parse_setoption_name(trimmed) else {
        return trimmed.to_string();
    };

    match descriptor.overrides.get(&option_name) {
        Some(OptionOverride::Override) => trimmed.to_string(),
        Some(OptionOverride::Substitute(value)) => format!("setoption name {option_name} value {value}"),
        None => match ctx.global_overrides.get(&option_name) {
            Some(OptionOverride::Substitute(value)) => format!("setoption name {option_name} value {value}"),
            Some(OptionOverride::Override) | None => trimmed.to_string(),
        },
    }
}

fn parse_setoption_name(line: &str) -> Option<String> {
    let rest = line.strip_prefix("setoption name ")?;
    let (name, _) = rest.split_once(" value ")?;
    Some(name.to_string())
}

fn classify_io_error(err: std::io::Error) -> BridgeError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            BridgeError::ConnectionReset
        }
        ErrorKind::UnexpectedEof => BridgeError::IncompleteRead,
        _ => BridgeError::Io(err),
    }
}

fn engine_clock_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl BridgeContext {
    fn log_untrusted(&self) -> bool {
        self.log_untrusted_connection_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use bridge_auth::AuthConfig;
    use bridge_firewall::NoOpFirewall;
    use bridge_sessions::SessionManager;
    use bridge_trust::{ConnectionLedger, RateLimitConfig};

    fn descriptor_with_overrides() -> EngineDescriptor {
        let mut overrides = BTreeMap::new();
        overrides.insert("Hash".to_string(), OptionOverride::Substitute("512".to_string()));
        overrides.insert("Threads".to_string(), OptionOverride::Override);
        EngineDescriptor::new("stockfish", "/bin/true", 9000, overrides).unwrap()
    }

    fn ctx_with_global(global: BTreeMap<String, OptionOverride>) -> BridgeContext {
        BridgeContext {
            trust: None,
            ledger: Arc::new(ConnectionLedger::new()),
            rate_limit: RateLimitConfig::default(),
            enable_auto_trust: false,
            enable_firewall_ip_blocking: false,
            enable_firewall_subnet_blocking: false,
            firewall: Arc::new(NoOpFirewall),
            auth: AuthConfig::default(),
            sessions: SessionManager::new(),
            global_overrides: global,
            log_untrusted_connection_attempts: false,
            inactivity_timeout: Duration::from_secs(900),
            heartbeat_time: Duration::from_secs(300),
            watchdog_timer_interval: Duration::from_secs(60),
            session_keepalive: Duration::ZERO,
            info_throttle: Duration::from_millis(200),
        }
    }

    #[test]
    fn engine_local_override_sentinel_passes_through_client_value() {
        let descriptor = descriptor_with_overrides();
        let ctx = ctx_with_global(BTreeMap::new());
        let rewritten = rewrite_setoption("setoption name Threads value 7\n", &descriptor, &ctx);
        assert_eq!(rewritten, "setoption name Threads value 7");
    }

    #[test]
    fn engine_local_substitute_rewrites_value() {
        let descriptor = descriptor_with_overrides();
        let ctx = ctx_with_global(BTreeMap::new());
        let rewritten = rewrite_setoption("setoption name Hash value 16\n", &descriptor, &ctx);
        assert_eq!(rewritten, "setoption name Hash value 512");
    }

    #[test]
    fn falls_back_to_global_override_when_engine_has_none() {
        let descriptor = descriptor_with_overrides();
        let mut global = BTreeMap::new();
        global.insert(
            "MultiPV".to_string(),
            OptionOverride::Substitute("3".to_string()),
        );
        let ctx = ctx_with_global(global);
        let rewritten = rewrite_setoption("setoption name MultiPV value 1\n", &descriptor, &ctx);
        assert_eq!(rewritten, "setoption name MultiPV value 3");
    }

    #[test]
    fn unlisted_option_passes_through_unmodified() {
        let descriptor = descriptor_with_overrides();
        let ctx = ctx_with_global(BTreeMap::new());
        let rewritten = rewrite_setoption("setoption name Ponder value true\n", &descriptor, &ctx);
        assert_eq!(rewritten, "setoption name Ponder value true");
    }

    #[test]
    fn non_setoption_line_is_always_passthrough() {
        let descriptor = descriptor_with_overrides();
        let ctx = ctx_with_global(BTreeMap::new());
        let rewritten = rewrite_setoption("go depth 10\n", &descriptor, &ctx);
        assert_eq!(rewritten, "go depth 10");
    }
}
