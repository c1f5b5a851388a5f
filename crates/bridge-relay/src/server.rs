use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FIRST_LINE_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const STALE_AFTER: Duration = Duration::from_secs(3600);
const COPY_BUFFER: usize = 4096;

/// One registered (and possibly paired) relay session.
struct SessionSlot {
    generation: u64,
    cancel: CancellationToken,
    registered_at: Instant,
    client: Option<(OwnedReadHalf, OwnedWriteHalf)>,
    /// Shared with the task that owns this leg so supersession can reach in
    /// and close it even though it otherwise lives on that task's stack.
    server_writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    notify: Arc<Notify>,
}

/// The rendezvous table shared by every accepted connection. One instance
/// serves every session id a relay-capable bridge may register.
pub struct RelayRegistry {
    sessions: DashMap<String, SessionSlot>,
    next_generation: AtomicU64,
    max_sessions: usize,
}

impl RelayRegistry {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            next_generation: AtomicU64::new(1),
            max_sessions,
        })
    }
}

/// Runs the relay rendezvous server: accepts connections on `listener`,
/// dispatches each by its first `SESSION <id> <role>` line, and sweeps
/// stale registrations periodically. Returns once `cancel` fires.
pub async fn run(listener: TcpListener, registry: Arc<RelayRegistry>, cancel: CancellationToken) {
    let sweeper = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { sweep_stale_sessions(registry, cancel).await })
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let registry = registry.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(err) = dispatch(stream, registry).await {
                                debug!(%peer, error = %err, "relay connection ended");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "relay accept failed"),
                }
            }
            () = cancel.cancelled() => break,
        }
    }

    sweeper.abort();
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("connection closed before a SESSION line arrived")]
    ClosedEarly,
    #[error("timed out waiting for a SESSION line")]
    TimedOut,
    #[error("malformed SESSION line: {0:?}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

async fn dispatch(stream: TcpStream, registry: Arc<RelayRegistry>) -> Result<(), DispatchError> {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut write_half = write_half;

    let mut line = String::new();
    match timeout(FIRST_LINE_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(0)) => return Err(DispatchError::ClosedEarly),
        Ok(Ok(_)) => {}
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(DispatchError::TimedOut),
    }

    let trimmed = line.trim_end();
    let mut parts = trimmed.split_whitespace();
    let (Some("SESSION"), Some(id), Some(role)) = (parts.next(), parts.next(), parts.next()) else {
        write_half.write_all(b"ERROR malformed session line\n").await.ok();
        return Err(DispatchError::Malformed(trimmed.to_string()));
    };
    let id = id.to_string();

    match role {
        "server" => handle_server_role(id, reader, write_half, registry).await,
        "client" => handle_client_role(id, reader, write_half, registry).await,
        other => {
            write_half
                .write_all(format!("ERROR unknown role {other}\n").as_bytes())
                .await
                .ok();
            Err(DispatchError::Malformed(trimmed.to_string()))
        }
    }
}

async fn handle_server_role(
    id: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    registry: Arc<RelayRegistry>,
) -> Result<(), DispatchError> {
    let cancel = CancellationToken::new();
    let notify = Arc::new(Notify::new());
    let server_writer = Arc::new(Mutex::new(Some(writer)));
    let generation;
    match registry.sessions.entry(id.clone()) {
        MapEntry::Occupied(mut occupied) => {
            debug!(session_id = %id, "superseding existing server registration");
            occupied.get().cancel.cancel();
            let superseded_writer = occupied.get().server_writer.clone();
            generation = registry.next_generation.fetch_add(1, Ordering::Relaxed);
            occupied.insert(SessionSlot {
                generation,
                cancel: cancel.clone(),
                registered_at: Instant::now(),
                client: None,
                server_writer: server_writer.clone(),
                notify: notify.clone(),
            });
            // Close the superseded leg's writer before this task announces
            // REGISTERED to the new registrant, so the old handler never
            // races the new one over the same session id.
            if let Some(mut old_writer) = superseded_writer.lock().await.take() {
                let _ = old_writer.shutdown().await;
            }
        }
        MapEntry::Vacant(vacant) => {
            if registry.sessions.len() >= registry.max_sessions {
                drop(vacant);
                if let Some(writer) = server_writer.lock().await.as_mut() {
                    writer.write_all(b"ERROR max sessions reached\n").await.ok();
                }
                return Ok(());
            }
            generation = registry.next_generation.fetch_add(1, Ordering::Relaxed);
            vacant.insert(SessionSlot {
                generation,
                cancel: cancel.clone(),
                registered_at: Instant::now(),
                client: None,
                server_writer: server_writer.clone(),
                notify: notify.clone(),
            });
        }
    }
    {
        let mut guard = server_writer.lock().await;
        let writer = guard.as_mut().expect("this task's own server writer is still present");
        writer.write_all(b"REGISTERED\n").await?;
        writer.flush().await?;
    }
    info!(session_id = %id, "relay server leg registered");

    tokio::select! {
        () = cancel.cancelled() => {
            debug!(session_id = %id, "server registration superseded while waiting for a peer");
            return Ok(());
        }
        () = notify.notified() => {}
    }

    let client = match registry.sessions.get_mut(&id) {
        Some(mut slot) if slot.generation == generation => slot.client.take(),
        _ => None,
    };
    let Some((client_reader, client_writer)) = client else {
        return Ok(());
    };

    let Some(mut writer) = server_writer.lock().await.take() else {
        return Ok(());
    };
    writer.write_all(b"PAIRED\n").await?;
    writer.flush().await?;
    info!(session_id = %id, "relay session paired");

    tokio::select! {
        () = cancel.cancelled() => {}
        () = pipe_both_ways(reader, writer, client_reader, client_writer) => {}
    }

    registry.sessions.remove_if(&id, |_, slot| slot.generation == generation);
    Ok(())
}

async fn handle_client_role(
    id: String,
    reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    registry: Arc<RelayRegistry>,
) -> Result<(), DispatchError> {
    if !registry.sessions.contains_key(&id) {
        writer.write_all(b"ERROR unknown session\n").await.ok();
        return Ok(());
    }

    writer.write_all(b"CONNECTED\n").await?;
    writer.flush().await?;

    let notify = {
        let Some(mut slot) = registry.sessions.get_mut(&id) else {
            return Ok(());
        };
        let read_half = reader.into_inner();
        slot.client = Some((read_half, writer));
        slot.notify.clone()
    };
    notify.notify_one();
    info!(session_id = %id, "relay client leg connected");
    Ok(())
}

async fn pipe_both_ways(
    server_reader: BufReader<OwnedReadHalf>,
    mut server_writer: OwnedWriteHalf,
    client_reader: OwnedReadHalf,
    mut client_writer: OwnedWriteHalf,
) {
    let mut server_reader = server_reader.into_inner();
    let to_client = async {
        let mut buf = [0u8; COPY_BUFFER];
        loop {
            match tokio::io::AsyncReadExt::read(&mut server_reader, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_writer.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    };
    let mut client_reader = client_reader;
    let to_server = async {
        let mut buf = [0u8; COPY_BUFFER];
        loop {
            match tokio::io::AsyncReadExt::read(&mut client_reader, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if server_writer.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    };
    tokio::join!(to_client, to_server);
}

async fn sweep_stale_sessions(registry: Arc<RelayRegistry>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(STALE_SWEEP_INTERVAL) => {}
            () = cancel.cancelled() => break,
        }
        let stale: Vec<String> = registry
            .sessions
            .iter()
            .filter(|entry| entry.registered_at.elapsed() > STALE_AFTER)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            if let Some((_, slot)) = registry.sessions.remove(id) {
                slot.cancel.cancel();
            }
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "swept stale relay sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn write_line(stream: &mut TcpStream, line: &str) {
        stream.write_all(line.as_bytes()).await.unwrap();
    }

    async fn read_line(stream: &mut TcpStream) -> String {
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).trim_end().to_string()
    }

    #[tokio::test]
    async fn server_then_client_pairs_and_echoes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = RelayRegistry::new(10);
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(run(listener, registry, cancel.clone()));

        let mut server_leg = TcpStream::connect(addr).await.unwrap();
        write_line(&mut server_leg, "SESSION abc server\n").await;
        assert_eq!(read_line(&mut server_leg).await, "REGISTERED");

        let mut client_leg = TcpStream::connect(addr).await.unwrap();
        write_line(&mut client_leg, "SESSION abc client\n").await;
        assert_eq!(read_line(&mut client_leg).await, "CONNECTED");

        assert_eq!(read_line(&mut server_leg).await, "PAIRED");

        write_line(&mut client_leg, "hello\n").await;
        let mut buf = [0u8; 32];
        let n = server_leg.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello\n");

        cancel.cancel();
        server_task.abort();
    }

    #[tokio::test]
    async fn client_with_unknown_session_gets_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = RelayRegistry::new(10);
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(run(listener, registry, cancel.clone()));

        let mut client_leg = TcpStream::connect(addr).await.unwrap();
        write_line(&mut client_leg, "SESSION nope client\n").await;
        assert_eq!(read_line(&mut client_leg).await, "ERROR unknown session");

        cancel.cancel();
        server_task.abort();
    }

    #[tokio::test]
    async fn max_sessions_limit_rejects_new_servers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = RelayRegistry::new(1);
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(run(listener, registry, cancel.clone()));

        let mut first = TcpStream::connect(addr).await.unwrap();
        write_line(&mut first, "SESSION one server\n").await;
        assert_eq!(read_line(&mut first).await, "REGISTERED");

        let mut second = TcpStream::connect(addr).await.unwrap();
        write_line(&mut second, "SESSION two server\n").await;
        assert_eq!(read_line(&mut second).await, "ERROR max sessions reached");

        cancel.cancel();
        server_task.abort();
    }

    #[test]
    fn stale_sweep_interval_and_threshold_are_sane() {
        assert!(STALE_SWEEP_INTERVAL < STALE_AFTER);
    }
}
