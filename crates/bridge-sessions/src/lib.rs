#![deny(unsafe_code)]

//! # Overview
//!
//! Owns the lifecycle of engine subprocesses: spawning them, warm-holding a
//! released process so a reconnecting client can reattach to it (preserving
//! hash tables and learned positions), and terminating them cleanly on
//! release or shutdown.
//!
//! # Invariants
//!
//! - At most one in-flight bridge per engine name: [`SessionManager::acquire`]
//!   holds the registry-wide mutex across the whole check-spawn-claim
//!   sequence, so a second concurrent acquire for the same name always
//!   observes either the first caller's warm entry or its active claim —
//!   never a moment where both see an empty slot.
//! - Expiry is cancellable: reattaching to a warm session aborts its expiry
//!   task before handing the session back, so a just-in-time reconnect never
//!   loses to an in-flight timeout.
//! - All state transitions happen under one registry-wide lock; the lock is
//!   never held across a subprocess wait or graceful-exit timeout, only
//!   around map mutation.
//! - `shutdown_all` actually terminates in-flight sessions: acquiring a
//!   session hands the caller a [`CancellationToken`] tied to its registry
//!   slot, so shutdown can ask a still-running bridge to unwind and wait for
//!   it to release before declaring the registry clear.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a terminating session is given to exit after `quit\n` before
/// it is killed outright.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long `shutdown_all` waits for a still-running bridge to observe its
/// cancellation signal and release its session before giving up on it.
const SHUTDOWN_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// An acquired engine process, owned by whichever bridge currently holds it.
///
/// Standard error is merged into the same line stream as standard output:
/// two background tasks read each pipe independently and forward decoded
/// lines into one channel, since tokio has no direct equivalent of
/// `subprocess.STDOUT` redirection for piped children.
pub struct Session {
    pub name: String,
    pub child: Child,
    pub stdin: ChildStdin,
    output_rx: mpsc::UnboundedReceiver<String>,
}

impl Session {
    /// Reads the next merged stdout/stderr line. Returns `None` once both
    /// pipes have reached end of stream.
    pub async fn read_line(&mut self) -> Option<String> {
        self.output_rx.recv().await
    }
}

/// Registry-side handle for an in-flight (unreleased) session: lets
/// `shutdown_all` ask the owning bridge to stop and learn when it has.
struct ActiveHandle {
    shutdown: CancellationToken,
    released: Arc<Notify>,
}

enum Entry {
    Warm(Session, JoinHandle<()>),
    Active(ActiveHandle),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to spawn engine process at {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("engine process did not expose a piped stdin/stdout handle")]
    MissingPipes,
    #[error("engine '{0}' is already active in another bridge")]
    AlreadyActive(String),
}

struct Inner {
    sessions: Mutex<HashMap<String, Entry>>,
}

/// Shared handle to the engine session registry. Cheap to clone; clones
/// share the same underlying map.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquires the named engine: reattaches to a live warm session if one
    /// exists, otherwise spawns a fresh process rooted at `path`'s parent
    /// directory with stdin/stdout piped and stderr merged into stdout.
    ///
    /// Returns the session, whether it was a reattach, and a cancellation
    /// token the caller should select on and honor — cancelling it (done by
    /// [`SessionManager::shutdown_all`]) is this registry's way of asking an
    /// in-flight bridge to wind down and release.
    pub async fn acquire(&self, name: &str, path: &Path) -> Result<(Session, bool, CancellationToken), SessionError> {
        let mut sessions = self.inner.sessions.lock().await;

        match sessions.remove(name) {
            Some(Entry::Warm(session, expiry)) => {
                expiry.abort();
                let mut session = session;
                match session.child.try_wait() {
                    Ok(None) => {
                        let shutdown = CancellationToken::new();
                        sessions.insert(
                            name.to_string(),
                            Entry::Active(ActiveHandle {
                                shutdown: shutdown.clone(),
                                released: Arc::new(Notify::new()),
                            }),
                        );
                        tracing::info!(engine = name, "reattaching to warm engine session");
                        return Ok((session, true, shutdown));
                    }
                    _ => {
                        tracing::debug!(engine = name, "warm session was no longer alive, respawning");
                    }
                }
            }
            Some(Entry::Active(_)) => {
                return Err(SessionError::AlreadyActive(name.to_string()));
            }
            None => {}
        }

        let session = spawn(name, path)?;
        let shutdown = CancellationToken::new();
        sessions.insert(
            name.to_string(),
            Entry::Active(ActiveHandle {
                shutdown: shutdown.clone(),
                released: Arc::new(Notify::new()),
            }),
        );
        Ok((session, false, shutdown))
    }

    /// Releases a previously acquired session. With `keepalive` zero, the
    /// process is terminated synchronously before this call returns;
    /// otherwise it is left running, warm, with an expiry task scheduled.
    pub async fn release(&self, session: Session, keepalive: Duration) {
        let name = session.name.clone();

        if keepalive.is_zero() {
            let released = {
                let mut sessions = self.inner.sessions.lock().await;
                take_released_notify(sessions.remove(&name))
            };
            terminate(session).await;
            released.notify_one();
            return;
        }

        let manager = self.clone();
        let expiry_name = name.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(keepalive).await;
            manager.expire(&expiry_name).await;
        });

        tracing::info!(engine = %name, keepalive_secs = keepalive.as_secs(), "engine released, keeping warm");
        let released = {
            let mut sessions = self.inner.sessions.lock().await;
            let released = match sessions.get(&name) {
                Some(Entry::Active(handle)) => handle.released.clone(),
                _ => Arc::new(Notify::new()),
            };
            sessions.insert(name, Entry::Warm(session, expiry));
            released
        };
        released.notify_one();
    }

    async fn expire(&self, name: &str) {
        let entry = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.remove(name)
        };
        if let Some(Entry::Warm(session, _expiry)) = entry {
            tracing::info!(engine = name, "session keepalive expired");
            terminate(session).await;
        }
    }

    /// Terminates every session, warm or active, and clears the registry.
    /// Used only during orchestrator shutdown. An in-flight (active) session
    /// has no process handle in the registry — its owning bridge does — so
    /// this signals that bridge's cancellation token and waits (bounded) for
    /// it to release before continuing.
    pub async fn shutdown_all(&self) {
        let active_waits: Vec<Arc<Notify>> = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .values()
                .filter_map(|entry| match entry {
                    Entry::Active(handle) => {
                        handle.shutdown.cancel();
                        Some(handle.released.clone())
                    }
                    Entry::Warm(_, _) => None,
                })
                .collect()
        };
        for released in active_waits {
            if tokio::time::timeout(SHUTDOWN_RELEASE_TIMEOUT, released.notified()).await.is_err() {
                tracing::warn!("timed out waiting for an active session to release during shutdown");
            }
        }

        let names: Vec<String> = {
            let sessions = self.inner.sessions.lock().await;
            sessions.keys().cloned().collect()
        };
        for name in names {
            let entry = {
                let mut sessions = self.inner.sessions.lock().await;
                sessions.remove(&name)
            };
            match entry {
                Some(Entry::Warm(session, expiry)) => {
                    expiry.abort();
                    terminate(session).await;
                }
                Some(Entry::Active(_)) => {
                    tracing::warn!(engine = name, "shutdown found a session still active after signaling it to stop");
                }
                None => {}
            }
        }
    }

    /// Number of entries currently tracked, for tests and diagnostics.
    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }
}

fn take_released_notify(entry: Option<Entry>) -> Arc<Notify> {
    match entry {
        Some(Entry::Active(handle)) => handle.released,
        _ => Arc::new(Notify::new()),
    }
}

fn spawn(name: &str, path: &Path) -> Result<Session, SessionError> {
    let working_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut child = Command::new(path)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SessionError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

    let stdin = child.stdin.take().ok_or(SessionError::MissingPipes)?;
    let stdout = child.stdout.take().ok_or(SessionError::MissingPipes)?;
    let stderr = child.stderr.take().ok_or(SessionError::MissingPipes)?;

    let (tx, rx) = mpsc::unbounded_channel();
    spawn_line_forwarder(BufReader::new(stdout), tx.clone());
    spawn_line_forwarder(BufReader::new(stderr), tx);

    Ok(Session {
        name: name.to_string(),
        child,
        stdin,
        output_rx: rx,
    })
}

fn spawn_line_forwarder<R>(mut reader: BufReader<R>, tx: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if tx.send(trimmed.to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

async fn terminate(mut session: Session) {
    let _ = session.stdin.write_all(b"quit\n").await;
    let _ = session.stdin.flush().await;

    match tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, session.child.wait()).await {
        Ok(Ok(_status)) => {}
        _ => {
            tracing::debug!(engine = %session.name, "engine did not exit after quit, killing");
            let _ = session.child.kill().await;
            let _ = session.child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat_path() -> PathBuf {
        PathBuf::from("/bin/cat")
    }

    #[tokio::test]
    async fn spawn_then_release_with_zero_keepalive_removes_entry() {
        if !cat_path().exists() {
            return;
        }
        let manager = SessionManager::new();
        let (session, reattached, _shutdown) = manager.acquire("cat", &cat_path()).await.unwrap();
        assert!(!reattached);
        assert_eq!(manager.len().await, 1);

        manager.release(session, Duration::ZERO).await;
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn reattach_cancels_expiry_and_reuses_process() {
        if !cat_path().exists() {
            return;
        }
        let manager = SessionManager::new();
        let (session1, _, _shutdown1) = manager.acquire("cat", &cat_path()).await.unwrap();
        let pid1 = session1.child.id();
        manager.release(session1, Duration::from_secs(60)).await;

        let (session2, reattached, _shutdown2) = manager.acquire("cat", &cat_path()).await.unwrap();
        assert!(reattached);
        assert_eq!(session2.child.id(), pid1);

        manager.release(session2, Duration::ZERO).await;
    }

    #[tokio::test]
    async fn shutdown_all_clears_registry() {
        if !cat_path().exists() {
            return;
        }
        let manager = SessionManager::new();
        let (session, _, _shutdown) = manager.acquire("cat", &cat_path()).await.unwrap();
        manager.release(session, Duration::from_secs(60)).await;
        assert_eq!(manager.len().await, 1);

        manager.shutdown_all().await;
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn expiry_terminates_after_timeout() {
        if !cat_path().exists() {
            return;
        }
        let manager = SessionManager::new();
        let (session, _, _shutdown) = manager.acquire("cat", &cat_path()).await.unwrap();
        manager.release(session, Duration::from_millis(50)).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn shutdown_all_terminates_active_session_once_signaled() {
        if !cat_path().exists() {
            return;
        }
        let manager = SessionManager::new();
        let (session, _, shutdown) = manager.acquire("cat", &cat_path()).await.unwrap();
        assert_eq!(manager.len().await, 1);

        // Mirrors how `run_bridge` reacts to the registry's cancellation
        // signal: observe it, then release.
        let release_manager = manager.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            release_manager.release(session, Duration::ZERO).await;
        });

        manager.shutdown_all().await;
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_acquire_for_same_engine_is_mutually_exclusive() {
        if !cat_path().exists() {
            return;
        }
        let manager = SessionManager::new();
        let (first, second) = tokio::join!(manager.acquire("cat", &cat_path()), manager.acquire("cat", &cat_path()));
        let results = [first, second];
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        let already_active_count = results
            .iter()
            .filter(|r| matches!(r, Err(SessionError::AlreadyActive(_))))
            .count();
        assert_eq!(ok_count, 1, "exactly one concurrent acquire should win the claim");
        assert_eq!(already_active_count, 1, "the loser should see AlreadyActive, never a clobbered second spawn");
    }
}
