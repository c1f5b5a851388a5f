use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
const PEERING_TIMEOUT: Duration = Duration::from_secs(300);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// Dials a relay rendezvous server and registers a `server`-role leg for one
/// engine, handing the paired connection to the caller once a client leg
/// shows up on the other side. Reconnects forever until `cancel` fires.
///
/// Losing the peering wait to the 300 second keepalive ceiling is treated as
/// routine (the relay server prunes idle registrations) and retried
/// immediately; any other failure backs off for ten seconds first, mirroring
/// how a flaky network path to the rendezvous host should not be hammered.
pub struct RelayDialer {
    host: String,
    port: u16,
    session_id: String,
}

impl RelayDialer {
    pub fn new(host: impl Into<String>, port: u16, session_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            session_id: session_id.into(),
        }
    }

    /// Runs the reconnect loop, invoking `on_paired` each time a client leg
    /// connects. `on_paired` owns the paired stream for the lifetime of that
    /// session; when it returns, this dialer re-registers and waits again.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, mut on_paired: F)
    where
        F: FnMut(BufReader<OwnedReadHalf>, OwnedWriteHalf) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        while !cancel.is_cancelled() {
            match self.attempt(&cancel).await {
                Ok(Some((reader, writer))) => {
                    info!(session_id = %self.session_id, "relay peer connected");
                    on_paired(reader, writer).await;
                }
                Ok(None) => {
                    debug!(session_id = %self.session_id, "relay peering wait timed out, retrying");
                }
                Err(RelayError::Rejected(reason)) => {
                    warn!(session_id = %self.session_id, reason, "relay server rejected registration");
                    if wait_or_cancel(RECONNECT_BACKOFF, &cancel).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(session_id = %self.session_id, error = %err, "relay dial failed");
                    if wait_or_cancel(RECONNECT_BACKOFF, &cancel).await {
                        break;
                    }
                }
            }
        }
    }

    /// Performs one register-and-wait cycle. `Ok(None)` means the peering
    /// wait hit the keepalive ceiling without a client showing up.
    async fn attempt(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>, RelayError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|source| RelayError::Connect {
                addr: format!("{}:{}", self.host, self.port),
                source,
            })?;
        stream.set_nodelay(true).ok();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("SESSION {} server\n", self.session_id).as_bytes())
            .await?;
        write_half.flush().await?;

        let mut line = String::new();
        match timeout(REGISTRATION_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => return Err(RelayError::RegistrationClosed),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(RelayError::Timeout("REGISTERED")),
        }
        let trimmed = line.trim_end();
        if trimmed.starts_with("ERROR") {
            return Err(RelayError::Rejected(trimmed.to_string()));
        }
        if trimmed != "REGISTERED" {
            return Err(RelayError::Rejected(trimmed.to_string()));
        }

        line.clear();
        let peered = tokio::select! {
            result = timeout(PEERING_TIMEOUT, reader.read_line(&mut line)) => Some(result),
            () = cancel.cancelled() => None,
        };
        let Some(result) = peered else {
            return Err(RelayError::PeeringClosed);
        };
        match result {
            Ok(Ok(0)) => Err(RelayError::PeeringClosed),
            Ok(Ok(_)) => {
                let trimmed = line.trim_end();
                if trimmed == "PAIRED" {
                    Ok(Some((reader, write_half)))
                } else {
                    Err(RelayError::Rejected(trimmed.to_string()))
                }
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Ok(None),
        }
    }
}

/// Sleeps for `duration`, or returns `true` early if cancellation fires
/// first (meaning the caller should stop retrying).
async fn wait_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => false,
        () = cancel.cancelled() => true,
    }
}
