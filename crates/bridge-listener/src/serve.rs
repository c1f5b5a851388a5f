use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const BIND_RETRIES: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Binds `addr`, retrying up to five times with a five second pause between
/// attempts, matching how transient "address in use" races at startup are
/// tolerated elsewhere in this bridge.
pub async fn bind_with_retry(addr: SocketAddr, label: &str) -> Option<TcpListener> {
    let mut attempts_left = BIND_RETRIES;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Some(listener),
            Err(err) => {
                attempts_left -= 1;
                error!(%addr, label, error = %err, "bind failed");
                if attempts_left == 0 {
                    error!(label, "max bind retries reached, giving up");
                    return None;
                }
                info!(label, "retrying bind in 5 seconds");
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
        }
    }
}

/// Accepts connections on `listener` until `cancel` fires, spawning
/// `handler` for each one.
pub async fn serve<F, Fut>(listener: TcpListener, label: String, cancel: CancellationToken, handler: F)
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().ok();
    info!(label = %label, addr = ?local_addr, "listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let fut = handler(stream, peer);
                        tokio::spawn(fut);
                    }
                    Err(err) => error!(label = %label, error = %err, "accept failed"),
                }
            }
            () = cancel.cancelled() => {
                info!(label = %label, "listener shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn bind_with_retry_succeeds_on_free_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_with_retry(addr, "test").await;
        assert!(listener.is_some());
    }

    #[tokio::test]
    async fn serve_invokes_handler_per_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let serve_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            serve(listener, "test".to_string(), serve_cancel, move |_stream, _peer| {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        });

        let _ = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
