/// Why a bridge ended, used only to pick a log level and message; callers
/// never branch on this beyond that.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("client is not trusted")]
    Untrusted,
    #[error("authentication failed: {0}")]
    Auth(#[from] bridge_auth::AuthError),
    #[error("failed to acquire engine: {0}")]
    EngineAcquire(#[from] bridge_sessions::SessionError),
    #[error("engine did not report uciok within the startup timeout")]
    UciokTimeout,
    #[error("engine exited before completing startup")]
    EngineExitedEarly,
    #[error("connection reset")]
    ConnectionReset,
    #[error("incomplete read from peer")]
    IncompleteRead,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether this outcome belongs to the "error"-level half of the
    /// failure taxonomy (engine-spawn failure, pre-uciok engine exit) rather
    /// than the "warning"-level half (reset, incomplete read, timeout,
    /// generic I/O).
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::EngineAcquire(_) | BridgeError::UciokTimeout | BridgeError::EngineExitedEarly
        )
    }
}
