use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay rendezvous at {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("relay connection closed before registration completed")]
    RegistrationClosed,

    #[error("timed out waiting for {0} from relay server")]
    Timeout(&'static str),

    #[error("relay server rejected registration: {0}")]
    Rejected(String),

    #[error("relay connection closed while waiting for a peer")]
    PeeringClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}
