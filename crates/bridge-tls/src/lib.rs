#![deny(unsafe_code)]

//! Optional TLS termination in front of the plaintext UCI bridge.
//!
//! Wire encryption is consumed the same way the firewall and discovery
//! collaborators are: as an external capability loaded from configuration,
//! not a protocol this crate speaks itself. When `enable_tls` is off, a
//! connection is used exactly as accepted; when it's on, [`load_acceptor`]
//! builds a `tokio_rustls::TlsAcceptor` restricted to TLS 1.2 and above, and
//! [`Connection`] lets the rest of the bridge treat a plaintext or
//! TLS-wrapped socket identically.

use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read '{path}': {source}")]
    Read { path: String, source: io::Error },
    #[error("'{path}' contains no certificates")]
    NoCertificate { path: String },
    #[error("'{path}' contains no usable private key")]
    NoPrivateKey { path: String },
    #[error("invalid TLS server configuration: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] io::Error),
}

/// Loads a certificate chain and private key from PEM files and builds a
/// server-side acceptor that refuses anything older than TLS 1.2.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = read_certs(cert_path)?;
    let key = read_private_key(key_path)?;

    let config = ServerConfig::builder_with_protocol_versions(&[
        &tokio_rustls::rustls::version::TLS12,
        &tokio_rustls::rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// SHA-256 fingerprint of the leaf certificate, formatted as colon-separated
/// uppercase hex, for display in the pairing payload so a client can verify
/// it is talking to the expected server.
pub fn certificate_fingerprint(cert_path: &Path) -> Result<String, TlsError> {
    let certs = read_certs(cert_path)?;
    let leaf = certs.first().ok_or_else(|| TlsError::NoCertificate {
        path: cert_path.display().to_string(),
    })?;
    let digest = Sha256::digest(leaf.as_ref());
    Ok(digest.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(":"))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let bytes = std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = io::BufReader::new(bytes.as_slice());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate {
            path: path.display().to_string(),
        });
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let bytes = std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = io::BufReader::new(bytes.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey {
            path: path.display().to_string(),
        })
}

/// Performs the server-side TLS handshake on an already-accepted socket.
pub async fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<Connection, TlsError> {
    let tls = acceptor.accept(stream).await?;
    Ok(Connection::Tls(Box::new(tls)))
}

/// A connection that is either a plain TCP socket or one wrapped in TLS.
/// Both variants implement `AsyncRead`/`AsyncWrite`, so callers that only
/// need byte-stream semantics (the bridge session loop, the multiplex
/// negotiation) never need to know which one they hold.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Connection {
    pub fn plain(stream: TcpStream) -> Self {
        Self::Plain(stream)
    }
}

impl AsyncRead for Connection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Splits a [`Connection`] into an owned read half and write half, mirroring
/// `tokio::net::TcpStream::into_split` for the plain case and
/// `tokio::io::split` for the TLS case, behind one return type.
pub fn split(conn: Connection) -> (ReadHalf, WriteHalf) {
    match conn {
        Connection::Plain(stream) => {
            let (r, w) = stream.into_split();
            (ReadHalf::Plain(r), WriteHalf::Plain(w))
        }
        Connection::Tls(stream) => {
            let (r, w) = tokio::io::split(*stream);
            (ReadHalf::Tls(r), WriteHalf::Tls(w))
        }
    }
}

pub enum ReadHalf {
    Plain(tokio::net::tcp::OwnedReadHalf),
    Tls(tokio::io::ReadHalf<tokio_rustls::server::TlsStream<TcpStream>>),
}

pub enum WriteHalf {
    Plain(tokio::net::tcp::OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for ReadHalf {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(r) => Pin::new(r).poll_read(cx, buf),
            Self::Tls(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WriteHalf {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(w) => Pin::new(w).poll_write(cx, buf),
            Self::Tls(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(w) => Pin::new(w).poll_flush(cx),
            Self::Tls(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(w) => Pin::new(w).poll_shutdown(cx),
            Self::Tls(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

/// Runs a TLS handshake with a timeout, so a client that connects and never
/// speaks TLS can't hold a listener slot forever.
pub async fn accept_with_timeout(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: std::time::Duration,
) -> Result<Connection, TlsError> {
    match tokio::time::timeout(timeout, accept(acceptor, stream)).await {
        Ok(result) => result,
        Err(_) => Err(TlsError::Handshake(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))),
    }
}

/// Helper so callers that build an acceptor once can reuse it across a
/// future without repeating the `Arc` dance.
pub fn acceptor_future<'a>(
    acceptor: &'a TlsAcceptor,
    stream: TcpStream,
) -> impl Future<Output = Result<Connection, TlsError>> + 'a {
    accept(acceptor, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // A minimal self-signed cert/key pair (P-256, 2 days validity) generated
    // offline for this test only; it is not used anywhere at runtime.
    const TEST_CERT: &str = include_str!("../testdata/cert.pem");
    const TEST_KEY: &str = include_str!("../testdata/key.pem");

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_acceptor_builds_from_valid_pem_pair() {
        let dir = tempfile::tempdir().unwrap();
        let cert = write_temp(&dir, "cert.pem", TEST_CERT);
        let key = write_temp(&dir, "key.pem", TEST_KEY);
        assert!(load_acceptor(&cert, &key).is_ok());
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let key = write_temp(&dir, "key.pem", TEST_KEY);
        let missing = dir.path().join("nope.pem");
        assert!(load_acceptor(&missing, &key).is_err());
    }

    #[test]
    fn fingerprint_is_stable_for_the_same_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let cert = write_temp(&dir, "cert.pem", TEST_CERT);
        let a = certificate_fingerprint(&cert).unwrap();
        let b = certificate_fingerprint(&cert).unwrap();
        assert_eq!(a, b);
        assert!(a.contains(':'));
    }
}
