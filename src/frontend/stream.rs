//! Stream handler: one abstraction over plain TCP and DoT
//!
//! The connection state machine reads and writes through [`DnsStream`]
//! without caring about the transport. Both operations are incremental:
//! the caller owns the buffer and position, so arbitrary short reads and
//! writes survive across event-loop iterations. TLS streams additionally
//! expose the negotiated version and the server name indication.

use std::io;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ProtocolVersion, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::{GateError, GateResult};

/// A client-facing stream, plaintext or TLS
#[derive(Debug)]
pub enum DnsStream {
    /// Plain TCP
    Plain(TcpStream),
    /// DoT, after a completed handshake
    Tls(Box<TlsStream<TcpStream>>),
}

impl DnsStream {
    /// Read into `buf`, returning the number of bytes read
    ///
    /// A return of 0 on a non-empty `buf` means the peer closed the
    /// stream. Cancel-safe: either bytes were read and the count is
    /// returned, or nothing was consumed.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
        }
    }

    /// Write from `buf`, returning the number of bytes written
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf).await,
            Self::Tls(stream) => stream.write(buf).await,
        }
    }

    /// Shut down the write side, flushing TLS close-notify when relevant
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        }
    }

    /// Whether this stream carries TLS
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// The negotiated TLS version, when applicable
    #[must_use]
    pub fn tls_version(&self) -> Option<ProtocolVersion> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(stream) => stream.get_ref().1.protocol_version(),
        }
    }

    /// The server name the client indicated during the handshake
    #[must_use]
    pub fn server_name_indication(&self) -> Option<String> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(stream) => stream.get_ref().1.server_name().map(str::to_owned),
        }
    }
}

/// Load a certificate chain and key and build a DoT acceptor
///
/// ALPN advertises `dot` (RFC 7858 deployments expect it).
///
/// # Errors
///
/// Returns `GateError::Tls` when the PEM files cannot be read or do not
/// contain usable material.
pub fn build_tls_acceptor(certificate_path: &str, key_path: &str) -> GateResult<TlsAcceptor> {
    let cert_file = std::fs::File::open(certificate_path)
        .map_err(|e| GateError::tls(format!("cannot open certificate {certificate_path}: {e}")))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut io::BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| GateError::tls(format!("cannot parse certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(GateError::tls(format!(
            "no certificate found in {certificate_path}"
        )));
    }

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| GateError::tls(format!("cannot open key {key_path}: {e}")))?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut io::BufReader::new(key_file))
            .map_err(|e| GateError::tls(format!("cannot parse key: {e}")))?
            .ok_or_else(|| GateError::tls(format!("no private key found in {key_path}")))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GateError::tls(format!("invalid certificate/key pair: {e}")))?;
    config.alpn_protocols = vec![b"dot".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    // ========================================================================
    // Plain Stream Tests
    // ========================================================================

    #[tokio::test]
    async fn test_plain_read_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut stream = DnsStream::Plain(TcpStream::connect(addr).await.unwrap());
        assert!(!stream.is_tls());
        assert!(stream.tls_version().is_none());
        assert!(stream.server_name_indication().is_none());

        let mut written = 0;
        while written < 5 {
            written += stream.write(&b"hello"[written..]).await.unwrap();
        }

        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < 5 {
            let n = stream.read(&mut buf[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_plain_read_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut stream = DnsStream::Plain(TcpStream::connect(addr).await.unwrap());
        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    // ========================================================================
    // TLS Acceptor Construction Tests
    // ========================================================================

    #[test]
    fn test_build_tls_acceptor_missing_files() {
        let result = build_tls_acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem");
        match result {
            Err(e) => assert!(!e.is_recoverable()),
            Ok(_) => panic!("expected error for missing TLS files"),
        }
    }

    #[test]
    fn test_build_tls_acceptor_empty_pem() {
        let dir = std::env::temp_dir();
        let cert_path = dir.join("dnsgate-test-empty-cert.pem");
        let key_path = dir.join("dnsgate-test-empty-key.pem");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        let result = build_tls_acceptor(
            cert_path.to_str().unwrap(),
            key_path.to_str().unwrap(),
        );
        assert!(result.is_err());

        let _ = std::fs::remove_file(cert_path);
        let _ = std::fs::remove_file(key_path);
    }
}
