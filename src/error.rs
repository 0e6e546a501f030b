//! Error types for the dnsgate engine
//!
//! This module defines the error hierarchy for the TCP/DoT front-end:
//! stream I/O, framing, PROXY-protocol decoding, backend communication,
//! admission control, and configuration.
//!
//! # Error Categories
//!
//! - **Framing errors**: short or oversized DNS frames, bad length prefixes
//! - **Proxy protocol errors**: malformed PROXY v1/v2 preambles
//! - **Network errors**: socket I/O failures on either side
//! - **Backend errors**: downstream connect/write/read failures
//! - **Timeout errors**: client or backend deadline expiry
//! - **Admission errors**: connection rejected before reaching a worker
//! - **Config errors**: invalid configuration parameters
//!
//! # Example
//!
//! ```
//! use dnsgate::error::GateError;
//!
//! let err = GateError::timeout("reading query size", std::time::Duration::from_secs(2));
//! assert!(err.is_timeout());
//! assert!(err.is_recoverable());
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error type for the dnsgate engine
///
/// Errors are classified as either recoverable (transient, the peer may
/// retry or reconnect) or non-recoverable (protocol violations and
/// configuration problems).
#[derive(Debug, Error)]
pub enum GateError {
    /// A DNS frame violated the wire format
    ///
    /// Raised for length prefixes below the DNS header size and for
    /// responses too large to frame. The connection carrying the frame
    /// is closed.
    #[error("DNS framing error: {reason}")]
    Framing {
        /// Description of the framing violation
        reason: String,
    },

    /// A PROXY-protocol preamble could not be decoded
    #[error("invalid PROXY protocol header: {reason}")]
    ProxyProtocol {
        /// Description of what made the preamble invalid
        reason: String,
    },

    /// Socket I/O failed
    #[error("network error: {reason}")]
    Network {
        /// Description of the failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// A deadline expired
    #[error("timed out after {timeout:?} while {context}")]
    Timeout {
        /// What the engine was doing when the deadline fired
        context: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// Communication with a downstream backend failed
    #[error("backend error ({backend}): {reason}")]
    Backend {
        /// The backend name
        backend: String,
        /// Description of the failure
        reason: String,
    },

    /// A connection was refused before reaching a worker
    ///
    /// Admission failures are accounted by the acceptor; the socket is
    /// closed without a response.
    #[error("connection rejected: {reason}")]
    Rejected {
        /// Which admission rule rejected the connection
        reason: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error
        reason: String,
        /// The configuration field at fault, if applicable
        field: Option<String>,
    },

    /// The TLS layer failed (handshake or certificate loading)
    #[error("TLS error: {reason}")]
    Tls {
        /// Description of the TLS failure
        reason: String,
    },
}

impl GateError {
    /// Create a framing error
    pub fn framing(reason: impl Into<String>) -> Self {
        Self::Framing {
            reason: reason.into(),
        }
    }

    /// Create a PROXY-protocol error
    pub fn proxy_protocol(reason: impl Into<String>) -> Self {
        Self::ProxyProtocol {
            reason: reason.into(),
        }
    }

    /// Create a network error without an underlying I/O error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error from an I/O error
    ///
    /// # Example
    ///
    /// ```
    /// use dnsgate::error::GateError;
    /// use std::io;
    ///
    /// let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
    /// let err = GateError::network_io("writing response", io_err);
    /// assert!(err.to_string().contains("writing response"));
    /// ```
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create a backend error
    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create an admission rejection error
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the field at fault
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a TLS error
    pub fn tls(reason: impl Into<String>) -> Self {
        Self::Tls {
            reason: reason.into(),
        }
    }

    /// Check whether this error is recoverable
    ///
    /// Recoverable errors are transient: the client may reconnect, or the
    /// backend component may retry on a fresh connection. Non-recoverable
    /// errors are protocol violations or configuration problems.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network { source, .. } => source.as_ref().map_or(true, |e| {
                matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                )
            }),
            Self::Timeout { .. } | Self::Backend { .. } | Self::Rejected { .. } => true,
            Self::Framing { .. }
            | Self::ProxyProtocol { .. }
            | Self::Config { .. }
            | Self::Tls { .. } => false,
        }
    }

    /// Check whether this error is a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check whether this error is a backend failure
    #[must_use]
    pub fn is_backend_error(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }

    /// Check whether this error is an admission rejection
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

impl From<io::Error> for GateError {
    fn from(err: io::Error) -> Self {
        Self::Network {
            reason: err.to_string(),
            source: Some(err),
        }
    }
}

/// Type alias for Result with [`GateError`]
pub type GateResult<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Error Creation Tests
    // ========================================================================

    #[test]
    fn test_framing_error() {
        let err = GateError::framing("query size 7 below header size");
        assert!(matches!(err, GateError::Framing { .. }));
        assert!(err.to_string().contains("below header size"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_proxy_protocol_error() {
        let err = GateError::proxy_protocol("bad signature");
        assert!(matches!(err, GateError::ProxyProtocol { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_network_error() {
        let err = GateError::network("connection closed by peer");
        assert!(matches!(err, GateError::Network { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_network_io_error() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err = GateError::network_io("sending response", io_err);
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("sending response"));
    }

    #[test]
    fn test_network_io_permission_denied_not_recoverable() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = GateError::network_io("binding", io_err);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_timeout_error() {
        let err = GateError::timeout("reading query", Duration::from_secs(2));
        assert!(err.is_timeout());
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("reading query"));
    }

    #[test]
    fn test_backend_error() {
        let err = GateError::backend("ns1", "connection refused");
        assert!(err.is_backend_error());
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("ns1"));
    }

    #[test]
    fn test_rejected_error() {
        let err = GateError::rejected("too many queued connections");
        assert!(err.is_rejected());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_config_error_with_field() {
        let err = GateError::config_field("must be non-empty", "backends");
        assert!(matches!(err, GateError::Config { field: Some(_), .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_tls_error() {
        let err = GateError::tls("no certificate found");
        assert!(!err.is_recoverable());
    }

    // ========================================================================
    // Conversion Tests
    // ========================================================================

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: GateError = io_err.into();
        assert!(matches!(err, GateError::Network { .. }));
        assert!(err.is_recoverable());
    }
}
