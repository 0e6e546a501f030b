//! Configuration types for the dnsgate engine
//!
//! This module defines the configuration tree for the TCP/DoT front-end,
//! including listeners, backends, engine limits, and logging.
//!
//! # Configuration Structure
//!
//! ```text
//! GateConfig
//! ├── listeners: Vec<ListenerConfig>
//! │   └── tls: Option<TlsConfig>
//! ├── backends: Vec<BackendConfig>
//! ├── limits: LimitsConfig
//! ├── workers: Option<usize>
//! └── log: LogConfig
//! ```
//!
//! # Example
//!
//! ```
//! use dnsgate::config::{BackendConfig, GateConfig, ListenerConfig};
//!
//! let config = GateConfig::new()
//!     .with_listener(ListenerConfig::new("127.0.0.1:8053".parse().unwrap()))
//!     .with_backend(BackendConfig::new("ns1", "192.0.2.53:53".parse().unwrap()));
//!
//! assert!(config.validate().is_ok());
//! ```

use std::net::SocketAddr;
use std::path::Path;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::pipeline::SelectionStrategy;

// ============================================================================
// Top-level configuration
// ============================================================================

/// Top-level configuration for the dnsgate engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GateConfig {
    /// Listening endpoints (plain TCP or DoT)
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Downstream backends queries are forwarded to
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// How the stock pipeline spreads queries over the backends
    #[serde(default)]
    pub backend_selection: SelectionStrategy,

    /// Engine limits and timeouts
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Number of worker tasks
    ///
    /// Defaults to the number of logical CPUs when unset.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl GateConfig {
    /// Create an empty configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    #[must_use]
    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Add a backend
    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    /// Set the engine limits
    #[must_use]
    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    ///
    /// - At least one listener and one backend must be configured
    /// - Backend names must be unique and non-empty
    /// - TLS listeners must name both a certificate and a key
    /// - The cached-connection cap and worker count must be positive
    ///
    /// # Errors
    ///
    /// Returns `GateError::Config` naming the offending field.
    pub fn validate(&self) -> GateResult<()> {
        if self.listeners.is_empty() {
            return Err(GateError::config_field(
                "at least one listener must be configured",
                "listeners",
            ));
        }
        if self.backends.is_empty() {
            return Err(GateError::config_field(
                "at least one backend must be configured",
                "backends",
            ));
        }

        let mut names = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(GateError::config_field(
                    "backend name must be non-empty",
                    "backends.name",
                ));
            }
            if !names.insert(&backend.name) {
                return Err(GateError::config_field(
                    format!("duplicate backend name: {}", backend.name),
                    "backends.name",
                ));
            }
        }

        for listener in &self.listeners {
            listener.validate()?;
        }
        self.limits.validate()?;

        if let Some(workers) = self.workers {
            if workers == 0 {
                return Err(GateError::config_field(
                    "worker count must be positive",
                    "workers",
                ));
            }
        }

        Ok(())
    }
}

/// Load a configuration from a JSON file
///
/// # Errors
///
/// Returns `GateError::Config` if the file cannot be read or parsed, or if
/// the resulting configuration fails validation.
pub fn load_config(path: impl AsRef<Path>) -> GateResult<GateConfig> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .map_err(|e| GateError::config(format!("cannot read {}: {e}", path.display())))?;
    let config: GateConfig = serde_json::from_str(&data)
        .map_err(|e| GateError::config(format!("cannot parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Load a configuration from a JSON file, applying `DNSGATE_*` environment
/// overrides
///
/// Supported overrides: `DNSGATE_LOG_LEVEL`, `DNSGATE_WORKERS`,
/// `DNSGATE_MAX_QUEUED_CONNECTIONS`.
///
/// # Errors
///
/// Same as [`load_config`], plus `GateError::Config` for unparsable
/// override values.
pub fn load_config_with_env(path: impl AsRef<Path>) -> GateResult<GateConfig> {
    let mut config = load_config(path)?;

    if let Ok(level) = std::env::var("DNSGATE_LOG_LEVEL") {
        config.log.level = level;
    }
    if let Ok(workers) = std::env::var("DNSGATE_WORKERS") {
        config.workers = Some(workers.parse().map_err(|_| {
            GateError::config_field("DNSGATE_WORKERS must be a positive integer", "workers")
        })?);
    }
    if let Ok(queued) = std::env::var("DNSGATE_MAX_QUEUED_CONNECTIONS") {
        config.limits.max_queued_connections = queued.parse().map_err(|_| {
            GateError::config_field(
                "DNSGATE_MAX_QUEUED_CONNECTIONS must be an integer",
                "limits.max_queued_connections",
            )
        })?;
    }

    config.validate()?;
    Ok(config)
}

// ============================================================================
// Listener configuration
// ============================================================================

/// Configuration for one listening endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Address to listen on
    pub address: SocketAddr,

    /// TLS front-end configuration; present for DoT listeners
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Networks allowed to connect; empty means everyone
    #[serde(default)]
    pub acl: Vec<IpNet>,

    /// Networks whose connections must start with a PROXY-protocol preamble
    #[serde(default)]
    pub proxy_protocol_from: Vec<IpNet>,

    /// Maximum number of in-flight queries per client connection
    ///
    /// Default: 1 (no pipelining; responses follow query order)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_per_conn: usize,
}

fn default_max_in_flight() -> usize {
    1
}

impl ListenerConfig {
    /// Create a plain-TCP listener configuration
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            tls: None,
            acl: Vec::new(),
            proxy_protocol_from: Vec::new(),
            max_in_flight_per_conn: default_max_in_flight(),
        }
    }

    /// Enable the TLS front-end (DoT)
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the maximum number of in-flight queries per connection
    #[must_use]
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight_per_conn = max;
        self
    }

    /// Mark networks as PROXY-protocol senders
    #[must_use]
    pub fn with_proxy_protocol_from(mut self, networks: Vec<IpNet>) -> Self {
        self.proxy_protocol_from = networks;
        self
    }

    fn validate(&self) -> GateResult<()> {
        if self.max_in_flight_per_conn == 0 {
            return Err(GateError::config_field(
                "max_in_flight_per_conn must be positive",
                "listeners.max_in_flight_per_conn",
            ));
        }
        if let Some(tls) = &self.tls {
            if tls.certificate.is_empty() || tls.key.is_empty() {
                return Err(GateError::config_field(
                    "TLS listeners need both a certificate and a key",
                    "listeners.tls",
                ));
            }
        }
        Ok(())
    }
}

/// TLS front-end configuration for a DoT listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain
    pub certificate: String,

    /// Path to the PEM private key
    pub key: String,
}

// ============================================================================
// Backend configuration
// ============================================================================

/// Configuration for one downstream backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name, used for logging and cache identity
    pub name: String,

    /// Backend address
    pub address: SocketAddr,

    /// Send a PROXY-protocol v2 payload on fresh backend connections
    #[serde(default)]
    pub use_proxy_protocol: bool,

    /// Reconnect attempts before giving up on in-flight queries
    ///
    /// Default: 5
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Connect timeout in seconds
    #[serde(default = "default_backend_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Read timeout in seconds while responses are pending
    #[serde(default = "default_backend_io_timeout")]
    pub read_timeout_secs: u64,

    /// Write timeout in seconds
    #[serde(default = "default_backend_io_timeout")]
    pub write_timeout_secs: u64,
}

fn default_retries() -> u32 {
    5
}

fn default_backend_connect_timeout() -> u64 {
    5
}

fn default_backend_io_timeout() -> u64 {
    30
}

impl BackendConfig {
    /// Create a backend configuration with default timeouts
    #[must_use]
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
            use_proxy_protocol: false,
            retries: default_retries(),
            connect_timeout_secs: default_backend_connect_timeout(),
            read_timeout_secs: default_backend_io_timeout(),
            write_timeout_secs: default_backend_io_timeout(),
        }
    }

    /// Enable PROXY-protocol payloads towards this backend
    #[must_use]
    pub fn with_proxy_protocol(mut self) -> Self {
        self.use_proxy_protocol = true;
        self
    }
}

// ============================================================================
// Engine limits
// ============================================================================

/// Engine limits and timeouts
///
/// A value of 0 disables the corresponding cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum connections queued towards workers before the acceptor
    /// starts refusing
    ///
    /// Default: 1000
    #[serde(default = "default_max_queued_connections")]
    pub max_queued_connections: usize,

    /// Maximum queries served on one client connection (0 = unlimited)
    #[serde(default)]
    pub max_queries_per_conn: u64,

    /// Maximum lifetime of a client connection in seconds (0 = unlimited)
    #[serde(default)]
    pub max_connection_duration_secs: u64,

    /// Maximum simultaneous connections per client address (0 = unlimited)
    #[serde(default)]
    pub max_connections_per_client: usize,

    /// Interval between idle-backend-connection cleanup scans, in seconds
    ///
    /// Default: 60
    #[serde(default = "default_cleanup_interval")]
    pub backend_cleanup_interval_secs: u64,

    /// Cached idle connections kept per backend, per worker
    ///
    /// Default: 20
    #[serde(default = "default_max_cached_connections")]
    pub max_cached_connections_per_backend: usize,

    /// Client read timeout in seconds
    ///
    /// Default: 2
    #[serde(default = "default_client_io_timeout")]
    pub client_read_timeout_secs: u64,

    /// Client write timeout in seconds
    ///
    /// Default: 2
    #[serde(default = "default_client_io_timeout")]
    pub client_write_timeout_secs: u64,

    /// Floor for the receive-buffer resize after the size prefix is read
    ///
    /// The buffer grows to `max(query_size + 512, max_buffer_floor)` so
    /// later stages can rewrite the query in place.
    #[serde(default = "default_max_buffer_floor")]
    pub max_buffer_floor: usize,
}

fn default_max_queued_connections() -> usize {
    1000
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_max_cached_connections() -> usize {
    20
}

fn default_client_io_timeout() -> u64 {
    2
}

fn default_max_buffer_floor() -> usize {
    4096
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_queued_connections: default_max_queued_connections(),
            max_queries_per_conn: 0,
            max_connection_duration_secs: 0,
            max_connections_per_client: 0,
            backend_cleanup_interval_secs: default_cleanup_interval(),
            max_cached_connections_per_backend: default_max_cached_connections(),
            client_read_timeout_secs: default_client_io_timeout(),
            client_write_timeout_secs: default_client_io_timeout(),
            max_buffer_floor: default_max_buffer_floor(),
        }
    }
}

impl LimitsConfig {
    fn validate(&self) -> GateResult<()> {
        if self.max_cached_connections_per_backend == 0 {
            return Err(GateError::config_field(
                "max_cached_connections_per_backend must be positive",
                "limits.max_cached_connections_per_backend",
            ));
        }
        if self.client_read_timeout_secs == 0 || self.client_write_timeout_secs == 0 {
            return Err(GateError::config_field(
                "client timeouts must be positive",
                "limits.client_read_timeout_secs",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
