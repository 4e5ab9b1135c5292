//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::server::danger::ClientCertVerifier;
use serde::{Deserialize, Serialize};

/// Hostname used when neither the configuration nor an override names one.
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";

/// Port used when neither the configuration nor an override names one.
pub const DEFAULT_PORT: u16 = 8080;

/// Root configuration for one listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Where the listener binds.
    pub address: BindAddress,

    /// Listen backlog passed to `listen(2)`.
    pub backlog: u32,

    /// Set `SO_REUSEADDR` on the listening socket.
    pub reuse_address: bool,

    /// Set `TCP_NODELAY` on accepted sockets.
    pub tcp_no_delay: bool,

    /// Response body compression.
    pub response_compression: CompressionConfig,

    /// Request body decompression.
    pub request_decompression: DecompressionConfig,

    /// Accept pipelined HTTP/1 requests and reorder their responses.
    pub supports_pipelining: bool,

    /// HTTP versions to serve. `None` means HTTP/1 and HTTP/2 with TLS,
    /// HTTP/1 only without.
    pub supported_versions: Option<BTreeSet<HttpVersion>>,

    /// Optional TLS termination.
    pub tls: Option<TlsConfig>,

    /// Value of the `server` response header, if any.
    pub server_name: Option<String>,

    /// Upper bound on graceful shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,

    /// Largest accepted request head (request line + headers), in bytes.
    pub max_head_size: usize,

    /// Largest accepted request body, in bytes.
    pub max_body_size: usize,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: BindAddress::default(),
            backlog: 256,
            reuse_address: true,
            tcp_no_delay: true,
            response_compression: CompressionConfig::default(),
            request_decompression: DecompressionConfig::default(),
            supports_pipelining: true,
            supported_versions: None,
            tls: None,
            server_name: None,
            shutdown_timeout_ms: 10_000,
            max_head_size: 64 * 1024,
            max_body_size: 16 * 1024 * 1024,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// The versions actually served, after applying the TLS-dependent default.
    pub fn effective_versions(&self) -> BTreeSet<HttpVersion> {
        match &self.supported_versions {
            Some(versions) => versions.clone(),
            None if self.tls.is_some() => [HttpVersion::Http1, HttpVersion::Http2].into(),
            None => [HttpVersion::Http1].into(),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Returns a copy with `address` merged over the configured bind address.
    ///
    /// Hostname and port override independently; a Unix socket path replaces
    /// the address entirely.
    pub fn with_address_override(&self, address: Option<&BindAddress>) -> Self {
        let mut config = self.clone();
        match address {
            None => {}
            Some(BindAddress::Hostname { hostname, port }) => {
                let (current_host, current_port) = match &self.address {
                    BindAddress::Hostname { hostname, port } => (hostname.clone(), *port),
                    BindAddress::UnixDomainSocket { .. } => (None, None),
                };
                config.address = BindAddress::Hostname {
                    hostname: hostname.clone().or(current_host),
                    port: port.or(current_port),
                };
            }
            Some(unix @ BindAddress::UnixDomainSocket { .. }) => {
                config.address = unix.clone();
            }
        }
        config
    }
}

/// Listener address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindAddress {
    /// TCP socket. Missing parts fall back to [`DEFAULT_HOSTNAME`] / [`DEFAULT_PORT`].
    Hostname {
        hostname: Option<String>,
        port: Option<u16>,
    },
    /// Unix domain socket at a filesystem path.
    UnixDomainSocket { path: PathBuf },
}

impl BindAddress {
    pub fn hostname(hostname: impl Into<String>, port: u16) -> Self {
        BindAddress::Hostname {
            hostname: Some(hostname.into()),
            port: Some(port),
        }
    }

    pub fn port(port: u16) -> Self {
        BindAddress::Hostname {
            hostname: None,
            port: Some(port),
        }
    }
}

impl Default for BindAddress {
    fn default() -> Self {
        BindAddress::Hostname {
            hostname: Some(DEFAULT_HOSTNAME.to_string()),
            port: Some(DEFAULT_PORT),
        }
    }
}

/// HTTP protocol versions the listener can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpVersion {
    Http1,
    Http2,
}

/// Response compression policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CompressionConfig {
    Disabled,
    Enabled {
        /// Initial capacity of the per-response output buffer.
        initial_buffer_capacity: usize,
    },
}

impl CompressionConfig {
    pub fn enabled() -> Self {
        CompressionConfig::Enabled {
            initial_buffer_capacity: 1024,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig::Disabled
    }
}

/// Request decompression policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DecompressionConfig {
    Disabled,
    Enabled { limit: DecompressionLimit },
}

impl DecompressionConfig {
    pub fn enabled() -> Self {
        DecompressionConfig::Enabled {
            limit: DecompressionLimit::Ratio(25),
        }
    }
}

impl Default for DecompressionConfig {
    fn default() -> Self {
        DecompressionConfig::Disabled
    }
}

/// Bound on how far a request body may expand when decompressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompressionLimit {
    None,
    /// Decompressed size may be at most `n` times the compressed size.
    Ratio(usize),
    /// Decompressed size may be at most `n` bytes.
    Size(usize),
}

impl DecompressionLimit {
    /// Whether `decompressed` bytes produced from `compressed` input exceed the limit.
    pub fn exceeded(&self, compressed: usize, decompressed: usize) -> bool {
        match *self {
            DecompressionLimit::None => false,
            DecompressionLimit::Ratio(ratio) => decompressed > compressed.saturating_mul(ratio),
            DecompressionLimit::Size(size) => decompressed > size,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,

    /// Optional CA bundle (PEM) used to verify client certificates.
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,

    /// Custom client certificate verification, replacing `client_ca_path`.
    #[serde(skip)]
    pub client_verifier: Option<Arc<dyn ClientCertVerifier>>,
}

impl TlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            client_ca_path: None,
            client_verifier: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub log_json: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
