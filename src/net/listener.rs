//! Listening sockets.
//!
//! # Responsibilities
//! - Resolve and bind the configured address (TCP or Unix domain socket)
//! - Apply socket options: backlog, `SO_REUSEADDR`, `TCP_NODELAY`
//! - Accept incoming connections

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::config::{BindAddress, ServerConfig, DEFAULT_HOSTNAME, DEFAULT_PORT};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),

    #[error("unix domain sockets are not supported on this platform")]
    UnixUnsupported,
}

/// Address a listener is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl LocalAddr {
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            LocalAddr::Inet(addr) => Some(*addr),
            LocalAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalAddr::Inet(addr) => write!(f, "{}", addr),
            LocalAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// An accepted client stream.
#[derive(Debug)]
pub enum Accepted {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

#[derive(Debug)]
pub enum Listener {
    Tcp {
        inner: TcpListener,
        no_delay: bool,
    },
    #[cfg(unix)]
    Unix { inner: UnixListener, path: PathBuf },
}

impl Listener {
    /// Binds the address in `config`.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ListenerError> {
        match &config.address {
            BindAddress::Hostname { hostname, port } => {
                let host = hostname.as_deref().unwrap_or(DEFAULT_HOSTNAME);
                let port = port.unwrap_or(DEFAULT_PORT);
                Self::bind_tcp(host, port, config).await
            }
            BindAddress::UnixDomainSocket { path } => Self::bind_unix(path.clone()),
        }
    }

    async fn bind_tcp(host: &str, port: u16, config: &ServerConfig) -> Result<Self, ListenerError> {
        let address = format!("{}:{}", host, port);
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| ListenerError::Resolve {
                address: address.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| ListenerError::Resolve {
                address: address.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
            })?;

        let bind = |source| ListenerError::Bind {
            address: address.clone(),
            source,
        };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind)?;
        socket.set_reuseaddr(config.reuse_address).map_err(bind)?;
        socket.bind(addr).map_err(bind)?;
        let inner = socket.listen(config.backlog).map_err(bind)?;

        Ok(Listener::Tcp {
            inner,
            no_delay: config.tcp_no_delay,
        })
    }

    #[cfg(unix)]
    fn bind_unix(path: PathBuf) -> Result<Self, ListenerError> {
        use std::os::unix::fs::FileTypeExt;

        // a socket file left behind by a previous run
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if metadata.file_type().is_socket() {
                let _ = std::fs::remove_file(&path);
            }
        }
        let inner = UnixListener::bind(&path).map_err(|source| ListenerError::Bind {
            address: path.display().to_string(),
            source,
        })?;
        Ok(Listener::Unix { inner, path })
    }

    #[cfg(not(unix))]
    fn bind_unix(_path: PathBuf) -> Result<Self, ListenerError> {
        Err(ListenerError::UnixUnsupported)
    }

    /// Accepts one connection. The peer address is `None` for Unix sockets.
    pub async fn accept(&self) -> Result<(Accepted, Option<SocketAddr>), ListenerError> {
        match self {
            Listener::Tcp { inner, no_delay } => {
                let (stream, peer) = inner.accept().await.map_err(ListenerError::Accept)?;
                if let Err(error) = stream.set_nodelay(*no_delay) {
                    tracing::debug!(peer_addr = %peer, error = %error, "Failed to set TCP_NODELAY");
                }
                Ok((Accepted::Tcp(stream), Some(peer)))
            }
            #[cfg(unix)]
            Listener::Unix { inner, .. } => {
                let (stream, _) = inner.accept().await.map_err(ListenerError::Accept)?;
                Ok((Accepted::Unix(stream), None))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<LocalAddr> {
        match self {
            Listener::Tcp { inner, .. } => inner.local_addr().map(LocalAddr::Inet),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(LocalAddr::Unix(path.clone())),
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_on_configured_host() {
        let mut config = ServerConfig::default();
        config.address = BindAddress::hostname("127.0.0.1", 0);

        let listener = Listener::bind(&config).await.unwrap();
        let addr = listener.local_addr().unwrap().as_inet().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, peer) = listener.accept().await.unwrap();
        assert!(matches!(accepted, Accepted::Tcp(_)));
        assert!(peer.is_some());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn reports_bind_conflicts() {
        let mut config = ServerConfig::default();
        config.address = BindAddress::hostname("127.0.0.1", 0);
        config.reuse_address = false;
        let first = Listener::bind(&config).await.unwrap();
        let port = first.local_addr().unwrap().as_inet().unwrap().port();

        config.address = BindAddress::hostname("127.0.0.1", port);
        let err = Listener::bind(&config).await.unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn binds_unix_socket() {
        let path = std::env::temp_dir().join(format!("harbor-listener-{}.sock", std::process::id()));
        let mut config = ServerConfig::default();
        config.address = BindAddress::UnixDomainSocket { path: path.clone() };

        let listener = Listener::bind(&config).await.unwrap();
        assert_eq!(listener.local_addr().unwrap(), LocalAddr::Unix(path.clone()));

        let connect = path.clone();
        let client = tokio::spawn(async move { UnixStream::connect(connect).await.unwrap() });
        let (_, peer) = listener.accept().await.unwrap();
        assert!(peer.is_none());
        client.await.unwrap();
        let _ = std::fs::remove_file(path);
    }
}
