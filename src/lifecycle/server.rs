//! The server lifecycle: start, accept, drain, stop.
//!
//! # Responsibilities
//! - Hold the configuration until start, then freeze it for the listener
//! - Bind the listener and run the accept loop
//! - Quiesce open connections on shutdown, bounded by the shutdown timeout
//! - Let any task wait for shutdown to complete
//!
//! # Design Decisions
//! - Lifecycle fields live behind a `std::sync::Mutex` that is never held
//!   across an await
//! - Dropping a server that is still running is a programming error and
//!   trips a debug assertion

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::shutdown::{self, Shutdown};
use crate::config::loader::join_errors;
use crate::config::{validate_config, BindAddress, ServerConfig, ValidationError};
use crate::http::Responder;
use crate::net::connection::{ConnectionTracker, DrainState};
use crate::net::listener::{Listener, ListenerError, LocalAddr};
use crate::pipeline::PipelineBuilder;

/// Pause after a failed accept so a persistent error (such as running out
/// of file descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server has already been started")]
    AlreadyStarted,

    #[error("invalid configuration: {}", join_errors(.0))]
    InvalidConfig(Vec<ValidationError>),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] io::Error),

    #[error("shutdown did not finish within {timeout:?}; closed {remaining} connection(s)")]
    ShutdownTimeout { timeout: Duration, remaining: u64 },
}

/// Where a [`Server`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Started,
    ShuttingDown,
    ShutDown,
}

struct Running {
    local_addr: LocalAddr,
    tracker: ConnectionTracker,
    accept_task: JoinHandle<()>,
    shutdown_timeout: Duration,
}

enum Lifecycle {
    NotStarted,
    /// Binding; no listener yet.
    Starting,
    Started(Running),
    ShuttingDown,
    ShutDown,
}

struct Inner {
    config: ServerConfig,
    lifecycle: Lifecycle,
}

/// One listener serving one [`Responder`].
pub struct Server {
    responder: Arc<dyn Responder>,
    inner: Mutex<Inner>,
    shutdown: Shutdown,
}

impl Server {
    pub fn new(config: ServerConfig, responder: impl Responder) -> Self {
        Self::with_responder(config, Arc::new(responder))
    }

    pub fn with_responder(config: ServerConfig, responder: Arc<dyn Responder>) -> Self {
        Self {
            responder,
            inner: Mutex::new(Inner {
                config,
                lifecycle: Lifecycle::NotStarted,
            }),
            shutdown: Shutdown::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServerState {
        match self.lock().lifecycle {
            Lifecycle::NotStarted | Lifecycle::Starting => ServerState::NotStarted,
            Lifecycle::Started(_) => ServerState::Started,
            Lifecycle::ShuttingDown => ServerState::ShuttingDown,
            Lifecycle::ShutDown => ServerState::ShutDown,
        }
    }

    pub fn configuration(&self) -> ServerConfig {
        self.lock().config.clone()
    }

    /// Replaces the configuration. Ignored, with a warning, once the server
    /// has been started.
    pub fn set_configuration(&self, config: ServerConfig) {
        let mut inner = self.lock();
        if let Lifecycle::NotStarted = inner.lifecycle {
            inner.config = config;
        } else {
            tracing::warn!("Ignoring configuration change after start");
        }
    }

    /// The bound address while the server is running.
    pub fn local_addr(&self) -> Option<LocalAddr> {
        match &self.lock().lifecycle {
            Lifecycle::Started(running) => Some(running.local_addr.clone()),
            _ => None,
        }
    }

    /// Binds and starts accepting connections.
    ///
    /// `address` is merged over the configured bind address for this start
    /// only: a hostname or port replaces just that part, a Unix socket path
    /// replaces the whole address. The stored configuration is unchanged.
    pub async fn start(&self, address: Option<BindAddress>) -> Result<LocalAddr, ServerError> {
        let config = {
            let mut inner = self.lock();
            if !matches!(inner.lifecycle, Lifecycle::NotStarted) {
                return Err(ServerError::AlreadyStarted);
            }
            inner.lifecycle = Lifecycle::Starting;
            inner.config.with_address_override(address.as_ref())
        };

        match self.bind(&config).await {
            Ok(running) => {
                let local_addr = running.local_addr.clone();
                tracing::info!(address = %local_addr, tls = config.tls.is_some(), "Server started");
                self.lock().lifecycle = Lifecycle::Started(running);
                Ok(local_addr)
            }
            Err(error) => {
                tracing::error!(error = %error, "Server failed to start");
                self.lock().lifecycle = Lifecycle::NotStarted;
                Err(error)
            }
        }
    }

    async fn bind(&self, config: &ServerConfig) -> Result<Running, ServerError> {
        validate_config(config).map_err(ServerError::InvalidConfig)?;
        let builder = PipelineBuilder::new(config, Arc::clone(&self.responder))
            .map_err(|error| ServerError::InvalidConfig(vec![error]))?;

        let listener = Listener::bind(config).await?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;
        let tracker = ConnectionTracker::new();
        let accept_task = tokio::spawn(accept_loop(listener, Arc::new(builder), tracker.clone()));

        Ok(Running {
            local_addr,
            tracker,
            accept_task,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    /// Stops accepting, lets in-flight requests finish and closes every
    /// connection.
    ///
    /// A no-op before start and after shutdown. A call made while another
    /// shutdown is in progress waits for that one. If connections are still
    /// open when the shutdown timeout expires they are closed anyway and
    /// [`ServerError::ShutdownTimeout`] is returned.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let running = {
            let mut inner = self.lock();
            match std::mem::replace(&mut inner.lifecycle, Lifecycle::ShuttingDown) {
                Lifecycle::Started(running) => Some(running),
                Lifecycle::ShuttingDown => None,
                other => {
                    inner.lifecycle = other;
                    return Ok(());
                }
            }
        };
        let Some(running) = running else {
            self.shutdown.wait().await;
            return Ok(());
        };

        tracing::info!(
            active_connections = running.tracker.active_count(),
            timeout = ?running.shutdown_timeout,
            "Shutting down"
        );
        running.tracker.begin_drain();
        if let Err(error) = running.accept_task.await {
            if error.is_panic() {
                tracing::error!("Accept loop panicked");
            }
        }

        let result = shutdown::quiesce(&running.tracker, running.shutdown_timeout).await;
        self.lock().lifecycle = Lifecycle::ShutDown;
        self.shutdown.trigger();

        match result {
            Ok(()) => {
                tracing::info!("Shutdown complete");
                Ok(())
            }
            Err(timed_out) => {
                let error = ServerError::ShutdownTimeout {
                    timeout: running.shutdown_timeout,
                    remaining: timed_out.remaining,
                };
                tracing::error!(error = %error, "Shutdown timed out");
                Err(error)
            }
        }
    }

    /// Resolves once the server has shut down.
    ///
    /// # Panics
    ///
    /// If the server has not been started.
    pub fn on_shutdown(&self) -> impl Future<Output = ()> + Send + 'static {
        if matches!(
            self.lock().lifecycle,
            Lifecycle::NotStarted | Lifecycle::Starting
        ) {
            panic!("on_shutdown called before the server was started");
        }
        self.shutdown.wait()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(
            !matches!(inner.lifecycle, Lifecycle::Started(_) | Lifecycle::ShuttingDown),
            "server dropped while running; call shutdown() first"
        );
    }
}

async fn accept_loop(listener: Listener, builder: Arc<PipelineBuilder>, tracker: ConnectionTracker) {
    let mut drain = tracker.drain_receiver();
    loop {
        let (accepted, peer) = tokio::select! {
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(error = %error, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
            _ = stopped(&mut drain) => break,
        };

        let guard = tracker.track();
        let builder = Arc::clone(&builder);
        let drain = tracker.drain_receiver();
        tokio::spawn(async move {
            let connection_id = guard.id();
            tracing::debug!(%connection_id, peer_addr = ?peer, "Connection accepted");
            let mut force = drain.clone();
            let result = tokio::select! {
                result = builder.serve(accepted, peer, drain) => result,
                _ = force_closed(&mut force) => Ok(()),
            };
            if let Err(error) = result {
                tracing::debug!(%connection_id, peer_addr = ?peer, error = %error, "Connection ended with error");
            }
            drop(guard);
        });
    }
    tracing::debug!("Stopped accepting connections");
}

async fn stopped(drain: &mut watch::Receiver<DrainState>) {
    let _ = drain.wait_for(|state| *state != DrainState::Running).await;
}

async fn force_closed(drain: &mut watch::Receiver<DrainState>) {
    let _ = drain.wait_for(|state| *state == DrainState::ForceClose).await;
}
