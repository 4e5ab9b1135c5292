//! Assembles the handler chain for each accepted connection.
//!
//! # Responsibilities
//! - Decide, per connection, between plaintext HTTP/1, TLS + HTTP/1 and
//!   TLS + HTTP/2 (by ALPN)
//! - Build the HTTP/1 chain in a fixed order, with optional stages left out
//!   when disabled
//! - Build the TLS acceptor once and reuse it for every connection
//!
//! # Design Decisions
//! - HTTP/2 without TLS (h2c) is rejected when the builder is created
//! - A TLS configuration that cannot be loaded fails each connection with
//!   [`ConnectionError::TlsUnavailable`] rather than serving plaintext

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http::HeaderValue;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use super::codec::{RequestDecoder, ResponseEncoder};
use super::compression::{RequestDecompressor, ResponseCompressor};
use super::connection;
use super::dispatch::{CloseOnError, Dispatch, DISPATCH};
use super::engine::{Handler, Pipeline};
use super::error_boundary::ErrorBoundary;
use super::http1::{RequestParser, ResponseSerializer};
use super::http2::{self, Http2Settings};
use super::pipelining::Pipelining;
use super::upgrade::{UpgradeHandler, UPGRADE};
use crate::config::{
    CompressionConfig, DecompressionConfig, HttpVersion, ServerConfig, ValidationError,
};
use crate::http::Responder;
use crate::net::connection::DrainState;
use crate::net::listener::Accepted;
use crate::net::tls::{self, TlsError, ALPN_H2};
use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection I/O failed: {0}")]
    Io(#[source] io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("TLS is configured but unavailable: {0}")]
    TlsUnavailable(#[source] Arc<TlsError>),

    #[error("HTTP/2 connection failed: {0}")]
    Http2(#[source] hyper::Error),
}

/// Settings copied out of [`ServerConfig`] for the HTTP/1 chain.
#[derive(Debug, Clone)]
struct Http1Settings {
    pipelining: bool,
    compression: CompressionConfig,
    decompression: DecompressionConfig,
    server_name: Option<String>,
    max_head_size: usize,
    max_body_size: usize,
}

/// Builds and runs the per-connection pipeline for one listener.
pub struct PipelineBuilder {
    responder: Arc<dyn Responder>,
    http1: Http1Settings,
    versions: BTreeSet<HttpVersion>,
    /// `None` for plaintext listeners.
    tls: Option<Result<TlsAcceptor, Arc<TlsError>>>,
}

impl PipelineBuilder {
    pub fn new(
        config: &ServerConfig,
        responder: Arc<dyn Responder>,
    ) -> Result<Self, ValidationError> {
        let versions = config.effective_versions();
        if versions.is_empty() {
            return Err(ValidationError::NoVersions);
        }
        if config.tls.is_none() && !versions.contains(&HttpVersion::Http1) {
            return Err(ValidationError::PlaintextHttp2);
        }

        let tls = config.tls.as_ref().map(|tls_config| {
            tls::build_acceptor(tls_config, &versions).map_err(|error| {
                tracing::error!(error = %error, "Failed to build TLS context; connections will be closed");
                Arc::new(error)
            })
        });

        Ok(Self {
            responder,
            http1: Http1Settings {
                pipelining: config.supports_pipelining,
                compression: config.response_compression,
                decompression: config.request_decompression,
                server_name: config.server_name.clone(),
                max_head_size: config.max_head_size,
                max_body_size: config.max_body_size,
            },
            versions,
            tls,
        })
    }

    pub fn versions(&self) -> &BTreeSet<HttpVersion> {
        &self.versions
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// The HTTP/1 handler chain, socket end first.
    ///
    /// `upgrades` adds the handler that hands the connection to another
    /// protocol after a `101` response; it is only offered on plaintext
    /// connections.
    pub fn http1_handlers(&self, peer: Option<SocketAddr>, upgrades: bool) -> Vec<Box<dyn Handler>> {
        let settings = &self.http1;
        let mut handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(ResponseSerializer::new()),
            Box::new(RequestParser::new(
                settings.pipelining,
                settings.max_head_size,
                settings.max_body_size,
            )),
        ];
        if settings.pipelining {
            handlers.push(Box::new(Pipelining::new()));
        }
        if let CompressionConfig::Enabled {
            initial_buffer_capacity,
        } = settings.compression
        {
            handlers.push(Box::new(ResponseCompressor::new(initial_buffer_capacity)));
        }
        if let DecompressionConfig::Enabled { limit } = settings.decompression {
            handlers.push(Box::new(RequestDecompressor::new(limit)));
        }
        handlers.push(Box::new(ErrorBoundary::new()));
        handlers.push(Box::new(ResponseEncoder::new(settings.server_name.as_deref())));
        handlers.push(Box::new(RequestDecoder::new(peer)));

        if upgrades {
            let mut http_handlers: Vec<&'static str> = handlers.iter().map(|h| h.name()).collect();
            http_handlers.push(UPGRADE);
            http_handlers.push(DISPATCH);
            handlers.push(Box::new(UpgradeHandler::new(http_handlers)));
        }
        handlers.push(Box::new(Dispatch::new(Arc::clone(&self.responder))));
        handlers.push(Box::new(CloseOnError));
        handlers
    }

    /// Serves one accepted connection to completion.
    pub async fn serve(
        &self,
        accepted: Accepted,
        peer: Option<SocketAddr>,
        drain: watch::Receiver<DrainState>,
    ) -> Result<(), ConnectionError> {
        match accepted {
            Accepted::Tcp(stream) => self.serve_io(stream, peer, drain).await,
            #[cfg(unix)]
            Accepted::Unix(stream) => self.serve_io(stream, peer, drain).await,
        }
    }

    async fn serve_io<IO>(
        &self,
        io: IO,
        peer: Option<SocketAddr>,
        drain: watch::Receiver<DrainState>,
    ) -> Result<(), ConnectionError>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let acceptor = match &self.tls {
            None => {
                let pipeline = Pipeline::new(self.http1_handlers(peer, true));
                return counted("http1", connection::drive(io, pipeline, drain))
                    .await
                    .map_err(ConnectionError::Io);
            }
            Some(Err(error)) => return Err(ConnectionError::TlsUnavailable(Arc::clone(error))),
            Some(Ok(acceptor)) => acceptor,
        };

        let stream = acceptor.accept(io).await.map_err(|error| {
            metrics::record_tls_handshake_failure();
            ConnectionError::Handshake(error)
        })?;

        if stream.get_ref().1.alpn_protocol() == Some(ALPN_H2) {
            let settings = Http2Settings {
                server_name: self
                    .http1
                    .server_name
                    .as_deref()
                    .and_then(|name| HeaderValue::from_str(name).ok()),
                max_body_size: self.http1.max_body_size,
                peer,
            };
            let responder = Arc::clone(&self.responder);
            return counted("http2", http2::serve(stream, responder, settings, drain))
                .await
                .map_err(ConnectionError::Http2);
        }

        if !self.versions.contains(&HttpVersion::Http1) {
            tracing::debug!(?peer, "Client did not negotiate h2; closing");
            return Ok(());
        }
        let pipeline = Pipeline::new(self.http1_handlers(peer, false));
        counted("http1", connection::drive(stream, pipeline, drain))
            .await
            .map_err(ConnectionError::Io)
    }
}

/// Runs `serving` between the open and close connection metrics.
async fn counted<F: Future>(protocol: &'static str, serving: F) -> F::Output {
    metrics::connection_opened(protocol);
    let output = serving.await;
    metrics::connection_closed();
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecompressionLimit, TlsConfig};
    use crate::http::{responder_fn, Response};

    fn responder() -> Arc<dyn Responder> {
        Arc::new(responder_fn(|_| async { Ok(Response::ok("ok")) }))
    }

    #[test]
    fn default_chain_order() {
        let builder = PipelineBuilder::new(&ServerConfig::default(), responder()).unwrap();
        let pipeline = Pipeline::new(builder.http1_handlers(None, true));
        assert_eq!(
            pipeline.handler_names(),
            vec![
                "http1-response-serializer",
                "http1-request-parser",
                "pipelining",
                "protocol-error-boundary",
                "response-encoder",
                "request-decoder",
                "upgrade",
                "dispatch",
                "close-on-error",
            ]
        );
    }

    #[test]
    fn full_chain_order() {
        let config = ServerConfig {
            response_compression: CompressionConfig::enabled(),
            request_decompression: DecompressionConfig::Enabled {
                limit: DecompressionLimit::Size(1024),
            },
            ..ServerConfig::default()
        };
        let builder = PipelineBuilder::new(&config, responder()).unwrap();
        let pipeline = Pipeline::new(builder.http1_handlers(None, false));
        assert_eq!(
            pipeline.handler_names(),
            vec![
                "http1-response-serializer",
                "http1-request-parser",
                "pipelining",
                "response-compressor",
                "request-decompressor",
                "protocol-error-boundary",
                "response-encoder",
                "request-decoder",
                "dispatch",
                "close-on-error",
            ]
        );
    }

    #[test]
    fn pipelining_disabled_drops_the_reorderer() {
        let config = ServerConfig {
            supports_pipelining: false,
            ..ServerConfig::default()
        };
        let builder = PipelineBuilder::new(&config, responder()).unwrap();
        let names = Pipeline::new(builder.http1_handlers(None, true)).handler_names();
        assert!(!names.contains(&"pipelining"));
    }

    #[test]
    fn rejects_plaintext_http2() {
        let config = ServerConfig {
            supported_versions: Some([HttpVersion::Http2].into()),
            ..ServerConfig::default()
        };
        assert!(matches!(
            PipelineBuilder::new(&config, responder()),
            Err(ValidationError::PlaintextHttp2)
        ));
    }

    #[test]
    fn rejects_empty_versions() {
        let config = ServerConfig {
            supported_versions: Some(BTreeSet::new()),
            ..ServerConfig::default()
        };
        assert!(matches!(
            PipelineBuilder::new(&config, responder()),
            Err(ValidationError::NoVersions)
        ));
    }

    #[tokio::test]
    async fn unloadable_tls_closes_connections() {
        let config = ServerConfig {
            tls: Some(TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem")),
            ..ServerConfig::default()
        };
        let builder = PipelineBuilder::new(&config, responder()).unwrap();
        assert!(builder.is_tls());

        let (_client, server) = tokio::io::duplex(64);
        let (_tx, drain) = watch::channel(DrainState::Running);
        let result = builder.serve_io(server, None, drain).await;
        assert!(matches!(result, Err(ConnectionError::TlsUnavailable(_))));
    }
}
