//! HTTP/2 connections, negotiated through ALPN on TLS listeners.
//!
//! Framing and stream multiplexing belong to hyper; each stream is collected
//! into a [`Request`](crate::http::Request) and answered by the same
//! [`Responder`] the HTTP/1 pipeline uses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use http::header::{DATE, SERVER};
use http::{HeaderValue, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::http::{http_date, BoxError, PeerAddr, Responder};
use crate::net::connection::DrainState;
use crate::observability::metrics;

/// Per-connection settings shared by every stream.
#[derive(Debug, Clone)]
pub struct Http2Settings {
    pub server_name: Option<HeaderValue>,
    pub max_body_size: usize,
    pub peer: Option<SocketAddr>,
}

/// Serves one HTTP/2 connection until the client goes away or the drain
/// state says to stop.
///
/// [`DrainState::Draining`] sends GOAWAY and lets open streams finish;
/// [`DrainState::ForceClose`] drops the connection.
pub async fn serve<IO>(
    io: IO,
    responder: Arc<dyn Responder>,
    settings: Http2Settings,
    mut drain: watch::Receiver<DrainState>,
) -> Result<(), hyper::Error>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let settings = Arc::new(settings);
    let service = service_fn(move |request| {
        respond(Arc::clone(&responder), Arc::clone(&settings), request)
    });

    let conn = http2::Builder::new(TokioExecutor::new()).serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut watching = true;
    let mut going_away = false;
    loop {
        let state = *drain.borrow_and_update();
        match state {
            DrainState::ForceClose => return Ok(()),
            DrainState::Draining if !going_away => {
                going_away = true;
                conn.as_mut().graceful_shutdown();
            }
            _ => {}
        }

        tokio::select! {
            result = conn.as_mut() => return result,
            changed = drain.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                }
            }
        }
    }
}

async fn respond(
    responder: Arc<dyn Responder>,
    settings: Arc<Http2Settings>,
    request: http::Request<Incoming>,
) -> Result<http::Response<Body>, BoxError> {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(Body::new(body), settings.max_body_size).await {
        Ok(body) => body,
        Err(error) => {
            tracing::debug!(error = %error, "Rejecting HTTP/2 request body");
            return Ok(status_response(StatusCode::PAYLOAD_TOO_LARGE, &settings));
        }
    };

    let mut request = http::Request::from_parts(parts, body);
    request.extensions_mut().insert(PeerAddr(settings.peer));
    metrics::record_request("http2");

    // An error resets the stream; the connection keeps serving others.
    let mut response = responder.respond(request).await?.into_http();
    stamp(response.headers_mut(), &settings);
    Ok(response)
}

fn status_response(status: StatusCode, settings: &Http2Settings) -> http::Response<Body> {
    let mut response = http::Response::new(Body::empty());
    *response.status_mut() = status;
    stamp(response.headers_mut(), settings);
    response
}

fn stamp(headers: &mut http::HeaderMap, settings: &Http2Settings) {
    if !headers.contains_key(DATE) {
        headers.insert(DATE, http_date());
    }
    if let Some(server) = &settings.server_name {
        if !headers.contains_key(SERVER) {
            headers.insert(SERVER, server.clone());
        }
    }
}
