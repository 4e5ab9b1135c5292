//! harbor demo server.
//!
//! Serves a small axum router through the harbor pipeline:
//!
//! - `GET /` returns a greeting
//! - `POST /echo` returns the request body
//! - `GET /events` streams a few server-sent events

use std::path::PathBuf;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use futures_util::stream;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use harbor::config::{load_config, BindAddress, ServerConfig};
use harbor::lifecycle::signals::shutdown_signal;
use harbor::observability::{logging, metrics};
use harbor::sse::ServerSentEvent;
use harbor::Server;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_COUNT: u64 = 5;
const EVENT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "harbor", version, about = "HTTP/1.1 and HTTP/2 server")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hostname to bind, overriding the configuration.
    #[arg(long)]
    hostname: Option<String>,

    /// Port to bind, overriding the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Unix socket path to bind instead of a TCP address.
    #[arg(long, conflicts_with_all = ["hostname", "port"])]
    unix_socket: Option<PathBuf>,
}

impl Cli {
    fn address_override(&self) -> Option<BindAddress> {
        if let Some(path) = &self.unix_socket {
            return Some(BindAddress::UnixDomainSocket { path: path.clone() });
        }
        if self.hostname.is_none() && self.port.is_none() {
            return None;
        }
        Some(BindAddress::Hostname {
            hostname: self.hostname.clone(),
            port: self.port,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "harbor starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = Server::new(config, router());
    let address = server.start(cli.address_override()).await?;
    tracing::info!(address = %address, "Listening for connections");

    let signal = shutdown_signal().await;
    tracing::info!(%signal, "Shutdown signal received");

    if let Err(error) = server.shutdown().await {
        // already logged; the process still exits
        tracing::debug!(error = %error, "Shutdown finished with error");
    }
    Ok(())
}

fn router() -> Router {
    Router::new()
        .route("/", get(|| async { "Hello from harbor\n" }))
        .route("/echo", post(|body: Bytes| async move { body }))
        .route("/events", get(events))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
}

async fn events() -> impl IntoResponse {
    let ticks = stream::unfold(0u64, |n| async move {
        if n == EVENT_COUNT {
            return None;
        }
        if n > 0 {
            tokio::time::sleep(EVENT_INTERVAL).await;
        }
        let event = ServerSentEvent::new(format!("tick {}", n))
            .with_event_type("tick")
            .with_id(n.to_string());
        Some((Ok::<_, std::convert::Infallible>(event.encode()), n + 1))
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ticks),
    )
}
