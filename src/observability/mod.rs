//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Listener, pipelines, lifecycle:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (connection, request and error counters)
//!
//! Consumers:
//!     → stdout (human-readable or JSON lines)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Metric updates are no-ops until a recorder is installed
//! - Log level from config, overridable with `RUST_LOG`

pub mod logging;
pub mod metrics;
