//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Start (server.rs):
//!     Merge address override → Validate → Build pipeline factory → Bind → Accept loop
//!
//! Shutdown (server.rs, shutdown.rs):
//!     Stop accepting → Quiesce connections → Wait (bounded) → Force close → Signal waiters
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → caller triggers graceful shutdown
//! ```
//!
//! # Design Decisions
//! - States only move forward: not started → started → shutting down → shut down
//! - Configuration is copied into the listener at start; later writes are ignored
//! - Shutdown has timeout: remaining connections are closed at the deadline

pub mod server;
pub mod shutdown;
pub mod signals;

pub use server::{Server, ServerError, ServerState};
pub use shutdown::Shutdown;
