//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP / Unix connection
//!     → listener.rs (bind, socket options, accept)
//!     → tls.rs (optional TLS acceptor with ALPN)
//!     → connection.rs (tracking, drain state)
//!     → Hand off to the connection pipeline
//!
//! Drain states:
//!     Running → Draining → ForceClose
//! ```
//!
//! # Design Decisions
//! - Every connection is tracked so shutdown can wait for it
//! - Drain state is broadcast on a watch channel; late subscribers still see it
//! - TLS is optional and handled by the pipeline builder

pub mod connection;
pub mod listener;
pub mod tls;
