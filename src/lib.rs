//! harbor: an HTTP server core.
//!
//! Binds a listener, negotiates TLS and the HTTP version, runs each
//! connection through a handler pipeline and hands complete requests to a
//! [`Responder`](http::Responder). Shutdown drains open connections within
//! a configured deadline.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod pipeline;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

// Protocol helpers
pub mod sse;

pub use config::ServerConfig;
pub use http::{responder_fn, Responder, Response, ResponseBody};
pub use lifecycle::{Server, ServerError};
