//! Connection pipelines.
//!
//! # Data Flow
//! ```text
//! Plaintext socket:
//!     → HTTP/1 handler chain (engine.rs), socket end first:
//!         http1-response-serializer   response parts → bytes (http1.rs)
//!         http1-request-parser        bytes → request parts (http1.rs)
//!         pipelining                  responses back in request order
//!         response-compressor         gzip / deflate (compression.rs)
//!         request-decompressor        bounded inflate (compression.rs)
//!         protocol-error-boundary     400 for malformed requests
//!         response-encoder            Response → parts, standard headers (codec.rs)
//!         request-decoder             parts → Request (codec.rs)
//!         upgrade                     101 hand-off to other handlers
//!         dispatch                    Request → Responder
//!         close-on-error
//!
//! TLS socket:
//!     → handshake (ALPN)
//!     → "h2": hyper HTTP/2 connection (http2.rs)
//!     → otherwise: the HTTP/1 chain without upgrade
//! ```
//!
//! # Design Decisions
//! - One task per connection owns its pipeline; responder calls and
//!   streaming bodies run on their own tasks and report back by channel
//! - Optional stages are left out of the chain, not bypassed

pub mod builder;
pub mod codec;
pub mod compression;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod error_boundary;
pub mod http1;
pub mod http2;
pub mod message;
pub mod pipelining;
pub mod upgrade;

pub use builder::{ConnectionError, PipelineBuilder};
pub use engine::{Context, Handler, Pipeline};
pub use error::{ParseError, PipelineError};
pub use message::{Inbound, Outbound};
pub use upgrade::Upgrader;
