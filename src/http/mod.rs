//! HTTP values exchanged between the pipeline and the application.
//!
//! # Data Flow
//! ```text
//! pipeline request decoder
//!     → request.rs (Request + connection metadata)
//!     → responder.rs (external routing layer)
//!     → response.rs (status, headers, body, optional upgrader)
//!     → body.rs (in-memory or streaming body)
//!     → pipeline response encoder (date.rs supplies the Date header)
//! ```

pub mod body;
pub mod date;
pub mod request;
pub mod responder;
pub mod response;

pub use body::{BodyError, BodyStream, BodyStreamResult, BodyStreamWriter, ResponseBody};
pub use date::http_date;
pub use request::{PeerAddr, Request};
pub use responder::{responder_fn, Responder, ResponderFn};
pub use response::Response;

/// Boxed error used at the responder and body seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
