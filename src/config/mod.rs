//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated snapshot)
//!     → copied into the listener on start
//! ```
//!
//! # Design Decisions
//! - A running listener never observes configuration changes; writes after
//!   start are rejected by the lifecycle manager
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BindAddress, CompressionConfig, DecompressionConfig, DecompressionLimit, HttpVersion,
    ObservabilityConfig, ServerConfig, TlsConfig, DEFAULT_HOSTNAME, DEFAULT_PORT,
};
pub use validation::{validate_config, ValidationError};
