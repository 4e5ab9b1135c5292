//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Reject protocol combinations the pipeline cannot serve (HTTP/2 without TLS)
//! - Validate value ranges (backlog, limits, timeouts)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before a listener is bound

use thiserror::Error;

use crate::config::schema::{
    BindAddress, CompressionConfig, DecompressionConfig, DecompressionLimit, HttpVersion,
    ServerConfig,
};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// HTTP/2 is the only version but there is no TLS to negotiate it (h2c).
    #[error("HTTP/2 over plaintext (h2c) is not supported; configure TLS or enable HTTP/1")]
    PlaintextHttp2,

    #[error("at least one HTTP version must be supported")]
    NoVersions,

    #[error("backlog must be greater than zero")]
    ZeroBacklog,

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("unix socket path must not be empty")]
    EmptySocketPath,
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let versions = config.effective_versions();
    if versions.is_empty() {
        errors.push(ValidationError::NoVersions);
    } else if config.tls.is_none() && !versions.contains(&HttpVersion::Http1) {
        errors.push(ValidationError::PlaintextHttp2);
    }

    if config.backlog == 0 {
        errors.push(ValidationError::ZeroBacklog);
    }
    if config.max_head_size == 0 {
        errors.push(ValidationError::ZeroLimit("max_head_size"));
    }
    if config.max_body_size == 0 {
        errors.push(ValidationError::ZeroLimit("max_body_size"));
    }
    if config.shutdown_timeout_ms == 0 {
        errors.push(ValidationError::ZeroLimit("shutdown_timeout_ms"));
    }
    if let CompressionConfig::Enabled {
        initial_buffer_capacity: 0,
    } = config.response_compression
    {
        errors.push(ValidationError::ZeroLimit("initial_buffer_capacity"));
    }
    if let DecompressionConfig::Enabled {
        limit: DecompressionLimit::Ratio(0) | DecompressionLimit::Size(0),
    } = config.request_decompression
    {
        errors.push(ValidationError::ZeroLimit("decompression limit"));
    }
    if let BindAddress::UnixDomainSocket { path } = &config.address {
        if path.as_os_str().is_empty() {
            errors.push(ValidationError::EmptySocketPath);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
