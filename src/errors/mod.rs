//! Centralized error handling for the image pipeline
//!
//! # Error Categories
//!
//! - **Transient I/O**: network or disk failures during a transfer
//! - **Malformed input**: bad URLs, corrupt image bytes
//! - **Resource exhausted**: decode allocation failures (retried briefly)
//! - **Cancelled**: superseded or released requests, never reported as failure
//!
//! A disk cache that cannot initialize is not an error: the disk tier is
//! silently bypassed.
//!
//! # Usage
//!
//! ```rust
//! use photo_pipeline::errors::{PipelineError, PipelineResult};
//!
//! fn parse(identifier: &str) -> PipelineResult<url::Url> {
//!     url::Url::parse(identifier).map_err(|e| PipelineError::malformed(e.to_string()))
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for request-path results
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Convenience type alias for disk store results
pub type CacheResult<T> = Result<T, CacheError>;

/// Convenience type alias for configuration validation
pub type ConfigResult<T> = Result<T, ConfigError>;
