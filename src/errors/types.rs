//! Error type definitions for the image pipeline
//!
//! Errors are split by layer: [`PipelineError`] is what a request can fail
//! with, [`CacheError`] covers the on-disk store and [`ConfigError`] covers
//! configuration validation.

use std::io;
use thiserror::Error;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or disk failure during a transfer. Not retried by the pipeline.
    TransientIo,
    /// Bad URL or undecodable bytes. Permanent.
    MalformedInput,
    /// Decode allocation failure. Retried a bounded number of times.
    ResourceExhausted,
    /// The request was superseded, released or shut down.
    Cancelled,
}

/// Errors produced while resolving or decoding a single request
#[derive(Error, Debug)]
pub enum PipelineError {
    /// I/O failure with context about what was being done
    #[error("I/O error while {context}: {source}")]
    TransientIo {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Transport-level HTTP client failure
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("HTTP status {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    /// Bad identifier or corrupt image bytes
    #[error("Malformed input: {message}")]
    MalformedInput { message: String },

    /// Allocation failure or decoder limit exceeded
    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// Cancellation is not a failure and is never reported to a sink
    #[error("Request cancelled")]
    Cancelled,

    /// Disk store failure surfaced on a request path
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl PipelineError {
    pub fn io<S: Into<String>>(context: S, source: io::Error) -> Self {
        Self::TransientIo {
            context: context.into(),
            source,
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

    pub fn exhausted<S: Into<String>>(message: S) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientIo { .. } | Self::Network(_) | Self::HttpStatus { .. } => {
                ErrorKind::TransientIo
            }
            Self::Cache(_) => ErrorKind::TransientIo,
            Self::MalformedInput { .. } => ErrorKind::MalformedInput,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether another attempt could succeed without different input
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ResourceExhausted
    }
}

/// Disk store errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Disk cache I/O error: {0}")]
    Io(#[from] io::Error),

    /// Journal could not be replayed; the store is rebuilt empty
    #[error("Corrupt journal at line {line}: {reason}")]
    CorruptJournal { line: usize, reason: String },

    #[error("Invalid cache key '{key}'")]
    InvalidKey { key: String },

    /// Another editor already holds this key
    #[error("Entry '{key}' is already being edited")]
    EditInProgress { key: String },

    #[error("Disk cache is closed")]
    Closed,

    /// Re-encoding or compression of an entry failed
    #[error("Failed to encode cache entry: {message}")]
    Encode { message: String },
}

impl CacheError {
    pub fn corrupt<S: Into<String>>(line: usize, reason: S) -> Self {
        Self::CorruptJournal {
            line,
            reason: reason.into(),
        }
    }

    pub fn encode<S: Into<String>>(message: S) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }
}

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration for '{field}': {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}
