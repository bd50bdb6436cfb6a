//! Common error types for SliceLoop
//!
//! This module defines the error type shared by the worker and coordinator.
//! Stage-local failures inside the slice pipeline have their own error types
//! and are reported as `ErrorRecord`s; this type covers everything around them.

use thiserror::Error;

/// Main error type for SliceLoop
#[derive(Error, Debug)]
pub enum SliceLoopError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model package errors (missing weights, bad sources)
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested artifact is not served
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job-level failure reported by the executor
    #[error("Job error: {0}")]
    Job(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for SliceLoopError {
    fn from(err: config::ConfigError) -> Self {
        SliceLoopError::Config(err.to_string())
    }
}

impl SliceLoopError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        SliceLoopError::Config(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        SliceLoopError::Model(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        SliceLoopError::InvalidInput(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        SliceLoopError::NotFound(msg.into())
    }

    /// Create a job error
    pub fn job(msg: impl Into<String>) -> Self {
        SliceLoopError::Job(msg.into())
    }
}

/// Result type alias for SliceLoop operations
pub type Result<T> = std::result::Result<T, SliceLoopError>;
