// src/errors.rs

//! Crate-wide error type.
//!
//! Lock contention is deliberately absent: a refused guard acquisition is a
//! skip, reported as `Ok(None)` by the guard and as an `Idle` job result.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchrelayError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Event encoding error: {0}")]
    EventEncoding(#[from] serde_json::Error),

    #[error("Job failed on node {node}: {reason}")]
    JobFailure { node: String, reason: String },

    #[error("Artifact unavailable: {bucket}/{key}: {reason}")]
    ArtifactUnavailable {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("No {topic} completion for run {correlation_id} after {waited_secs}s")]
    EventDeliveryGap {
        topic: String,
        correlation_id: String,
        waited_secs: u64,
    },

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, BatchrelayError>;
