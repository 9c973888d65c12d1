//! Error taxonomy for bulk jobs.
//!
//! Each layer owns its error enum ([`ConnectionError`], [`FormatError`],
//! [`ConfigError`]); [`BulkError`] folds them into the set of conditions
//! that abort a job. Failures that only affect a single key are a separate
//! type, [`PerKeyError`], and never abort anything.

use crate::connection::ConnectionError;
use crate::job::ConfigError;
use crate::rdb::FormatError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A job-aborting failure.
#[derive(Debug, Error)]
pub enum BulkError {
    /// Invalid job parameters
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket, auth, or timeout failure
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The server answered with a reply of the wrong shape
    #[error("unexpected reply to {command}: {detail}")]
    Protocol { command: String, detail: String },

    /// The server refused a job-level command (SCAN, SELECT, CLUSTER SLOTS)
    #[error("server error on {command}: {message}")]
    Server { command: String, message: String },

    /// The cluster kept redirecting the same command
    #[error("cluster redirects did not settle for slot {slot} (last node {node})")]
    RedirectExhausted { slot: u16, node: String },

    /// The RDB file could not be decoded
    #[error("rdb format error: {0}")]
    Format(#[from] FormatError),
}

impl BulkError {
    pub(crate) fn protocol(command: &str, detail: impl Into<String>) -> Self {
        BulkError::Protocol {
            command: command.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn server(command: &str, message: impl Into<String>) -> Self {
        BulkError::Server {
            command: command.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for job-level operations.
pub type Result<T> = std::result::Result<T, BulkError>;

/// A failure confined to one key. Recorded in the job's error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{key}: {message}")]
pub struct PerKeyError {
    /// Key name, lossily decoded for display
    pub key: String,
    pub message: String,
}

impl PerKeyError {
    pub fn new(key: &[u8], message: impl Into<String>) -> Self {
        Self {
            key: String::from_utf8_lossy(key).into_owned(),
            message: message.into(),
        }
    }
}
