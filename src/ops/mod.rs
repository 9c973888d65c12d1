//! Bulk Operations
//!
//! What a job does to each matched key. Every operation reports on two
//! levels:
//!
//! - the outer `Result` carries job-aborting failures (connection loss,
//!   timeouts, redirect exhaustion) and is propagated with `?`
//! - the inner [`KeyOutcome`] says whether this one key succeeded; a
//!   refusal such as `WRONGTYPE` or `BUSYKEY` only fails the key
//!
//! ## Operations
//!
//! | Operation  | Source      | Commands                                   |
//! |------------|-------------|--------------------------------------------|
//! | [`Delete`] | scan / list | `DEL` or `UNLINK`                          |
//! | [`SetTtl`] | scan / list | `EXPIRE`                                   |
//! | [`CopyKeys`] | scan / list | `DUMP` + `PTTL`, then `RESTORE ... REPLACE` |
//! | [`Import`] | RDB file    | `SELECT`, `RESTORE ... REPLACE [ABSTTL]`   |

pub mod copy;
pub mod delete;
pub mod import;
pub mod ttl;

pub use copy::CopyKeys;
pub use delete::Delete;
pub use import::Import;
pub use ttl::SetTtl;

use crate::cluster::Router;
use crate::error::{BulkError, PerKeyError, Result};
use crate::protocol::RespValue;

/// Result of applying an operation to one key.
pub type KeyOutcome = std::result::Result<(), PerKeyError>;

/// The operations that work on key names coming from a scan or a list.
#[derive(Debug)]
pub enum KeyOperation {
    Delete(Delete),
    SetTtl(SetTtl),
    Copy(CopyKeys),
}

impl KeyOperation {
    /// Applies the operation to one key on the source.
    pub async fn apply(&mut self, source: &mut Router, key: &[u8]) -> Result<KeyOutcome> {
        match self {
            KeyOperation::Delete(op) => op.apply(source, key).await,
            KeyOperation::SetTtl(op) => op.apply(source, key).await,
            KeyOperation::Copy(op) => op.apply(source, key).await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeyOperation::Delete(_) => "delete",
            KeyOperation::SetTtl(_) => "ttl",
            KeyOperation::Copy(_) => "copy",
        }
    }
}

/// Error kinds that say the server (not the key) cannot be used.
const SERVER_WIDE_ERRORS: &[&str] = &[
    "NOAUTH",
    "WRONGPASS",
    "LOADING",
    "MASTERDOWN",
    "CLUSTERDOWN",
];

/// Turns an error reply into a per-key failure, or into a job-level
/// [`BulkError::Server`] when the refusal covers the whole server.
pub(crate) fn refused(
    command: &str,
    key: &[u8],
    reply: &RespValue,
) -> Result<Option<PerKeyError>> {
    match reply {
        RespValue::Error(message) => {
            if reply
                .error_kind()
                .is_some_and(|kind| SERVER_WIDE_ERRORS.contains(&kind))
            {
                return Err(BulkError::server(command, message.clone()));
            }
            Ok(Some(PerKeyError::new(key, message.clone())))
        }
        _ => Ok(None),
    }
}
