use crate::cluster::Router;
use crate::error::{BulkError, PerKeyError, Result};
use crate::ops::{refused, KeyOutcome};
use crate::protocol::{Command, RespValue};
use bytes::Bytes;
use tracing::trace;

/// Copies keys to another server or database with `DUMP`/`RESTORE`.
///
/// The destination is a router of its own, so source and destination
/// never share a connection. The remaining TTL travels with the key.
#[derive(Debug)]
pub struct CopyKeys {
    destination: Router,
    /// Overwrite keys that already exist on the destination
    replace: bool,
}

impl CopyKeys {
    pub fn new(destination: Router) -> Self {
        Self {
            destination,
            replace: true,
        }
    }

    pub fn with_replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn destination(&self) -> &Router {
        &self.destination
    }

    pub async fn apply(&mut self, source: &mut Router, key: &[u8]) -> Result<KeyOutcome> {
        let reply = source
            .route(&Command::new("DUMP").arg_slice(key), key)
            .await?;
        if let Some(err) = refused("DUMP", key, &reply)? {
            return Ok(Err(err));
        }
        let payload: Bytes = match reply {
            RespValue::BulkString(payload) => payload,
            RespValue::Null => return Ok(Err(PerKeyError::new(key, "key no longer exists"))),
            other => return Err(BulkError::protocol("DUMP", format!("got {}", other))),
        };

        let reply = source
            .route(&Command::new("PTTL").arg_slice(key), key)
            .await?;
        if let Some(err) = refused("PTTL", key, &reply)? {
            return Ok(Err(err));
        }
        let ttl_ms = match reply {
            RespValue::Integer(-2) => {
                return Ok(Err(PerKeyError::new(key, "key expired while being copied")))
            }
            RespValue::Integer(ms) if ms < 0 => 0,
            RespValue::Integer(ms) => ms,
            other => return Err(BulkError::protocol("PTTL", format!("got {}", other))),
        };

        trace!(key = %String::from_utf8_lossy(key), ttl_ms, bytes = payload.len(), "Copying key");
        let mut restore = Command::new("RESTORE")
            .arg_slice(key)
            .arg_int(ttl_ms)
            .arg(payload);
        if self.replace {
            restore = restore.arg("REPLACE");
        }

        let reply = self.destination.route(&restore, key).await?;
        if let Some(err) = refused("RESTORE", key, &reply)? {
            return Ok(Err(err));
        }
        if reply.is_ok() {
            Ok(Ok(()))
        } else {
            Err(BulkError::protocol("RESTORE", format!("got {}", reply)))
        }
    }
}
