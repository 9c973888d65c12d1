use crate::cluster::Router;
use crate::error::{BulkError, PerKeyError, Result};
use crate::ops::{refused, KeyOutcome};
use crate::protocol::{Command, RespValue};

/// Sets a relative expiry in seconds.
#[derive(Debug, Clone, Copy)]
pub struct SetTtl {
    pub seconds: u64,
}

impl SetTtl {
    pub fn new(seconds: u64) -> Self {
        Self { seconds }
    }

    pub async fn apply(&self, router: &mut Router, key: &[u8]) -> Result<KeyOutcome> {
        let seconds = i64::try_from(self.seconds).unwrap_or(i64::MAX);
        let reply = router
            .route(&Command::new("EXPIRE").arg_slice(key).arg_int(seconds), key)
            .await?;
        if let Some(err) = refused("EXPIRE", key, &reply)? {
            return Ok(Err(err));
        }
        match reply {
            RespValue::Integer(1) => Ok(Ok(())),
            RespValue::Integer(0) => Ok(Err(PerKeyError::new(key, "key no longer exists"))),
            other => Err(BulkError::protocol("EXPIRE", format!("got {}", other))),
        }
    }
}
