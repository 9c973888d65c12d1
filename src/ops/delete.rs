use crate::cluster::Router;
use crate::error::{BulkError, Result};
use crate::ops::{refused, KeyOutcome};
use crate::protocol::{Command, RespValue};

/// Removes keys. A key that is already gone counts as deleted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Delete {
    /// Reclaim memory in the background with `UNLINK`
    pub unlink: bool,
}

impl Delete {
    pub fn new(unlink: bool) -> Self {
        Self { unlink }
    }

    pub async fn apply(&self, router: &mut Router, key: &[u8]) -> Result<KeyOutcome> {
        let name = if self.unlink { "UNLINK" } else { "DEL" };
        let reply = router
            .route(&Command::new(name).arg_slice(key), key)
            .await?;
        if let Some(err) = refused(name, key, &reply)? {
            return Ok(Err(err));
        }
        match reply {
            RespValue::Integer(_) => Ok(Ok(())),
            other => Err(BulkError::protocol(name, format!("got {}", other))),
        }
    }
}
