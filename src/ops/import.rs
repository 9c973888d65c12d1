use crate::cluster::Router;
use crate::error::{BulkError, PerKeyError, Result};
use crate::ops::{refused, KeyOutcome};
use crate::protocol::Command;
use crate::rdb::RdbEntry;
use tracing::trace;

/// Replays RDB entries into a server with `RESTORE`.
#[derive(Debug)]
pub struct Import {
    destination: Router,
    /// Restore everything into this database instead of the entry's own
    target_db: Option<u32>,
}

impl Import {
    pub fn new(destination: Router, target_db: Option<u32>) -> Self {
        Self {
            destination,
            target_db,
        }
    }

    /// Database an entry lands in.
    pub fn database_for(&self, entry: &RdbEntry) -> u32 {
        self.target_db.unwrap_or(entry.db)
    }

    pub async fn apply(&mut self, entry: &RdbEntry) -> Result<KeyOutcome> {
        let key = &entry.key[..];
        let db = self.database_for(entry);

        if self.destination.current_db() != db {
            if self.destination.is_cluster() {
                return Ok(Err(PerKeyError::new(
                    key,
                    format!("entry belongs to database {}, clusters only have database 0", db),
                )));
            }
            match self.destination.select(db).await {
                Ok(()) => {}
                Err(BulkError::Server { message, .. }) => {
                    return Ok(Err(PerKeyError::new(key, message)))
                }
                Err(e) => return Err(e),
            }
        }

        let mut restore = Command::new("RESTORE").arg(entry.key.clone());
        restore = match entry.expire_at_ms {
            Some(at) => restore
                .arg_int(i64::try_from(at).unwrap_or(i64::MAX))
                .arg(entry.payload.clone())
                .arg("REPLACE")
                .arg("ABSTTL"),
            None => restore.arg_int(0).arg(entry.payload.clone()).arg("REPLACE"),
        };

        trace!(key = %entry.key_lossy(), db, "Restoring entry");
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
