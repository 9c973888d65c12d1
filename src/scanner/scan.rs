//! Cursor-driven keyspace walk.
//!
//! ```text
//!   SCAN 0 MATCH p COUNT n ──► (cursor c1, keys…)
//!   SCAN c1 ...            ──► (cursor c2, keys…)
//!   ...
//!   SCAN ck ...            ──► (cursor 0, keys…)   node finished
//! ```
//!
//! In cluster mode every master is walked in turn, each with its own
//! cursor. The COUNT value is only a hint: a page can hold more or fewer
//! keys, including none.
//!
//! Under a stable keyspace every key is returned at least once. Keys added
//! or removed mid-scan may or may not show up, and a key may be returned
//! more than once across pages; callers must tolerate duplicates.

use crate::cluster::Router;
use crate::connection::NodeAddr;
use crate::error::{BulkError, Result};
use crate::protocol::{Command, RespValue};
use crate::scanner::types::{KeyMatch, KeyType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Magic prefix of a HyperLogLog string.
const HLL_MAGIC: &[u8] = b"HYLL";

/// What to scan for and how much to learn about each key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Glob pattern passed to `SCAN MATCH`
    pub pattern: String,

    /// `SCAN COUNT` hint
    pub count: u32,

    /// One `TYPE` per key
    pub infer_types: bool,

    /// One extra `GETRANGE` per string key to spot HyperLogLogs
    pub detect_hyperloglog: bool,

    /// One `PTTL` per key
    pub fetch_ttl: bool,

    /// One `MEMORY USAGE` per key, while the server supports it
    pub fetch_memory: bool,

    /// Namespace separator
    pub separator: String,

    /// Stop after this many keys
    pub limit: Option<u64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            pattern: "*".to_string(),
            count: 100,
            infer_types: true,
            detect_hyperloglog: false,
            fetch_ttl: false,
            fetch_memory: false,
            separator: ":".to_string(),
            limit: None,
        }
    }
}

impl ScanOptions {
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Turns off every per-key round trip.
    pub fn keys_only(mut self) -> Self {
        self.infer_types = false;
        self.detect_hyperloglog = false;
        self.fetch_ttl = false;
        self.fetch_memory = false;
        self
    }
}

/// Position of a scan on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    pub cursor: u64,
    pub pattern: String,
    pub count: u32,
    started: bool,
}

impl ScanCursor {
    pub fn new(pattern: impl Into<String>, count: u32) -> Self {
        Self {
            cursor: 0,
            pattern: pattern.into(),
            count: count.max(1),
            started: false,
        }
    }

    /// True once the server has handed back cursor 0.
    pub fn is_complete(&self) -> bool {
        self.started && self.cursor == 0
    }

    fn command(&self) -> Command {
        Command::new("SCAN")
            .arg(self.cursor.to_string())
            .arg("MATCH")
            .arg(self.pattern.clone())
            .arg("COUNT")
            .arg_int(i64::from(self.count))
    }

    fn advance(&mut self, next: u64) {
        self.started = true;
        self.cursor = next;
    }
}

/// One page of results.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub keys: Vec<KeyMatch>,
    /// No further pages
    pub done: bool,
}

/// Walks the keyspace one page at a time.
#[derive(Debug)]
pub struct Scanner {
    options: ScanOptions,
    nodes: Vec<NodeAddr>,
    node: usize,
    cursor: ScanCursor,
    returned: u64,
    pages: u64,
    done: bool,
    /// `None` until the first `MEMORY USAGE` reply
    memory_supported: Option<bool>,
    notes: Vec<String>,
}

impl Scanner {
    /// Prepares a scan over every node the router would have to visit.
    pub fn open(router: &Router, options: ScanOptions) -> Scanner {
        let nodes = router.masters();
        let cursor = ScanCursor::new(options.pattern.clone(), options.count);
        debug!(pattern = %options.pattern, nodes = nodes.len(), "Scan opened");
        Scanner {
            done: nodes.is_empty() || options.limit == Some(0),
            options,
            nodes,
            node: 0,
            cursor,
            returned: 0,
            pages: 0,
            memory_supported: None,
            notes: Vec::new(),
        }
    }

    /// Fetches and enriches the next page.
    pub async fn next_page(&mut self, router: &mut Router) -> Result<ScanPage> {
        if self.done {
            return Ok(ScanPage {
                keys: Vec::new(),
                done: true,
            });
        }

        let node = self.nodes[self.node].clone();
        let reply = router.execute_on(&node, &self.cursor.command()).await?;
        let (next, raw_keys) = parse_scan_reply(reply)?;
        self.cursor.advance(next);
        self.pages += 1;

        if self.cursor.is_complete() {
            debug!(node = %node, pages = self.pages, "Node scan finished");
            self.node += 1;
            self.cursor = ScanCursor::new(self.options.pattern.clone(), self.options.count);
            if self.node >= self.nodes.len() {
                self.done = true;
            }
        }

        let mut seen = HashSet::with_capacity(raw_keys.len());
        let mut keys: Vec<Bytes> = raw_keys
            .into_iter()
            .filter(|k| seen.insert(k.clone()))
            .collect();

        if let Some(limit) = self.options.limit {
            let room = limit.saturating_sub(self.returned) as usize;
            if keys.len() >= room {
                keys.truncate(room);
                self.done = true;
                debug!(limit, "Scan limit reached");
            }
        }

        let mut matches = Vec::with_capacity(keys.len());
        for key in keys {
            let mut m = KeyMatch::new(key, &self.options.separator);
            if self.enrich(router, &mut m).await? {
                matches.push(m);
            }
        }
        self.returned += matches.len() as u64;

        Ok(ScanPage {
            keys: matches,
            done: self.done,
        })
    }

    /// Fills in the requested details. Returns false if the key turned out
    /// to be gone.
    async fn enrich(&mut self, router: &mut Router, m: &mut KeyMatch) -> Result<bool> {
        if self.options.infer_types {
            let reply = router
                .route(&Command::new("TYPE").arg(m.key.clone()), &m.key)
                .await?;
            let name = match &reply {
                RespValue::Error(message) => return Err(BulkError::server("TYPE", message.clone())),
                other => other
                    .as_str()
                    .ok_or_else(|| BulkError::protocol("TYPE", format!("got {}", other)))?,
            };
            match KeyType::from_type_reply(name) {
                Some(t) => m.key_type = t,
                None => return Ok(false),
            }

            if self.options.detect_hyperloglog && m.key_type == KeyType::String {
                let reply = router
                    .route(
                        &Command::new("GETRANGE").arg(m.key.clone()).arg("0").arg("3"),
                        &m.key,
                    )
                    .await?;
                if reply.as_bytes().is_some_and(|b| &b[..] == HLL_MAGIC) {
                    m.key_type = KeyType::HyperLogLog;
                }
            }
        }

        if self.options.fetch_ttl {
            let reply = router
                .route(&Command::new("PTTL").arg(m.key.clone()), &m.key)
                .await?;
            match reply {
                RespValue::Integer(-2) => return Ok(false),
                RespValue::Integer(ms) => m.ttl_ms = Some(ms),
                RespValue::Error(message) => return Err(BulkError::server("PTTL", message)),
                other => return Err(BulkError::protocol("PTTL", format!("got {}", other))),
            }
        }

        if self.options.fetch_memory && self.memory_supported != Some(false) {
            let reply = router
                .route(
                    &Command::new("MEMORY").arg("USAGE").arg(m.key.clone()),
                    &m.key,
                )
                .await?;
            match reply {
                RespValue::Integer(bytes) => {
                    self.memory_supported = Some(true);
                    m.memory = u64::try_from(bytes).ok();
                }
                RespValue::Error(message) if is_unknown_command(&message) => {
                    warn!(error = %message, "MEMORY USAGE not supported, skipping memory figures");
                    self.memory_supported = Some(false);
                    self.notes.push(format!(
                        "memory usage unavailable: server rejected MEMORY USAGE ({})",
                        message
                    ));
                }
                // nil: key vanished, or another per-key refusal
                _ => {}
            }
        }

        Ok(true)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Keys handed out so far.
    pub fn keys_returned(&self) -> u64 {
        self.returned
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn cursor(&self) -> &ScanCursor {
        &self.cursor
    }

    /// Whether `MEMORY USAGE` worked; `None` if not tried yet.
    pub fn memory_supported(&self) -> Option<bool> {
        self.memory_supported
    }

    /// Capability notes gathered during the scan.
    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}

fn is_unknown_command(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unknown command") || lower.contains("unknown subcommand")
}

/// Splits a `SCAN` reply into the next cursor and the page of keys.
pub(crate) fn parse_scan_reply(reply: RespValue) -> Result<(u64, Vec<Bytes>)> {
    if let RespValue::Error(message) = reply {
        return Err(BulkError::server("SCAN", message));
    }
    let shape = || BulkError::protocol("SCAN", "expected [cursor, [keys...]]");

    let mut parts = reply.into_array().ok_or_else(shape)?;
    if parts.len() != 2 {
        return Err(shape());
    }
    let keys = parts.pop().and_then(RespValue::into_array).ok_or_else(shape)?;
    let cursor = parts
        .pop()
        .as_ref()
        .and_then(RespValue::as_str)
        .and_then(|c| c.parse::<u64>().ok())
        .ok_or_else(|| BulkError::protocol("SCAN", "cursor is not an unsigned integer"))?;

    let keys = keys
        .into_iter()
        .map(|k| match k {
            RespValue::BulkString(b) => Ok(b),
            other => Err(BulkError::protocol("SCAN", format!("key is not a bulk string: {}", other))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((cursor, keys))
}
