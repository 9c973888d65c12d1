//! Key descriptions produced by a scan.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical type of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    String,
    List,
    Set,
    ZSet,
    Hash,
    Stream,
    /// A string carrying the `HYLL` header
    HyperLogLog,
    /// Not inferred, or a module type
    Unknown,
}

impl KeyType {
    /// Parses a `TYPE` reply. `none` (key gone) is `None`.
    pub fn from_type_reply(reply: &str) -> Option<Self> {
        Some(match reply.to_ascii_lowercase().as_str() {
            "none" => return None,
            "string" => KeyType::String,
            "list" => KeyType::List,
            "set" => KeyType::Set,
            "zset" => KeyType::ZSet,
            "hash" => KeyType::Hash,
            "stream" => KeyType::Stream,
            _ => KeyType::Unknown,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::List => "list",
            KeyType::Set => "set",
            KeyType::ZSet => "zset",
            KeyType::Hash => "hash",
            KeyType::Stream => "stream",
            KeyType::HyperLogLog => "hyperloglog",
            KeyType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One key returned by the scanner, with whatever enrichment was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMatch {
    pub key: Bytes,
    /// `Unknown` unless type inference is on
    pub key_type: KeyType,
    /// Raw `PTTL` reply in milliseconds (`-1` means no expiry)
    pub ttl_ms: Option<i64>,
    /// `MEMORY USAGE` in bytes
    pub memory: Option<u64>,
    /// Key prefix up to and including the last separator
    pub namespace: Option<Bytes>,
}

impl KeyMatch {
    /// A bare match with only the namespace filled in.
    pub fn new(key: Bytes, separator: &str) -> Self {
        let namespace = namespace_of(&key, separator).map(|ns| key.slice(..ns.len()));
        Self {
            key,
            key_type: KeyType::Unknown,
            ttl_ms: None,
            memory: None,
            namespace,
        }
    }

    pub fn key_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}

/// The prefix of `key` up to and including the last `separator`.
///
/// `None` when the separator is empty or does not occur in the key.
pub fn namespace_of<'a>(key: &'a [u8], separator: &str) -> Option<&'a [u8]> {
    let sep = separator.as_bytes();
    if sep.is_empty() || key.len() < sep.len() {
        return None;
    }
    let last = key.windows(sep.len()).rposition(|w| w == sep)?;
    Some(&key[..last + sep.len()])
}
