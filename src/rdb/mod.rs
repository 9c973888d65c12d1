//! RDB Decoder Module
//!
//! Streams entries out of a Redis persistence file without materializing
//! values. Every entry comes with a ready-to-send `RESTORE` payload, so an
//! import never needs to understand the value encodings beyond finding
//! where each value ends.
//!
//! ## File Layout
//!
//! ```text
//! ┌────────────┬───────────────────────────────────────────┬─────┬──────────┐
//! │ REDIS0011  │ AUX* (SELECTDB RESIZEDB? (EXPIRE? KV)*)*   │ EOF │ CRC64 LE │
//! └────────────┴───────────────────────────────────────────┴─────┴──────────┘
//!
//! RESTORE payload built for each KV:
//! ┌───────────┬─────────────────────┬──────────────┬──────────────────┐
//! │ type byte │ value bytes (as-is) │ version u16  │ CRC64 of the rest│
//! └───────────┴─────────────────────┴──────────────┴──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `decoder`: the streaming [`RdbDecoder`]
//! - `crc64`: the Jones CRC64 used for file and payload checksums
//! - `lzf`: decompression for LZF-compressed key names

pub mod crc64;
pub mod decoder;
pub mod lzf;

pub use decoder::RdbDecoder;

use crate::scanner::KeyType;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest RDB version accepted.
pub const MIN_RDB_VERSION: u32 = 1;

/// Highest RDB version accepted (Redis 7.4).
pub const MAX_RDB_VERSION: u32 = 12;

/// Errors raised while decoding an RDB file. Any of them ends the import.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Could not open or read the file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an RDB file (bad magic)")]
    BadMagic,

    #[error("unsupported RDB version {0}")]
    UnsupportedVersion(u32),

    /// The file ended inside a record
    #[error("unexpected end of file at offset {offset}")]
    UnexpectedEof { offset: u64 },

    /// A length or encoding prefix is not valid where it appears
    #[error("invalid encoding at offset {offset}: {detail}")]
    InvalidEncoding { offset: u64, detail: String },

    /// A value type or opcode this decoder cannot walk
    #[error("unsupported {what} 0x{byte:02x} at offset {offset}")]
    Unsupported {
        what: &'static str,
        byte: u8,
        offset: u64,
    },

    #[error("LZF decompression failed: {0}")]
    Lzf(String),

    #[error("checksum mismatch: file says {expected:016x}, computed {actual:016x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("file ends without a checksum")]
    MissingChecksum,

    /// `next_entry` was called after an earlier error
    #[error("decoder already failed")]
    Exhausted,
}

/// Decoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdbOptions {
    /// Fail on a missing or mismatched trailing checksum instead of
    /// logging a warning
    pub strict_checksum: bool,
}

impl Default for RdbOptions {
    fn default() -> Self {
        Self {
            strict_checksum: false,
        }
    }
}

/// Value type byte of a key/value record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RdbValueType {
    String,
    List,
    Set,
    ZSet,
    Hash,
    ZSet2,
    Module2,
    HashZipmap,
    ListZiplist,
    SetIntset,
    ZSetZiplist,
    HashZiplist,
    ListQuicklist,
    StreamListpacks,
    HashListpack,
    ZSetListpack,
    ListQuicklist2,
    StreamListpacks2,
    SetListpack,
    StreamListpacks3,
}

impl RdbValueType {
    /// Maps a type byte; `None` for opcodes and types this decoder cannot
    /// walk.
    pub fn from_byte(byte: u8) -> Option<Self> {
        use RdbValueType::*;
        Some(match byte {
            0 => String,
            1 => List,
            2 => Set,
            3 => ZSet,
            4 => Hash,
            5 => ZSet2,
            7 => Module2,
            9 => HashZipmap,
            10 => ListZiplist,
            11 => SetIntset,
            12 => ZSetZiplist,
            13 => HashZiplist,
            14 => ListQuicklist,
            15 => StreamListpacks,
            16 => HashListpack,
            17 => ZSetListpack,
            18 => ListQuicklist2,
            19 => StreamListpacks2,
            20 => SetListpack,
            21 => StreamListpacks3,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        use RdbValueType::*;
        match self {
            String => 0,
            List => 1,
            Set => 2,
            ZSet => 3,
            Hash => 4,
            ZSet2 => 5,
            Module2 => 7,
            HashZipmap => 9,
            ListZiplist => 10,
            SetIntset => 11,
            ZSetZiplist => 12,
            HashZiplist => 13,
            ListQuicklist => 14,
            StreamListpacks => 15,
            HashListpack => 16,
            ZSetListpack => 17,
            ListQuicklist2 => 18,
            StreamListpacks2 => 19,
            SetListpack => 20,
            StreamListpacks3 => 21,
        }
    }

    /// The logical key type the value restores to.
    pub fn key_type(self) -> KeyType {
        use RdbValueType::*;
        match self {
            String => KeyType::String,
            List | ListZiplist | ListQuicklist | ListQuicklist2 => KeyType::List,
            Set | SetIntset | SetListpack => KeyType::Set,
            ZSet | ZSet2 | ZSetZiplist | ZSetListpack => KeyType::ZSet,
            Hash | HashZipmap | HashZiplist | HashListpack => KeyType::Hash,
            StreamListpacks | StreamListpacks2 | StreamListpacks3 => KeyType::Stream,
            Module2 => KeyType::Unknown,
        }
    }
}

/// One key/value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdbEntry {
    /// Database selected when the record was read
    pub db: u32,
    pub key: Bytes,
    pub value_type: RdbValueType,
    /// `RESTORE`-ready serialized value
    pub payload: Bytes,
    /// Absolute expiry, unix milliseconds
    pub expire_at_ms: Option<u64>,
}

impl RdbEntry {
    /// True if the entry's expiry is at or before `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expire_at_ms.is_some_and(|at| at <= now_ms)
    }

    pub fn key_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}
