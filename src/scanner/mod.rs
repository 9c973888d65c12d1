//! Key Scanner Module
//!
//! Enumerates keys matching a glob pattern with `SCAN`, never `KEYS`, so a
//! scan of a huge keyspace costs the server one bounded step per page and
//! the client one page of memory.
//!
//! ## Enrichment Cost
//!
//! Every detail beyond the key name is one more round trip per key:
//!
//! | Option               | Command              |
//! |----------------------|----------------------|
//! | `infer_types`        | `TYPE`               |
//! | `detect_hyperloglog` | `GETRANGE key 0 3`   |
//! | `fetch_ttl`          | `PTTL`               |
//! | `fetch_memory`       | `MEMORY USAGE`       |
//!
//! Bulk operations only need names, so jobs scan with
//! [`ScanOptions::keys_only`] unless the caller asks for more.

pub mod scan;
pub mod types;

pub use scan::{ScanCursor, ScanOptions, ScanPage, Scanner};
pub use types::{namespace_of, KeyMatch, KeyType};
