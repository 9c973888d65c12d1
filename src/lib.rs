//! # keysweep - Bulk Key Management for Redis
//!
//! keysweep finds keys on a Redis deployment (standalone or cluster) and
//! applies one operation to all of them as a trackable job: delete, set a
//! TTL, copy to another server, or import from an RDB file.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              keysweep                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ Coordinator │───>│  Job task   │───>│ Operation   │                  │
//! │  │  (submit)   │    │ (batching)  │    │ DEL/EXPIRE/ │                  │
//! │  └──────┬──────┘    └──┬───────┬──┘    │ RESTORE     │                  │
//! │         │              │       │       └──────┬──────┘                  │
//! │         ▼              ▼       ▼              ▼                         │
//! │  ┌─────────────┐  ┌─────────┐ ┌──────────┐  ┌──────────────────────┐   │
//! │  │  EventLog   │  │ Scanner │ │   RDB    │  │        Router        │   │
//! │  │ (progress)  │  │ (SCAN)  │ │ decoder  │  │ slots, MOVED / ASK   │   │
//! │  └─────────────┘  └────┬────┘ └──────────┘  └──────────┬───────────┘   │
//! │                        └──────────────────────────────>│               │
//! │                                                         ▼               │
//! │                                          ┌──────────────────────────┐   │
//! │                                          │ Connection (RESP, tokio) │   │
//! │                                          └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use keysweep::{ConnectionDescriptor, Coordinator, JobConfig, OperationConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = Coordinator::new();
//!     let config = JobConfig::scan(
//!         ConnectionDescriptor::new("127.0.0.1", 6379),
//!         "session:*",
//!         OperationConfig::SetTtl { seconds: 3600 },
//!     );
//!
//!     let job = coordinator.submit(config).unwrap();
//!     let mut events = job.subscribe();
//!     while let Some(event) = events.next().await {
//!         println!("{}", serde_json::to_string(&event).unwrap());
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP values, the streaming parser and command encoding
//! - [`connection`]: one TCP connection to one node, with AUTH and SELECT
//! - [`cluster`]: hash slots, topology and the redirect-following [`Router`]
//! - [`scanner`]: cursor-driven SCAN with type, TTL and namespace detection
//! - [`rdb`]: the streaming RDB decoder producing `RESTORE` payloads
//! - [`ops`]: the per-key operations
//! - [`job`]: configuration, the coordinator, states and events
//! - [`error`]: the crate-level error type
//!
//! ## Design Highlights
//!
//! ### One Task Per Job
//!
//! A job owns its connections and runs as a single tokio task, so commands
//! on a connection are strictly request/response. Handles observe the job
//! through a shared status and an append-only event log.
//!
//! ### Bounded Memory
//!
//! Keys are processed a page or batch at a time, RDB values are passed
//! through as opaque payloads, and per-key errors are capped.

pub mod cluster;
pub mod connection;
pub mod error;
pub mod job;
pub mod ops;
pub mod protocol;
pub mod rdb;
pub mod scanner;


// Re-export commonly used types for convenience
pub use cluster::{Router, TopologyCache};
pub use connection::{Connection, ConnectionDescriptor, Credentials, NodeAddr};
pub use error::{BulkError, PerKeyError, Result};
pub use job::{
    Coordinator, JobConfig, JobCounters, JobEvent, JobHandle, JobState, JobSummary,
    OperationConfig,
};
pub use protocol::{Command, ParseError, RespParser, RespValue};
pub use rdb::{RdbDecoder, RdbEntry, RdbOptions};
pub use scanner::{KeyMatch, KeyType, ScanOptions, Scanner};

/// The default Redis port
pub const DEFAULT_PORT: u16 = 6379;

/// The default Redis host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of keysweep
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Milliseconds since the unix epoch, as Redis counts absolute expiries.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
