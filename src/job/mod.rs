//! Bulk Operation Coordinator
//!
//! Turns a [`JobConfig`] into a running job and reports on it.
//!
//! ## Lifecycle
//!
//! ```text
//!  submit(config) ── validate ──► JobHandle
//!                                   │
//!              ┌────────────────────┘
//!              ▼
//!   ┌──────────────────────┐   Started
//!   │ connect source/dest  │──────────────►┐
//!   └──────────┬───────────┘               │
//!              ▼                           │
//!   ┌──────────────────────┐   Progress    │   EventStream
//!   │ batch: filter, apply │──────────────►├──────────────► subscribers
//!   └──────────┬───────────┘  (per batch)  │
//!              ▼                           │
//!   ┌──────────────────────┐   Finished    │
//!   │   terminal state     │──────────────►┘
//!   └──────────────────────┘
//! ```
//!
//! Cancellation is checked between batches, so a cancelled job always
//! finishes the batch it was working on.

pub mod config;
pub mod coordinator;
pub mod events;
pub mod state;

pub use config::{
    ConfigError, JobConfig, OperationConfig, DEFAULT_BATCH_SIZE, DEFAULT_ERROR_LOG_CAPACITY,
    DEFAULT_PREVIEW_LIMIT,
};
pub use coordinator::{Coordinator, JobHandle};
pub use events::{EventLog, EventStream, JobEvent};
pub use state::{ErrorLog, JobCounters, JobState, JobSummary};
