//! Job state machine, counters, and the bounded error log.

use crate::error::PerKeyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a job.
///
/// ```text
///   Pending ──► Running ──┬──► Completed
///                         ├──► CompletedWithErrors
///                         ├──► Failed
///                         └──► Cancelled
/// ```
///
/// Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }

    /// Whether the machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            JobState::Pending => next == JobState::Running,
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::CompletedWithErrors => "completed with errors",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Progress counters.
///
/// `matched` counts keys that passed every filter, `processed` counts the
/// ones the operation was run on (or would have been, in a dry run), and
/// `succeeded + failed == processed` outside dry runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub matched: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Keeps the first `capacity` per-key errors in order and counts the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLog {
    capacity: usize,
    entries: Vec<PerKeyError>,
    dropped: u64,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity.min(1024)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, error: PerKeyError) {
        if self.entries.len() < self.capacity {
            self.entries.push(error);
        } else {
            self.dropped += 1;
        }
    }

    pub fn entries(&self) -> &[PerKeyError] {
        &self.entries
    }

    /// Errors seen but not kept.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn total(&self) -> u64 {
        self.entries.len() as u64 + self.dropped
    }
}

/// Everything known about a job at one point in time. The last event of
/// every job carries one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub operation: String,
    pub state: JobState,
    pub counters: JobCounters,
    /// First per-key errors, in order
    pub errors: Vec<PerKeyError>,
    /// Per-key errors beyond the log capacity
    pub errors_dropped: u64,
    /// Why the job failed
    pub failure: Option<String>,
    pub dry_run: bool,
    /// Keys a dry run would have touched (capped)
    pub affected_keys: Vec<String>,
    /// Capability gaps and other remarks
    pub notes: Vec<String>,
    pub elapsed_ms: u64,
}
