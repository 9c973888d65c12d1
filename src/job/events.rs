//! Job events and the per-job event log.
//!
//! A job appends events to its log; any number of [`EventStream`]s read
//! it. Every stream starts from the first event, so a subscriber that
//! arrives late still sees `Started`, every `Progress`, and `Finished`, in
//! the order they were published.

use crate::job::state::{JobCounters, JobSummary};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        id: Uuid,
        operation: String,
    },
    /// Published after each batch
    Progress {
        id: Uuid,
        batch: u64,
        counters: JobCounters,
    },
    /// Always the last event
    Finished(JobSummary),
}

impl JobEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobEvent::Finished(_))
    }
}

#[derive(Debug, Default)]
struct Buffer {
    events: Vec<JobEvent>,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    buffer: Mutex<Buffer>,
    published: watch::Sender<usize>,
}

/// Append-only event log of one job.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (published, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                buffer: Mutex::new(Buffer::default()),
                published,
            }),
        }
    }

    /// Appends an event. Ignored once the log is closed.
    pub fn publish(&self, event: JobEvent) {
        let len = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.closed {
                return;
            }
            buffer.events.push(event);
            buffer.events.len()
        };
        self.inner.published.send_replace(len);
    }

    /// Marks the end of the log; streams end after draining it.
    pub fn close(&self) {
        let len = {
            let mut buffer = self.inner.buffer.lock();
            buffer.closed = true;
            buffer.events.len()
        };
        self.inner.published.send_replace(len);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            inner: Arc::clone(&self.inner),
            changes: self.inner.published.subscribe(),
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.buffer.lock().closed
    }

    /// Copy of every event so far.
    pub fn events(&self) -> Vec<JobEvent> {
        self.inner.buffer.lock().events.clone()
    }
}

/// Reader over a job's events.
#[derive(Debug)]
pub struct EventStream {
    inner: Arc<Inner>,
    changes: watch::Receiver<usize>,
    next: usize,
}

impl EventStream {
    /// The next event, waiting for it if needed. `None` after the last
    /// event of a finished job.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            {
                let buffer = self.inner.buffer.lock();
                if let Some(event) = buffer.events.get(self.next) {
                    self.next += 1;
                    return Some(event.clone());
                }
                if buffer.closed {
                    return None;
                }
            }
            // The sender lives in `inner`, which this stream keeps alive.
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    /// The next event if one is already buffered.
    pub fn try_next(&mut self) -> Option<JobEvent> {
        let buffer = self.inner.buffer.lock();
        let event = buffer.events.get(self.next).cloned();
        if event.is_some() {
            self.next += 1;
        }
        event
    }
}
