//! Job submission and the job task.
//!
//! Every job runs as one tokio task that owns its routers. The task is the
//! only writer of the job's status; handles read it under a short lock.

use crate::cluster::{Router, SharedTopology, TopologyCache};
use crate::connection::ConnectionDescriptor;
use crate::error::Result;
use crate::job::config::{ConfigError, JobConfig, OperationConfig};
use crate::job::events::{EventLog, EventStream, JobEvent};
use crate::job::state::{ErrorLog, JobCounters, JobState, JobSummary};
use crate::ops::{CopyKeys, Delete, Import, KeyOperation, KeyOutcome, SetTtl};
use crate::rdb::{RdbDecoder, RdbEntry, RdbOptions};
use crate::scanner::Scanner;
use bytes::Bytes;
use parking_lot::Mutex;
use regex::bytes::Regex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Starts jobs.
///
/// Jobs submitted through the same coordinator share cluster topology
/// tables, keyed by the first seed of each cluster.
#[derive(Debug, Default)]
pub struct Coordinator {
    topologies: TopologyCache,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `config` and spawns the job on the current runtime.
    ///
    /// A rejected configuration creates no job.
    pub fn submit(&self, config: JobConfig) -> std::result::Result<JobHandle, ConfigError> {
        let filter = config.validate()?;

        let source_topology = self.topology_for(&config.connection);
        let destination_topology = match &config.operation {
            OperationConfig::Copy {
                destination: Some(destination),
                ..
            } => self.topology_for(destination),
            _ => None,
        };

        let job = Arc::new(JobShared::new(&config));
        info!(
            job = %job.id,
            operation = job.operation,
            dry_run = config.dry_run,
            "Job submitted"
        );

        let task = JobTask {
            job: Arc::clone(&job),
            config,
            filter,
            source_topology,
            destination_topology,
        };
        tokio::spawn(task.run());

        Ok(JobHandle { job })
    }

    /// Submits a job and waits for it to finish.
    pub async fn run(&self, config: JobConfig) -> std::result::Result<JobSummary, ConfigError> {
        let handle = self.submit(config)?;
        Ok(handle.wait().await)
    }

    fn topology_for(&self, descriptor: &ConnectionDescriptor) -> Option<SharedTopology> {
        descriptor
            .cluster
            .then(|| self.topologies.get_or_create(&descriptor.address()))
    }
}

/// A submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job: Arc<JobShared>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.job.id
    }

    pub fn state(&self) -> JobState {
        self.job.status.lock().state
    }

    /// Asks the job to stop. The batch in flight still completes.
    pub fn cancel(&self) {
        if !self.job.cancelled.swap(true, Ordering::SeqCst) {
            info!(job = %self.job.id, "Cancellation requested");
        }
    }

    /// Events of this job from the first one on.
    pub fn subscribe(&self) -> EventStream {
        self.job.events.subscribe()
    }

    /// Current counters and state.
    pub fn snapshot(&self) -> JobSummary {
        self.job.summary()
    }

    /// Waits for the job to reach a terminal state.
    pub async fn wait(&self) -> JobSummary {
        let mut events = self.subscribe();
        while let Some(event) = events.next().await {
            if let JobEvent::Finished(summary) = event {
                return summary;
            }
        }
        self.snapshot()
    }
}

#[derive(Debug)]
struct Status {
    state: JobState,
    counters: JobCounters,
    errors: ErrorLog,
    affected_keys: Vec<String>,
    notes: Vec<String>,
    failure: Option<String>,
    elapsed: Option<Duration>,
}

#[derive(Debug)]
struct JobShared {
    id: Uuid,
    operation: &'static str,
    dry_run: bool,
    preview_limit: usize,
    started: Instant,
    cancelled: AtomicBool,
    status: Mutex<Status>,
    events: EventLog,
}

impl JobShared {
    fn new(config: &JobConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: config.operation.name(),
            dry_run: config.dry_run,
            preview_limit: config.preview_limit,
            started: Instant::now(),
            cancelled: AtomicBool::new(false),
            status: Mutex::new(Status {
                state: JobState::Pending,
                counters: JobCounters::default(),
                errors: ErrorLog::new(config.error_log_capacity),
                affected_keys: Vec::new(),
                notes: Vec::new(),
                failure: None,
                elapsed: None,
            }),
            events: EventLog::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Moves to `next` if the state machine allows it.
    fn transition(&self, next: JobState) -> bool {
        let mut status = self.status.lock();
        if !status.state.can_transition_to(next) {
            debug!(job = %self.id, from = %status.state, to = %next, "Ignoring state change");
            return false;
        }
        status.state = next;
        if next.is_terminal() {
            status.elapsed = Some(self.started.elapsed());
        }
        true
    }

    /// Counts a key that passed every filter. In a dry run it also counts
    /// as processed.
    fn record_match(&self, key: &[u8]) {
        let mut status = self.status.lock();
        status.counters.matched += 1;
        if self.dry_run {
            status.counters.processed += 1;
            if status.affected_keys.len() < self.preview_limit {
                status
                    .affected_keys
                    .push(String::from_utf8_lossy(key).into_owned());
            }
        }
    }

    fn record_outcome(&self, outcome: KeyOutcome) {
        let mut status = self.status.lock();
        status.counters.processed += 1;
        match outcome {
            Ok(()) => status.counters.succeeded += 1,
            Err(err) => {
                status.counters.failed += 1;
                status.errors.push(err);
            }
        }
    }

    fn note(&self, note: impl Into<String>) {
        self.status.lock().notes.push(note.into());
    }

    fn counters(&self) -> JobCounters {
        self.status.lock().counters
    }

    fn summary(&self) -> JobSummary {
        let status = self.status.lock();
        let elapsed = status.elapsed.unwrap_or_else(|| self.started.elapsed());
        JobSummary {
            id: self.id,
            operation: self.operation.to_string(),
            state: status.state,
            counters: status.counters,
            errors: status.errors.entries().to_vec(),
            errors_dropped: status.errors.dropped(),
            failure: status.failure.clone(),
            dry_run: self.dry_run,
            affected_keys: status.affected_keys.clone(),
            notes: status.notes.clone(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Enters the terminal state and publishes the final event.
    fn finish(&self, state: JobState, failure: Option<String>) {
        if failure.is_some() {
            self.status.lock().failure = failure;
        }
        if !self.transition(state) {
            return;
        }
        let summary = self.summary();
        info!(
            job = %self.id,
            state = %summary.state,
            matched = summary.counters.matched,
            processed = summary.counters.processed,
            succeeded = summary.counters.succeeded,
            failed = summary.counters.failed,
            elapsed_ms = summary.elapsed_ms,
            "Job finished"
        );
        self.events.publish(JobEvent::Finished(summary));
        self.events.close();
    }
}

/// Fails the job if its task ends without reaching a terminal state.
struct FinishGuard(Arc<JobShared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if !self.0.status.lock().state.is_terminal() {
            error!(job = %self.0.id, "Job task ended unexpectedly");
            self.0
                .finish(JobState::Failed, Some("job task ended unexpectedly".to_string()));
        }
    }
}

/// Where the job stopped pulling keys.
enum Ending {
    Exhausted,
    Cancelled,
}

/// Keys for operations that work on names.
enum KeySource {
    Scan(Scanner),
    List {
        keys: Vec<Bytes>,
        next: usize,
        batch_size: usize,
    },
}

impl KeySource {
    async fn next_batch(&mut self, router: &mut Router) -> Result<Option<Vec<Bytes>>> {
        match self {
            KeySource::Scan(scanner) => {
                if scanner.is_done() {
                    return Ok(None);
                }
                let page = scanner.next_page(router).await?;
                Ok(Some(page.keys.into_iter().map(|m| m.key).collect()))
            }
            KeySource::List {
                keys,
                next,
                batch_size,
            } => {
                if *next >= keys.len() {
                    return Ok(None);
                }
                let end = (*next + *batch_size).min(keys.len());
                let batch = keys[*next..end].to_vec();
                *next = end;
                Ok(Some(batch))
            }
        }
    }

    fn notes(&self) -> Vec<String> {
        match self {
            KeySource::Scan(scanner) => scanner.notes().to_vec(),
            KeySource::List { .. } => Vec::new(),
        }
    }
}

struct JobTask {
    job: Arc<JobShared>,
    config: JobConfig,
    filter: Option<Regex>,
    source_topology: Option<SharedTopology>,
    destination_topology: Option<SharedTopology>,
}

impl JobTask {
    async fn run(self) {
        let guard = FinishGuard(Arc::clone(&self.job));
        let job = Arc::clone(&self.job);

        job.transition(JobState::Running);
        job.events.publish(JobEvent::Started {
            id: job.id,
            operation: job.operation.to_string(),
        });
        info!(
            job = %job.id,
            operation = job.operation,
            server = %self.config.connection.address(),
            "Job started"
        );

        match self.execute().await {
            Ok(Ending::Exhausted) => {
                let state = if job.counters().failed > 0 {
                    JobState::CompletedWithErrors
                } else {
                    JobState::Completed
                };
                job.finish(state, None);
            }
            Ok(Ending::Cancelled) => {
                info!(job = %job.id, "Job cancelled");
                job.finish(JobState::Cancelled, None);
            }
            Err(e) => {
                error!(job = %job.id, error = %e, "Job failed");
                job.finish(JobState::Failed, Some(e.to_string()));
            }
        }
        drop(guard);
    }

    async fn execute(&self) -> Result<Ending> {
        match &self.config.operation {
            OperationConfig::Delete { unlink } => {
                let mut source = self.connect_source().await?;
                let op = KeyOperation::Delete(Delete::new(*unlink));
                self.apply_to_keys(&mut source, op).await
            }
            OperationConfig::SetTtl { seconds } => {
                let mut source = self.connect_source().await?;
                let op = KeyOperation::SetTtl(SetTtl::new(seconds.unsigned_abs()));
                self.apply_to_keys(&mut source, op).await
            }
            OperationConfig::Copy {
                destination,
                replace,
            } => {
                let mut source = self.connect_source().await?;
                let destination = destination
                    .as_ref()
                    .ok_or(ConfigError::MissingDestination)?;
                let destination = self.connect(destination, &self.destination_topology).await?;
                let op = KeyOperation::Copy(CopyKeys::new(destination).with_replace(*replace));
                self.apply_to_keys(&mut source, op).await
            }
            OperationConfig::Import {
                path,
                db_filter,
                target_db,
                rdb,
            } => self.import(path, *db_filter, *target_db, rdb).await,
        }
    }

    async fn connect_source(&self) -> Result<Router> {
        self.connect(&self.config.connection, &self.source_topology).await
    }

    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        topology: &Option<SharedTopology>,
    ) -> Result<Router> {
        match topology {
            Some(topology) => Router::connect_shared(descriptor, Arc::clone(topology)).await,
            None => Router::connect(descriptor).await,
        }
    }

    async fn apply_to_keys(&self, source: &mut Router, mut op: KeyOperation) -> Result<Ending> {
        let job = &self.job;
        let mut keys = if self.config.keys.is_empty() {
            KeySource::Scan(Scanner::open(source, self.config.scan_options()))
        } else {
            KeySource::List {
                keys: self
                    .config
                    .keys
                    .iter()
                    .map(|k| Bytes::copy_from_slice(k.as_bytes()))
                    .collect(),
                next: 0,
                batch_size: self.config.batch_size,
            }
        };

        let mut batch_no = 0;
        let ending = loop {
            if job.is_cancelled() {
                break Ending::Cancelled;
            }
            let Some(batch) = keys.next_batch(source).await? else {
                break Ending::Exhausted;
            };
            batch_no += 1;

            for key in batch {
                if !self.matches(&key) {
                    continue;
                }
                job.record_match(&key);
                if self.config.dry_run {
                    continue;
                }
                let outcome = op.apply(source, &key).await?;
                job.record_outcome(outcome);
            }
            self.progress(batch_no);
        };

        for note in keys.notes() {
            job.note(note);
        }
        Ok(ending)
    }

    async fn import(
        &self,
        path: &Path,
        db_filter: Option<u32>,
        target_db: Option<u32>,
        options: &RdbOptions,
    ) -> Result<Ending> {
        let job = &self.job;
        let destination = self.connect_source().await?;
        let mut import = Import::new(destination, target_db);
        let mut decoder = RdbDecoder::open(path, *options).await?;
        info!(
            job = %job.id,
            path = %path.display(),
            version = decoder.version(),
            "Importing RDB file"
        );

        let mut batch_no = 0;
        let mut expired = 0u64;
        let ending = loop {
            if job.is_cancelled() {
                break Ending::Cancelled;
            }

            // Filtered and expired entries count toward the batch too.
            let now = crate::now_ms();
            let mut batch: Vec<RdbEntry> = Vec::with_capacity(self.config.batch_size);
            let mut read = 0;
            let mut exhausted = false;
            while read < self.config.batch_size {
                let Some(entry) = decoder.next_entry().await? else {
                    exhausted = true;
                    break;
                };
                read += 1;
                if db_filter.is_some_and(|db| db != entry.db) {
                    continue;
                }
                if entry.is_expired(now) {
                    expired += 1;
                    continue;
                }
                batch.push(entry);
            }

            if read > 0 {
                batch_no += 1;
                for entry in &batch {
                    if !self.matches(&entry.key) {
                        continue;
                    }
                    job.record_match(&entry.key);
                    if self.config.dry_run {
                        continue;
                    }
                    let outcome = import.apply(entry).await?;
                    job.record_outcome(outcome);
                }
                self.progress(batch_no);
            }

            if exhausted {
                break Ending::Exhausted;
            }
        };

        debug!(
            job = %job.id,
            entries = decoder.entries_read(),
            bytes = decoder.offset(),
            "RDB reading stopped"
        );
        if expired > 0 {
            warn!(job = %job.id, expired, "Skipped expired entries");
            job.note(format!("skipped {} entries that had already expired", expired));
        }
        Ok(ending)
    }

    fn matches(&self, key: &[u8]) -> bool {
        self.filter.as_ref().map_or(true, |re| re.is_match(key))
    }

    fn progress(&self, batch: u64) {
        let counters = self.job.counters();
        debug!(
            job = %self.job.id,
            batch,
            matched = counters.matched,
            processed = counters.processed,
            failed = counters.failed,
            "Batch done"
        );
        self.job.events.publish(JobEvent::Progress {
            id: self.job.id,
            batch,
            counters,
        });
    }
}
