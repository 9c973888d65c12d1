//! keysweep - Bulk Key Management for Redis
//!
//! Command-line front end: builds a job from the arguments (or a JSON job
//! file), runs it, streams progress to stderr and prints the summary as
//! JSON on stdout.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use keysweep::{
    ConnectionDescriptor, Coordinator, Credentials, JobConfig, JobEvent, JobState,
    OperationConfig, RdbOptions, Router, ScanOptions, Scanner,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "keysweep", version = keysweep::VERSION)]
#[command(about = "Scan, delete, expire, copy and import Redis keys in bulk")]
struct Cli {
    #[command(flatten)]
    server: ServerArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Where to connect.
#[derive(Debug, Clone, Args)]
struct ServerArgs {
    /// Server host, or a cluster seed
    #[arg(long, global = true, default_value = keysweep::DEFAULT_HOST, env = "KEYSWEEP_HOST")]
    host: String,

    #[arg(short, long, global = true, default_value_t = keysweep::DEFAULT_PORT, env = "KEYSWEEP_PORT")]
    port: u16,

    #[arg(long, global = true, env = "KEYSWEEP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// ACL user (needs --password)
    #[arg(long, global = true)]
    user: Option<String>,

    #[arg(long, global = true, default_value_t = 0)]
    db: u32,

    /// Route by hash slot and follow redirects
    #[arg(long, global = true)]
    cluster: bool,

    /// Connect and command timeout in seconds
    #[arg(long, global = true, default_value_t = 60)]
    timeout: u64,
}

impl ServerArgs {
    fn descriptor(&self) -> anyhow::Result<ConnectionDescriptor> {
        let mut descriptor = if self.cluster {
            ConnectionDescriptor::cluster(self.host.clone(), self.port)
        } else {
            ConnectionDescriptor::new(self.host.clone(), self.port)
        };
        descriptor = descriptor.with_db(self.db).with_timeouts(
            Duration::from_secs(self.timeout),
            Duration::from_secs(self.timeout),
        );
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => {
                descriptor = descriptor.with_credentials(Credentials::user(user, password))
            }
            (None, Some(password)) => {
                descriptor = descriptor.with_credentials(Credentials::password(password))
            }
            (Some(_), None) => bail!("--user needs --password"),
            (None, None) => {}
        }
        Ok(descriptor)
    }
}

/// Which keys a job touches.
#[derive(Debug, Clone, Args)]
struct Selection {
    /// Glob pattern for SCAN
    #[arg(long, conflicts_with = "keys")]
    pattern: Option<String>,

    /// Explicit key names instead of a scan
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    keys: Vec<String>,

    /// Regular expression a key must also match
    #[arg(long)]
    filter: Option<String>,

    /// SCAN COUNT hint
    #[arg(long, default_value_t = 100)]
    count: u32,

    /// Count matches without changing anything
    #[arg(long)]
    dry_run: bool,
}

impl Selection {
    fn job(&self, connection: ConnectionDescriptor, operation: OperationConfig) -> JobConfig {
        let mut config = if self.keys.is_empty() {
            JobConfig::scan(
                connection,
                self.pattern.clone().unwrap_or_else(|| "*".to_string()),
                operation,
            )
        } else {
            JobConfig::keys(connection, self.keys.clone(), operation)
        };
        config.key_filter = self.filter.clone();
        config.scan.count = self.count;
        config.with_dry_run(self.dry_run)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List matching keys with type, TTL and memory
    Scan {
        #[arg(long, default_value = "*")]
        pattern: String,
        #[arg(long, default_value_t = 100)]
        count: u32,
        #[arg(long)]
        limit: Option<u64>,
        /// Also fetch PTTL and MEMORY USAGE per key
        #[arg(long)]
        details: bool,
        #[arg(long, default_value = ":")]
        separator: String,
    },
    /// Delete matching keys
    Delete {
        #[command(flatten)]
        selection: Selection,
        /// UNLINK instead of DEL
        #[arg(long)]
        unlink: bool,
    },
    /// Set a TTL on matching keys
    Ttl {
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        seconds: i64,
    },
    /// Copy matching keys to another server with DUMP/RESTORE
    Copy {
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        to_host: String,
        #[arg(long, default_value_t = keysweep::DEFAULT_PORT)]
        to_port: u16,
        #[arg(long, default_value_t = 0)]
        to_db: u32,
        #[arg(long)]
        to_password: Option<String>,
        #[arg(long)]
        to_cluster: bool,
        /// Fail keys that already exist on the destination
        #[arg(long)]
        no_replace: bool,
    },
    /// Restore the keys of an RDB file
    Import {
        path: PathBuf,
        /// Only entries from this database
        #[arg(long)]
        from_db: Option<u32>,
        /// Restore everything into this database
        #[arg(long)]
        into_db: Option<u32>,
        #[arg(long)]
        filter: Option<String>,
        /// Fail on a bad or missing file checksum
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Count the logical databases
    Dbs {
        #[arg(long, default_value_t = 16)]
        max: u32,
    },
    /// Run a job described by a JSON file
    Run {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let descriptor = cli.server.descriptor()?;
    let config = match cli.command {
        Commands::Scan {
            pattern,
            count,
            limit,
            details,
            separator,
        } => {
            let options = ScanOptions {
                pattern,
                count,
                limit,
                separator,
                fetch_ttl: details,
                fetch_memory: details,
                detect_hyperloglog: details,
                ..ScanOptions::default()
            };
            return scan(&descriptor, options).await;
        }
        Commands::Dbs { max } => {
            let mut router = Router::connect(&descriptor).await?;
            let count = router.discover_databases(max).await?;
            println!("{}", count);
            return Ok(());
        }
        Commands::Delete { selection, unlink } => {
            selection.job(descriptor, OperationConfig::Delete { unlink })
        }
        Commands::Ttl { selection, seconds } => {
            selection.job(descriptor, OperationConfig::SetTtl { seconds })
        }
        Commands::Copy {
            selection,
            to_host,
            to_port,
            to_db,
            to_password,
            to_cluster,
            no_replace,
        } => {
            let mut destination = if to_cluster {
                ConnectionDescriptor::cluster(to_host, to_port)
            } else {
                ConnectionDescriptor::new(to_host, to_port).with_db(to_db)
            };
            destination = destination.with_timeouts(
                Duration::from_secs(cli.server.timeout),
                Duration::from_secs(cli.server.timeout),
            );
            if let Some(password) = to_password {
                destination = destination.with_credentials(Credentials::password(password));
            }
            selection.job(
                descriptor,
                OperationConfig::Copy {
                    destination: Some(destination),
                    replace: !no_replace,
                },
            )
        }
        Commands::Import {
            path,
            from_db,
            into_db,
            filter,
            strict,
            dry_run,
        } => {
            let mut config = JobConfig::import(descriptor, path);
            config.operation = match config.operation {
                OperationConfig::Import { path, .. } => OperationConfig::Import {
                    path,
                    db_filter: from_db,
                    target_db: into_db,
                    rdb: RdbOptions {
                        strict_checksum: strict,
                    },
                },
                other => other,
            };
            config.key_filter = filter;
            config.with_dry_run(dry_run)
        }
        Commands::Run { config } => {
            let text = tokio::fs::read_to_string(&config)
                .await
                .with_context(|| format!("reading {}", config.display()))?;
            serde_json::from_str::<JobConfig>(&text)
                .with_context(|| format!("parsing {}", config.display()))?
        }
    };

    run(config).await
}

/// Prints one line per key: name, type, TTL in ms, memory in bytes.
async fn scan(descriptor: &ConnectionDescriptor, options: ScanOptions) -> anyhow::Result<()> {
    let mut router = Router::connect(descriptor).await?;
    let mut scanner = Scanner::open(&router, options);
    loop {
        let page = scanner.next_page(&mut router).await?;
        for key in &page.keys {
            let ttl = key.ttl_ms.map(|t| t.to_string()).unwrap_or_default();
            let memory = key.memory.map(|m| m.to_string()).unwrap_or_default();
            println!(
                "{}\t{}\t{}\t{}",
                key.key_lossy(),
                key.key_type.as_str(),
                ttl,
                memory
            );
        }
        if page.done {
            break;
        }
    }
    for note in scanner.notes() {
        warn!("{}", note);
    }
    info!(
        keys = scanner.keys_returned(),
        pages = scanner.pages(),
        "Scan complete"
    );
    Ok(())
}

async fn run(config: JobConfig) -> anyhow::Result<()> {
    let coordinator = Coordinator::new();
    let job = coordinator.submit(config)?;
    let mut events = job.subscribe();

    let summary = loop {
        tokio::select! {
            event = events.next() => match event {
                Some(JobEvent::Started { id, operation }) => {
                    eprintln!("job {} started: {}", id, operation);
                }
                Some(JobEvent::Progress { batch, counters, .. }) => {
                    eprintln!(
                        "batch {}: matched {} processed {} ok {} failed {}",
                        batch, counters.matched, counters.processed, counters.succeeded, counters.failed
                    );
                }
                Some(JobEvent::Finished(summary)) => break summary,
                None => break job.wait().await,
            },
            _ = signal::ctrl_c() => {
                info!("Interrupt received, cancelling after the current batch");
                job.cancel();
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.state == JobState::Failed {
        bail!(
            "job failed: {}",
            summary.failure.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
