//! Job configuration and its validation.
//!
//! A configuration is checked in full before a job exists. Nothing about a
//! rejected configuration touches the network.

use crate::connection::ConnectionDescriptor;
use crate::rdb::RdbOptions;
use crate::scanner::ScanOptions;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Per-key errors kept in a job summary.
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 100;

/// Affected key names kept by a dry run.
pub const DEFAULT_PREVIEW_LIMIT: usize = 100;

/// Keys per batch for explicit key lists and RDB imports.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Rejected job parameters.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("either a non-empty pattern or a key list is required")]
    NoKeySource,

    #[error("a pattern and a key list cannot be combined")]
    ConflictingKeySource,

    #[error("import reads its keys from the RDB file; pattern and key list must be empty")]
    KeySourceOnImport,

    #[error("TTL must be positive, got {0}")]
    InvalidTtl(i64),

    #[error("copy needs a destination")]
    MissingDestination,

    #[error("copy source and destination are the same database")]
    SameSourceAndDestination,

    #[error("RDB file {0} does not exist")]
    RdbNotFound(PathBuf),

    #[error("invalid key filter '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{role} database {db} is out of range (server has {max})")]
    DatabaseOutOfRange {
        role: &'static str,
        db: u32,
        max: u32,
    },

    #[error("{role} is a cluster, which only has database 0 (got {db})")]
    ClusterDatabase { role: &'static str, db: u32 },

    #[error("batch size must be positive")]
    ZeroBatchSize,
}

/// What to do with each matched key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationConfig {
    Delete {
        #[serde(default)]
        unlink: bool,
    },
    SetTtl {
        seconds: i64,
    },
    Copy {
        /// Target server and database
        destination: Option<ConnectionDescriptor>,
        #[serde(default = "default_true")]
        replace: bool,
    },
    Import {
        path: PathBuf,
        /// Only entries from this database
        #[serde(default)]
        db_filter: Option<u32>,
        /// Restore into this database instead of the entry's own
        #[serde(default)]
        target_db: Option<u32>,
        #[serde(default)]
        rdb: RdbOptions,
    },
}

fn default_true() -> bool {
    true
}

impl Default for OperationConfig {
    fn default() -> Self {
        OperationConfig::Delete { unlink: false }
    }
}

impl OperationConfig {
    pub fn name(&self) -> &'static str {
        match self {
            OperationConfig::Delete { .. } => "delete",
            OperationConfig::SetTtl { .. } => "ttl",
            OperationConfig::Copy { .. } => "copy",
            OperationConfig::Import { .. } => "import",
        }
    }

    pub fn is_import(&self) -> bool {
        matches!(self, OperationConfig::Import { .. })
    }
}

/// Everything a job needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Source server (destination for imports); its `db` is the scanned
    /// database
    pub connection: ConnectionDescriptor,

    /// Glob pattern for the scan
    pub pattern: Option<String>,

    /// Explicit keys instead of a scan
    pub keys: Vec<String>,

    pub operation: OperationConfig,

    /// Regular expression a key must also match
    pub key_filter: Option<String>,

    /// Scan tuning and enrichment (its `pattern` is replaced by `pattern`)
    pub scan: ScanOptions,

    /// Keys per batch when not scanning
    pub batch_size: usize,

    /// Match and count, but leave the keys alone
    pub dry_run: bool,

    /// Key names kept by a dry run
    pub preview_limit: usize,

    /// Per-key errors kept in the summary
    pub error_log_capacity: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionDescriptor::default(),
            pattern: None,
            keys: Vec::new(),
            operation: OperationConfig::default(),
            key_filter: None,
            scan: ScanOptions::default().keys_only(),
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
        }
    }
}

impl JobConfig {
    /// A job over keys matching `pattern`.
    pub fn scan(
        connection: ConnectionDescriptor,
        pattern: impl Into<String>,
        operation: OperationConfig,
    ) -> Self {
        Self {
            connection,
            pattern: Some(pattern.into()),
            operation,
            ..Default::default()
        }
    }

    /// A job over an explicit list of keys.
    pub fn keys(
        connection: ConnectionDescriptor,
        keys: Vec<String>,
        operation: OperationConfig,
    ) -> Self {
        Self {
            connection,
            keys,
            operation,
            ..Default::default()
        }
    }

    /// An import of an RDB file into `connection`.
    pub fn import(connection: ConnectionDescriptor, path: impl Into<PathBuf>) -> Self {
        Self {
            connection,
            operation: OperationConfig::Import {
                path: path.into(),
                db_filter: None,
                target_db: None,
                rdb: RdbOptions::default(),
            },
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, regex: impl Into<String>) -> Self {
        self.key_filter = Some(regex.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Scan options with the job's pattern filled in.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            pattern: self.pattern.clone().unwrap_or_else(|| "*".to_string()),
            ..self.scan.clone()
        }
    }

    /// Checks the configuration and compiles the key filter.
    pub fn validate(&self) -> Result<Option<Regex>, ConfigError> {
        let has_pattern = self.pattern.as_deref().is_some_and(|p| !p.is_empty());
        let has_keys = !self.keys.is_empty();

        if self.operation.is_import() {
            if has_pattern || has_keys {
                return Err(ConfigError::KeySourceOnImport);
            }
        } else if has_pattern && has_keys {
            return Err(ConfigError::ConflictingKeySource);
        } else if !has_pattern && !has_keys {
            return Err(ConfigError::NoKeySource);
        }

        if self.batch_size == 0 || self.scan.count == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        check_db("source", &self.connection, self.connection.db)?;

        match &self.operation {
            OperationConfig::Delete { .. } => {}
            OperationConfig::SetTtl { seconds } => {
                if *seconds <= 0 {
                    return Err(ConfigError::InvalidTtl(*seconds));
                }
            }
            OperationConfig::Copy { destination, .. } => {
                let destination = destination.as_ref().ok_or(ConfigError::MissingDestination)?;
                check_db("destination", destination, destination.db)?;
                if destination.address() == self.connection.address()
                    && destination.db == self.connection.db
                {
                    return Err(ConfigError::SameSourceAndDestination);
                }
            }
            OperationConfig::Import {
                path,
                db_filter,
                target_db,
                ..
            } => {
                if !path.is_file() {
                    return Err(ConfigError::RdbNotFound(path.clone()));
                }
                // Only the database entries land in must exist on the
                // destination.
                match (target_db, db_filter) {
                    (Some(db), _) => check_db("import target", &self.connection, *db)?,
                    (None, Some(db)) => check_db("import filter", &self.connection, *db)?,
                    (None, None) => {}
                }
            }
        }

        self.key_filter
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidFilter {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()
    }
}

fn check_db(role: &'static str, descriptor: &ConnectionDescriptor, db: u32) -> Result<(), ConfigError> {
    if descriptor.cluster && db != 0 {
        return Err(ConfigError::ClusterDatabase { role, db });
    }
    if db >= descriptor.max_databases {
        return Err(ConfigError::DatabaseOutOfRange {
            role,
            db,
            max: descriptor.max_databases,
        });
    }
    Ok(())
}
