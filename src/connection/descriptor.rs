//! Connection descriptors.
//!
//! A descriptor is everything needed to open a connection: where, as whom,
//! which database, and how long to wait. Hosts build one from their saved
//! connection settings and hand it to a job; the engine only reads it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default number of logical databases on a standalone server.
pub const DEFAULT_MAX_DATABASES: u32 = 16;

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddr {
    type Err = String;

    /// Parses `host:port`, `[v6]:port`, or a bare v6 `a:b::c:port` as Redis
    /// prints it in redirects.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{}'", s))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in '{}'", s))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing host in '{}'", s));
        }
        Ok(NodeAddr::new(host, port))
    }
}

/// AUTH credentials. The password never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// ACL user name; `None` uses the legacy single-password AUTH
    pub username: Option<String>,
    pub password: String,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            username: None,
            password: password.into(),
        }
    }

    pub fn user(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// How to reach one server or one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionDescriptor {
    /// Host of the server, or of the first cluster seed
    pub host: String,
    pub port: u16,

    /// Treat the deployment as a cluster and route by hash slot
    pub cluster: bool,

    /// Extra cluster seed nodes tried after `host:port`
    pub seeds: Vec<NodeAddr>,

    pub credentials: Option<Credentials>,

    /// Database selected after connecting (standalone only)
    pub db: u32,

    /// Upper bound for TCP connect plus AUTH/SELECT
    pub connect_timeout: Duration,

    /// Upper bound for one command round trip
    pub execute_timeout: Duration,

    /// Keep the configured host when following cluster redirects and only
    /// take the port from the redirect (for tunnels and NAT)
    pub override_redirect_host: bool,

    /// Number of logical databases the server is expected to have
    pub max_databases: u32,
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            cluster: false,
            seeds: Vec::new(),
            credentials: None,
            db: 0,
            connect_timeout: Duration::from_secs(60),
            execute_timeout: Duration::from_secs(60),
            override_redirect_host: false,
            max_databases: DEFAULT_MAX_DATABASES,
        }
    }
}

impl ConnectionDescriptor {
    /// Descriptor for a standalone server with default timeouts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Descriptor for a cluster reached through the given seed.
    pub fn cluster(host: impl Into<String>, port: u16) -> Self {
        Self {
            cluster: true,
            ..Self::new(host, port)
        }
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, execute: Duration) -> Self {
        self.connect_timeout = connect;
        self.execute_timeout = execute;
        self
    }

    pub fn with_seed(mut self, seed: NodeAddr) -> Self {
        self.seeds.push(seed);
        self
    }

    /// The primary address.
    pub fn address(&self) -> NodeAddr {
        NodeAddr::new(self.host.clone(), self.port)
    }

    /// The primary address followed by the extra seeds.
    pub fn seed_addresses(&self) -> Vec<NodeAddr> {
        let primary = self.address();
        let mut all = vec![primary.clone()];
        all.extend(self.seeds.iter().filter(|s| **s != primary).cloned());
        all
    }
}
