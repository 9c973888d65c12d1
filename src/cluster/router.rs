//! Command routing.
//!
//! The router is the only thing above the wire client that sends commands.
//! Against a standalone server it is a thin wrapper over one
//! [`Connection`]. Against a cluster it hashes the key to a slot, looks the
//! slot up in the topology, and sends the command to that node, opening
//! node connections lazily.
//!
//! ## Redirects
//!
//! ```text
//!   route(cmd, key)
//!        │ slot = key_slot(key)
//!        ▼
//!   owner = topology[slot] ──► send ──► reply
//!                                        │
//!            ┌───────────────────────────┼──────────────────────┐
//!            │ MOVED slot addr           │ ASK slot addr        │ other
//!            ▼                           ▼                      ▼
//!   topology[slot] = addr        ASKING + cmd to addr      return reply
//!   resend to addr               (topology untouched)
//! ```
//!
//! A command is sent at most [`MAX_REDIRECT_ATTEMPTS`] times. A redirect
//! on the last attempt is reported as [`BulkError::RedirectExhausted`]
//! instead of being followed, so a cluster stuck mid-failover cannot keep
//! a job bouncing between nodes.

use crate::cluster::slots::key_slot;
use crate::cluster::topology::{ClusterTopology, SharedTopology};
use crate::connection::{Connection, ConnectionDescriptor, ConnectionError, NodeAddr};
use crate::error::{BulkError, Result};
use crate::protocol::{Command, RespValue};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many times one command may be sent before a redirect is fatal.
pub const MAX_REDIRECT_ATTEMPTS: usize = 2;

/// A parsed `MOVED` or `ASK` error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// The slot has a new permanent owner
    Moved { slot: u16, addr: NodeAddr },
    /// The slot is migrating; ask the target for this one command
    Ask { slot: u16, addr: NodeAddr },
}

impl Redirect {
    /// Parses `MOVED <slot> <host:port>` / `ASK <slot> <host:port>`.
    pub fn parse(reply: &RespValue) -> Option<Redirect> {
        let RespValue::Error(message) = reply else {
            return None;
        };
        let mut parts = message.split_whitespace();
        let kind = parts.next()?;
        let slot = parts.next()?.parse::<u16>().ok()?;
        let addr = parts.next()?.parse::<NodeAddr>().ok()?;
        match kind {
            "MOVED" => Some(Redirect::Moved { slot, addr }),
            "ASK" => Some(Redirect::Ask { slot, addr }),
            _ => None,
        }
    }

    pub fn addr(&self) -> &NodeAddr {
        match self {
            Redirect::Moved { addr, .. } | Redirect::Ask { addr, .. } => addr,
        }
    }
}

/// Lazily opened connections to cluster nodes.
struct NodePool {
    descriptor: ConnectionDescriptor,
    conns: HashMap<NodeAddr, Connection>,
}

impl NodePool {
    /// The connection to `addr`, opening (or reopening a broken) one as
    /// needed.
    async fn get(&mut self, addr: &NodeAddr) -> std::result::Result<&mut Connection, ConnectionError> {
        match self.conns.entry(addr.clone()) {
            Entry::Occupied(e) if !e.get().is_broken() => Ok(e.into_mut()),
            Entry::Occupied(mut e) => {
                let conn = Connection::connect_to(addr, &self.descriptor, 0).await?;
                e.insert(conn);
                Ok(e.into_mut())
            }
            Entry::Vacant(e) => {
                let conn = Connection::connect_to(addr, &self.descriptor, 0).await?;
                Ok(e.insert(conn))
            }
        }
    }

    fn commands_sent(&self) -> u64 {
        self.conns.values().map(|c| c.stats().commands()).sum()
    }
}

enum Mode {
    Standalone(Connection),
    Cluster {
        topology: SharedTopology,
        nodes: NodePool,
    },
}

/// Sends commands to the node that owns them.
pub struct Router {
    descriptor: ConnectionDescriptor,
    mode: Mode,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("address", &self.descriptor.address())
            .field("cluster", &self.is_cluster())
            .finish()
    }
}

impl Router {
    /// Connects with a private topology table.
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Router> {
        let topology = Arc::new(RwLock::new(ClusterTopology::new()));
        Self::connect_shared(descriptor, topology).await
    }

    /// Connects, sharing `topology` with other routers of the same cluster.
    /// The topology is ignored for standalone descriptors.
    pub async fn connect_shared(
        descriptor: &ConnectionDescriptor,
        topology: SharedTopology,
    ) -> Result<Router> {
        if !descriptor.cluster {
            let conn = Connection::connect(descriptor).await?;
            return Ok(Router {
                descriptor: descriptor.clone(),
                mode: Mode::Standalone(conn),
            });
        }

        let mut router = Router {
            descriptor: descriptor.clone(),
            mode: Mode::Cluster {
                topology,
                nodes: NodePool {
                    descriptor: descriptor.clone(),
                    conns: HashMap::new(),
                },
            },
        };
        let needs_refresh = match &router.mode {
            Mode::Cluster { topology, .. } => topology.read().is_empty(),
            Mode::Standalone(_) => false,
        };
        if needs_refresh {
            router.refresh_topology().await?;
        }
        Ok(router)
    }

    /// Reloads the topology from `CLUSTER SLOTS`, asking each seed in turn
    /// until one answers.
    pub async fn refresh_topology(&mut self) -> Result<()> {
        let seeds = self.descriptor.seed_addresses();
        let Mode::Cluster { topology, nodes } = &mut self.mode else {
            return Ok(());
        };

        let mut last_err = None;
        for seed in &seeds {
            let conn = match nodes.get(seed).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Cluster seed unreachable");
                    last_err = Some(e);
                    continue;
                }
            };
            let reply = conn.execute(&Command::new("CLUSTER").arg("SLOTS")).await?;
            if let RespValue::Error(message) = reply {
                return Err(BulkError::server("CLUSTER SLOTS", message));
            }
            let fresh = ClusterTopology::from_cluster_slots(&reply, seed)
                .map_err(|detail| BulkError::protocol("CLUSTER SLOTS", detail))?;
            info!(
                seed = %seed,
                masters = fresh.masters().len(),
                unassigned = fresh.unassigned(),
                "Loaded cluster topology"
            );
            *topology.write() = fresh;
            return Ok(());
        }

        match last_err {
            Some(e) => Err(e.into()),
            None => Err(BulkError::protocol("CLUSTER SLOTS", "no seed nodes configured")),
        }
    }

    /// Sends a command that operates on `key`, following redirects.
    pub async fn route(&mut self, command: &Command, key: &[u8]) -> Result<RespValue> {
        let override_host = self
            .descriptor
            .override_redirect_host
            .then(|| self.descriptor.host.clone());
        let fallback = self.descriptor.address();

        let (topology, nodes) = match &mut self.mode {
            Mode::Standalone(conn) => return Ok(conn.execute(command).await?),
            Mode::Cluster { topology, nodes } => (topology, nodes),
        };

        let slot = key_slot(key);
        let mut target = topology
            .read()
            .node_for_slot(slot)
            .cloned()
            .unwrap_or(fallback);
        let mut asking = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let conn = nodes.get(&target).await?;
            if asking {
                let reply = conn.execute(&Command::new("ASKING")).await?;
                if let RespValue::Error(message) = reply {
                    return Err(BulkError::server("ASKING", message));
                }
            }

            let reply = conn.execute(command).await?;
            let Some(redirect) = Redirect::parse(&reply) else {
                return Ok(reply);
            };

            let mut addr = redirect.addr().clone();
            if let Some(host) = &override_host {
                addr.host = host.clone();
            }
            if attempt >= MAX_REDIRECT_ATTEMPTS {
                warn!(slot, node = %addr, "Redirect limit reached");
                return Err(BulkError::RedirectExhausted {
                    slot,
                    node: addr.to_string(),
                });
            }

            match redirect {
                Redirect::Moved { slot: moved, .. } => {
                    debug!(slot = moved, from = %target, to = %addr, "MOVED");
                    topology.write().assign(moved, addr.clone());
                    asking = false;
                }
                Redirect::Ask { .. } => {
                    debug!(slot, from = %target, to = %addr, "ASK");
                    asking = true;
                }
            }
            target = addr;
        }
    }

    /// Sends a keyless command. In cluster mode it goes to the first master.
    pub async fn execute(&mut self, command: &Command) -> Result<RespValue> {
        if let Mode::Standalone(conn) = &mut self.mode {
            return Ok(conn.execute(command).await?);
        }
        let node = self
            .masters()
            .into_iter()
            .next()
            .unwrap_or_else(|| self.descriptor.address());
        self.execute_on(&node, command).await
    }

    /// Sends a command to one specific node (SCAN is per node).
    pub async fn execute_on(&mut self, node: &NodeAddr, command: &Command) -> Result<RespValue> {
        match &mut self.mode {
            Mode::Standalone(conn) => Ok(conn.execute(command).await?),
            Mode::Cluster { nodes, .. } => Ok(nodes.get(node).await?.execute(command).await?),
        }
    }

    /// The nodes a full keyspace walk has to visit.
    pub fn masters(&self) -> Vec<NodeAddr> {
        match &self.mode {
            Mode::Standalone(conn) => vec![conn.addr().clone()],
            Mode::Cluster { topology, .. } => {
                let masters = topology.read().masters();
                if masters.is_empty() {
                    self.descriptor.seed_addresses()
                } else {
                    masters
                }
            }
        }
    }

    /// Switches database. Clusters only have database 0.
    pub async fn select(&mut self, db: u32) -> Result<()> {
        match &mut self.mode {
            Mode::Standalone(conn) if conn.db() == db => Ok(()),
            Mode::Standalone(conn) => match conn.select(db).await {
                Ok(()) => Ok(()),
                Err(ConnectionError::SelectFailed { message, .. }) => {
                    Err(BulkError::server("SELECT", message))
                }
                Err(e) => Err(e.into()),
            },
            Mode::Cluster { .. } if db == 0 => Ok(()),
            Mode::Cluster { .. } => Err(BulkError::server(
                "SELECT",
                format!("cluster deployments only have database 0, not {}", db),
            )),
        }
    }

    pub fn current_db(&self) -> u32 {
        match &self.mode {
            Mode::Standalone(conn) => conn.db(),
            Mode::Cluster { .. } => 0,
        }
    }

    /// Counts the server's logical databases.
    ///
    /// Uses `CONFIG GET databases`; when CONFIG is disabled (managed
    /// services often rename it) falls back to probing `SELECT n` for
    /// `n < limit`. The originally selected database is restored.
    pub async fn discover_databases(&mut self, limit: u32) -> Result<u32> {
        if self.is_cluster() {
            return Ok(1);
        }

        let reply = self
            .execute(&Command::new("CONFIG").arg("GET").arg("databases"))
            .await?;
        if let Some(count) = reply
            .as_array()
            .and_then(|pair| pair.get(1))
            .and_then(RespValue::as_integer)
            .and_then(|n| u32::try_from(n).ok())
        {
            return Ok(count);
        }
        debug!(reply = %reply, "CONFIG GET databases unavailable, probing with SELECT");

        let original = self.current_db();
        let mut count = 0;
        for db in 0..limit {
            let reply = self
                .execute(&Command::new("SELECT").arg_int(i64::from(db)))
                .await?;
            if reply.is_error() {
                break;
            }
            count = db + 1;
        }
        let reply = self
            .execute(&Command::new("SELECT").arg_int(i64::from(original)))
            .await?;
        if let RespValue::Error(message) = reply {
            return Err(BulkError::server("SELECT", message));
        }
        Ok(count)
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.mode, Mode::Cluster { .. })
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// The shared topology, for cluster routers.
    pub fn topology(&self) -> Option<SharedTopology> {
        match &self.mode {
            Mode::Cluster { topology, .. } => Some(Arc::clone(topology)),
            Mode::Standalone(_) => None,
        }
    }

    /// Commands sent over all connections so far.
    pub fn commands_sent(&self) -> u64 {
        match &self.mode {
            Mode::Standalone(conn) => conn.stats().commands(),
            Mode::Cluster { nodes, .. } => nodes.commands_sent(),
        }
    }
}
