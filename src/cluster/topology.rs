//! Slot ownership table.
//!
//! The topology maps each of the 16384 slots to the master that serves it.
//! It is seeded from `CLUSTER SLOTS` and afterwards only patched one slot
//! at a time when a `MOVED` redirect proves an entry stale.
//!
//! Several jobs that target the same cluster may share one table through
//! [`SharedTopology`]. Readers take the read lock for a single lookup;
//! routers take the write lock only to apply a redirect or a refresh.

use crate::cluster::slots::SLOT_COUNT;
use crate::connection::NodeAddr;
use crate::protocol::RespValue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Topology handle shared between routers of the same cluster.
pub type SharedTopology = Arc<RwLock<ClusterTopology>>;

/// Slot to node table.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    /// Index into `nodes` for every slot
    slots: Box<[Option<u16>]>,
    nodes: Vec<NodeAddr>,
    /// Bumped on every mutation
    epoch: u64,
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterTopology {
    /// An empty table: no slot has an owner yet.
    pub fn new() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
            nodes: Vec::new(),
            epoch: 0,
        }
    }

    /// Every slot owned by one node.
    pub fn single(addr: NodeAddr) -> Self {
        let mut topology = Self::new();
        topology.assign_range(0, SLOT_COUNT - 1, addr);
        topology
    }

    /// Builds the table from a `CLUSTER SLOTS` reply.
    ///
    /// Each element is `[start, end, [host, port, ...], replicas...]`. An
    /// empty or `?` host means "the node you asked", so `queried` fills in.
    pub fn from_cluster_slots(reply: &RespValue, queried: &NodeAddr) -> Result<Self, String> {
        let ranges = reply
            .as_array()
            .ok_or_else(|| format!("expected array, got {}", reply))?;

        let mut topology = Self::new();
        for range in ranges {
            let parts = range
                .as_array()
                .filter(|p| p.len() >= 3)
                .ok_or_else(|| "slot range entry too short".to_string())?;

            let start = slot_number(&parts[0])?;
            let end = slot_number(&parts[1])?;
            if start > end {
                return Err(format!("inverted slot range {}-{}", start, end));
            }

            let master = parts[2]
                .as_array()
                .filter(|m| m.len() >= 2)
                .ok_or_else(|| "master entry too short".to_string())?;
            let host = master[0].as_str().unwrap_or_default();
            let port = master[1]
                .as_integer()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| "invalid master port".to_string())?;
            let host = if host.is_empty() || host == "?" {
                queried.host.clone()
            } else {
                host.to_string()
            };

            topology.assign_range(start, end, NodeAddr::new(host, port));
        }
        Ok(topology)
    }

    /// Owner of `slot`, if known.
    pub fn node_for_slot(&self, slot: u16) -> Option<&NodeAddr> {
        let idx = (*self.slots.get(slot as usize)?)?;
        self.nodes.get(idx as usize)
    }

    /// Records `addr` as the owner of one slot.
    pub fn assign(&mut self, slot: u16, addr: NodeAddr) {
        self.assign_range(slot, slot, addr);
    }

    fn assign_range(&mut self, start: u16, end: u16, addr: NodeAddr) {
        let idx = self.node_index(addr);
        let end = end.min(SLOT_COUNT - 1);
        for slot in start..=end {
            self.slots[slot as usize] = Some(idx);
        }
        self.epoch += 1;
    }

    fn node_index(&mut self, addr: NodeAddr) -> u16 {
        match self.nodes.iter().position(|n| *n == addr) {
            Some(i) => i as u16,
            None => {
                self.nodes.push(addr);
                (self.nodes.len() - 1) as u16
            }
        }
    }

    /// Nodes that currently own at least one slot, in first-seen order.
    pub fn masters(&self) -> Vec<NodeAddr> {
        let mut owns = vec![false; self.nodes.len()];
        for idx in self.slots.iter().flatten() {
            owns[*idx as usize] = true;
        }
        self.nodes
            .iter()
            .zip(owns)
            .filter(|(_, owns)| *owns)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Number of slots without an owner.
    pub fn unassigned(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.unassigned() == SLOT_COUNT as usize
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

fn slot_number(value: &RespValue) -> Result<u16, String> {
    value
        .as_integer()
        .and_then(|n| u16::try_from(n).ok())
        .filter(|n| *n < SLOT_COUNT)
        .ok_or_else(|| format!("invalid slot number {}", value))
}

/// Topologies keyed by the cluster's first seed address, so that jobs
/// against the same cluster start from the same table.
#[derive(Debug, Default)]
pub struct TopologyCache {
    entries: Mutex<HashMap<NodeAddr, SharedTopology>>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared table for the cluster reached through `seed`, created
    /// empty on first use.
    pub fn get_or_create(&self, seed: &NodeAddr) -> SharedTopology {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(seed.clone())
                .or_insert_with(|| Arc::new(RwLock::new(ClusterTopology::new()))),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
