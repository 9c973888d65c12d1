//! Cluster Routing Module
//!
//! Maps keys to the node that owns them and follows the cluster's
//! redirects.
//!
//! ## Modules
//!
//! - `slots`: CRC16 hash slot calculation with `{hash tag}` support
//! - `topology`: the slot to node table, shareable between jobs
//! - `router`: the [`Router`] every higher layer sends commands through
//!
//! A standalone deployment goes through the same [`Router`] type; it just
//! never computes a slot.

pub mod router;
pub mod slots;
pub mod topology;

pub use router::{Redirect, Router, MAX_REDIRECT_ATTEMPTS};
pub use slots::{hash_tag, key_slot, SLOT_COUNT};
pub use topology::{ClusterTopology, SharedTopology, TopologyCache};
