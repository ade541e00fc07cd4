//! Peer Mesh networking module using Chitchat.
//!
//! This module implements the peer-to-peer mesh used to share throttle
//! counters between Floodgate instances without a central cache. It uses
//! the chitchat library for gossip-based cluster membership and state
//! dissemination.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError};
