//! Runtime configuration consumed by [`LocalNode`](crate::LocalNode).
//!
//! This is the typed form the node operates on. File formats, CLI overrides
//! and default-file creation are the binary's concern; it converts its
//! settings into this struct and calls [`ClusterConfig::validate`] before
//! startup.

use crate::error::ClusterError;
use crate::node::NetworkClusterNode;
use crate::scheduler::DEFAULT_TICKS_PER_SECOND;
use armada_protocol::DEFAULT_MAX_FRAME_SIZE;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// How long a peer may go without a fresh snapshot before eviction.
pub const DEFAULT_MAX_NO_UPDATE: Duration = Duration::from_secs(30);

/// Default cadence of the own-snapshot broadcast, one tick.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Default delay between outbound connection attempts to an absent peer.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Cluster runtime settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Identity this node presents to peers.
    pub local: NetworkClusterNode,
    /// Address the cluster listener binds to.
    pub bind_address: SocketAddr,
    /// Peers this node accepts and dials. May include the local node; it
    /// is skipped.
    pub members: Vec<NetworkClusterNode>,
    pub heartbeat_interval: Duration,
    pub max_no_update: Duration,
    pub ticks_per_second: u32,
    pub max_frame_size: usize,
    pub reconnect_interval: Duration,
    pub query_timeout: Duration,
}

impl ClusterConfig {
    pub fn new(local: NetworkClusterNode, bind_address: SocketAddr) -> Self {
        Self {
            local,
            bind_address,
            members: Vec::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_no_update: DEFAULT_MAX_NO_UPDATE,
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            query_timeout: Duration::from_secs(10),
        }
    }

    /// Checks the settings for internal consistency.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.local.id.as_str().is_empty() {
            return Err(ClusterError::InvalidConfig(
                "node id must not be empty".into(),
            ));
        }
        if self.local.listeners.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "node must advertise at least one listener address".into(),
            ));
        }
        let mut seen = HashSet::new();
        for member in &self.members {
            if member.id.as_str().is_empty() {
                return Err(ClusterError::InvalidConfig(
                    "member with empty node id".into(),
                ));
            }
            if member.id != self.local.id && !seen.insert(member.id.clone()) {
                return Err(ClusterError::InvalidConfig(format!(
                    "member {} listed twice",
                    member.id
                )));
            }
        }
        if self.ticks_per_second == 0 || self.ticks_per_second > 1000 {
            return Err(ClusterError::InvalidConfig(format!(
                "ticks_per_second must be within 1..=1000, got {}",
                self.ticks_per_second
            )));
        }
        // Below two heartbeats of slack, jitter alone would evict peers.
        if self.max_no_update < self.heartbeat_interval * 2 {
            return Err(ClusterError::InvalidConfig(format!(
                "max_no_update ({:?}) must be at least twice the heartbeat interval ({:?})",
                self.max_no_update, self.heartbeat_interval
            )));
        }
        if self.max_frame_size < 1024 {
            return Err(ClusterError::InvalidConfig(format!(
                "max_frame_size must be at least 1024 bytes, got {}",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}
