//! Per-peer bookkeeping entry.

use crate::error::ClusterError;
use crate::node::{epoch_millis, NetworkClusterNode, NodeId, NodeInfoSnapshot, NodeState};
use armada_network::ChannelKey;

/// Everything this node tracks about one configured peer.
///
/// The entry stores the peer's channel as a non-owning [`ChannelKey`]; the
/// channel itself lives in the network registry and is resolved on use, so
/// a closed channel can never be kept alive from here.
#[derive(Debug, Clone)]
pub struct ClusterNodeServer {
    node: NetworkClusterNode,
    state: NodeState,
    channel: Option<ChannelKey>,
    connected_at: u64,
    snapshot: Option<NodeInfoSnapshot>,
    previous_snapshot: Option<NodeInfoSnapshot>,
}

impl ClusterNodeServer {
    pub fn new(node: NetworkClusterNode) -> Self {
        Self {
            node,
            state: NodeState::Configured,
            channel: None,
            connected_at: 0,
            snapshot: None,
            previous_snapshot: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.node.id
    }

    pub fn node(&self) -> &NetworkClusterNode {
        &self.node
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn channel(&self) -> Option<ChannelKey> {
        self.channel
    }

    /// When the current connection was established, epoch millis.
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    pub fn snapshot(&self) -> Option<&NodeInfoSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn previous_snapshot(&self) -> Option<&NodeInfoSnapshot> {
        self.previous_snapshot.as_ref()
    }

    /// Available nodes take part in elections and can host services:
    /// connected, at least one snapshot seen, not draining.
    pub fn is_available(&self) -> bool {
        self.state.is_connected()
            && self.snapshot.as_ref().is_some_and(|s| !s.draining)
    }

    /// Reference time for the staleness check: the newest snapshot
    /// creation time, floored at the connect time so a snapshot from a
    /// previous session never counts against a fresh connection.
    pub fn last_update_millis(&self) -> u64 {
        self.snapshot
            .as_ref()
            .map(|s| s.creation_time)
            .unwrap_or(0)
            .max(self.connected_at)
    }

    pub(crate) fn update_listeners(&mut self, node: NetworkClusterNode) {
        self.node = node;
    }

    pub(crate) fn mark_connected(&mut self, key: ChannelKey) -> Result<(), ClusterError> {
        if self.state.is_connected() {
            return Err(ClusterError::AlreadyConnected(self.node.id.clone()));
        }
        self.state = NodeState::Connected;
        self.channel = Some(key);
        self.connected_at = epoch_millis();
        Ok(())
    }

    /// Returns `true` if the entry was connected before.
    pub(crate) fn mark_disconnected(&mut self) -> bool {
        let was_connected = self.state.is_connected();
        if was_connected {
            self.state = NodeState::Disconnected;
        }
        self.channel = None;
        was_connected
    }

    /// Returns `true` only on the Connected -> Evicted transition, so the
    /// caller can emit exactly one eviction event per incident.
    pub(crate) fn mark_evicted(&mut self) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        self.state = NodeState::Evicted;
        self.channel = None;
        true
    }

    pub(crate) fn update_snapshot(&mut self, snapshot: NodeInfoSnapshot) {
        self.previous_snapshot = self.snapshot.take();
        self.snapshot = Some(snapshot);
    }
}
