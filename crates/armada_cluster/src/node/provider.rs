//! Membership table, head election and liveness tracking.

use crate::error::ClusterError;
use crate::events::{ClusterEvent, ClusterEventBus};
use crate::node::{
    epoch_millis, NetworkClusterNode, NodeId, NodeInfoSnapshot, NodeState,
};
use crate::node::server::ClusterNodeServer;
use armada_network::ChannelKey;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One node removed by the liveness check. The caller owns the follow-up:
/// close the channel, mark the node's services deleted, tell the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedNode {
    pub id: NodeId,
    pub channel: Option<ChannelKey>,
}

/// Authoritative view of the cluster membership on this node.
///
/// Entries index their channel by [`ChannelKey`]; the head decision is
/// recomputed on every availability change and cached in an atomic flag so
/// hot paths never take the lock.
pub struct ClusterNodeProvider {
    local_node: NetworkClusterNode,
    startup_time: u64,
    draining: AtomicBool,
    nodes: DashMap<NodeId, ClusterNodeServer>,
    head: RwLock<Option<NodeId>>,
    is_head: AtomicBool,
    max_no_update: Duration,
    events: ClusterEventBus,
    last_snapshot: RwLock<NodeInfoSnapshot>,
}

impl ClusterNodeProvider {
    pub fn new(
        local_node: NetworkClusterNode,
        max_no_update: Duration,
        events: ClusterEventBus,
    ) -> Arc<Self> {
        let startup_time = epoch_millis();
        let initial_snapshot = NodeInfoSnapshot {
            node: local_node.clone(),
            creation_time: startup_time,
            startup_time,
            draining: false,
            service_count: 0,
            average_tick_millis: 0.0,
            modules: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let provider = Arc::new(Self {
            local_node,
            startup_time,
            draining: AtomicBool::new(false),
            nodes: DashMap::new(),
            head: RwLock::new(None),
            is_head: AtomicBool::new(false),
            max_no_update,
            events,
            last_snapshot: RwLock::new(initial_snapshot),
        });
        // Alone in the cluster until peers connect, so head by default.
        provider.elect_head();
        provider
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_node.id
    }

    pub fn local_node(&self) -> &NetworkClusterNode {
        &self.local_node
    }

    pub fn startup_time(&self) -> u64 {
        self.startup_time
    }

    pub fn events(&self) -> &ClusterEventBus {
        &self.events
    }

    /// Registers or refreshes a configured member. The local node never
    /// gets an entry.
    pub fn register_member(&self, node: NetworkClusterNode) {
        if node.id == self.local_node.id {
            return;
        }
        match self.nodes.get_mut(&node.id) {
            Some(mut entry) => entry.update_listeners(node),
            None => {
                debug!(node = %node.id, "cluster member registered");
                self.nodes.insert(node.id.clone(), ClusterNodeServer::new(node));
            }
        }
    }

    pub fn apply_members(&self, members: Vec<NetworkClusterNode>) {
        for member in members {
            self.register_member(member);
        }
    }

    pub fn registered_node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn node_state(&self, id: &NodeId) -> Option<NodeState> {
        self.nodes.get(id).map(|e| e.value().state())
    }

    pub fn node_entry(&self, id: &NodeId) -> Option<ClusterNodeServer> {
        self.nodes.get(id).map(|e| e.value().clone())
    }

    pub fn node_snapshot(&self, id: &NodeId) -> Option<NodeInfoSnapshot> {
        self.nodes
            .get(id)
            .and_then(|e| e.value().snapshot().cloned())
    }

    /// Gate for inbound handshakes: the peer must be a configured member
    /// that is not already connected, and this node must not be draining.
    pub fn acceptable_connection(&self, id: &NodeId) -> Result<(), ClusterError> {
        if self.is_draining() {
            return Err(ClusterError::Draining);
        }
        let entry = self
            .nodes
            .get(id)
            .ok_or_else(|| ClusterError::UnknownNode(id.clone()))?;
        if entry.value().state().is_connected() {
            return Err(ClusterError::AlreadyConnected(id.clone()));
        }
        Ok(())
    }

    /// Binds an authenticated channel to its member entry.
    pub fn handle_connected(&self, id: &NodeId, key: ChannelKey) -> Result<(), ClusterError> {
        {
            let mut entry = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| ClusterError::UnknownNode(id.clone()))?;
            entry.value_mut().mark_connected(key)?;
        }
        info!(node = %id, channel = %key, "cluster node connected");
        self.events.publish(ClusterEvent::NodeConnected { node: id.clone() });
        self.elect_head();
        Ok(())
    }

    /// Reacts to a channel close. Returns the affected node when the
    /// channel belonged to a connected member.
    pub fn handle_channel_closed(&self, key: ChannelKey) -> Option<NodeId> {
        let id = self.nodes.iter_mut().find_map(|mut entry| {
            let server = entry.value_mut();
            if server.channel() == Some(key) && server.state().is_connected() {
                server.mark_disconnected();
                Some(server.id().clone())
            } else {
                None
            }
        })?;
        info!(node = %id, channel = %key, "cluster node disconnected");
        self.events
            .publish(ClusterEvent::NodeDisconnected { node: id.clone() });
        self.elect_head();
        Some(id)
    }

    /// Graceful removal announced by the peer itself.
    pub fn handle_remote_shutdown(&self, id: &NodeId) -> Option<ChannelKey> {
        let channel = {
            let mut entry = self.nodes.get_mut(id)?;
            let server = entry.value_mut();
            let channel = server.channel();
            if !server.mark_disconnected() {
                return None;
            }
            channel
        };
        info!(node = %id, "cluster node announced shutdown");
        self.events
            .publish(ClusterEvent::NodeDisconnected { node: id.clone() });
        self.elect_head();
        channel
    }

    /// Stores a freshly received snapshot and re-elects when the node's
    /// availability flipped with it.
    pub fn update_snapshot(&self, snapshot: NodeInfoSnapshot) -> Result<(), ClusterError> {
        let id = snapshot.node.id.clone();
        let availability_changed = {
            let mut entry = self
                .nodes
                .get_mut(&id)
                .ok_or_else(|| ClusterError::UnknownNode(id.clone()))?;
            let server = entry.value_mut();
            let before = server.is_available();
            server.update_snapshot(snapshot);
            before != server.is_available()
        };
        if availability_changed {
            self.elect_head();
        }
        Ok(())
    }

    pub fn channel_key_of(&self, id: &NodeId) -> Option<ChannelKey> {
        self.nodes.get(id).and_then(|e| {
            let server = e.value();
            server.state().is_connected().then(|| server.channel()).flatten()
        })
    }

    pub fn connected_channels(&self) -> Vec<(NodeId, ChannelKey)> {
        self.nodes
            .iter()
            .filter_map(|e| {
                let server = e.value();
                if server.state().is_connected() {
                    server.channel().map(|key| (server.id().clone(), key))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Remote nodes currently eligible for elections and service placement.
    pub fn available_node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|e| e.value().is_available())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Evicts every connected member whose last update is older than the
    /// staleness bound. Emits exactly one eviction event per node and
    /// leaves channel/service cleanup to the caller.
    pub fn check_liveness(&self, now_millis: u64) -> Vec<EvictedNode> {
        let deadline = self.max_no_update.as_millis() as u64;
        let mut evicted = Vec::new();
        for mut entry in self.nodes.iter_mut() {
            let server = entry.value_mut();
            if !server.state().is_connected() {
                continue;
            }
            let age = now_millis.saturating_sub(server.last_update_millis());
            if age <= deadline {
                continue;
            }
            let channel = server.channel();
            if server.mark_evicted() {
                warn!(
                    node = %server.id(),
                    stale_millis = age,
                    limit_millis = deadline,
                    "evicting unresponsive cluster node"
                );
                evicted.push(EvictedNode {
                    id: server.id().clone(),
                    channel,
                });
            }
        }
        if !evicted.is_empty() {
            for node in &evicted {
                self.events
                    .publish(ClusterEvent::NodeEvicted { node: node.id.clone() });
            }
            self.elect_head();
        }
        evicted
    }

    pub fn set_draining(&self, draining: bool) {
        let was = self.draining.swap(draining, Ordering::SeqCst);
        if was != draining {
            info!(draining, "local drain state changed");
            self.elect_head();
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn head_node(&self) -> Option<NodeId> {
        self.head.read().map(|guard| guard.clone()).unwrap_or(None)
    }

    /// Cheap cached check, refreshed by every election.
    pub fn is_head(&self) -> bool {
        self.is_head.load(Ordering::SeqCst)
    }

    /// Deterministic election: the minimal node id among all available
    /// nodes wins. Every member computes the same winner from the same
    /// view, no coordination round needed.
    fn elect_head(&self) {
        let mut candidates = self.available_node_ids();
        if !self.is_draining() {
            candidates.push(self.local_node.id.clone());
        }
        let winner = candidates.into_iter().min();

        let changed = {
            let mut head = match self.head.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *head == winner {
                false
            } else {
                *head = winner.clone();
                true
            }
        };
        self.is_head
            .store(winner.as_ref() == Some(&self.local_node.id), Ordering::SeqCst);
        if changed {
            info!(head = winner.as_ref().map(|id| id.as_str()).unwrap_or("-"), "cluster head changed");
            self.events.publish(ClusterEvent::HeadChanged { head: winner });
        }
    }

    /// Declares the module names this node reports in its snapshots.
    pub fn set_modules(&self, modules: Vec<String>) {
        let mut cache = match self.last_snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.modules = modules;
    }

    /// Builds the snapshot this node publishes about itself.
    pub fn local_snapshot(&self, service_count: u32, average_tick_millis: f64) -> NodeInfoSnapshot {
        let mut cache = match self.last_snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let snapshot = NodeInfoSnapshot {
            node: self.local_node.clone(),
            creation_time: epoch_millis(),
            startup_time: self.startup_time,
            draining: self.is_draining(),
            service_count,
            average_tick_millis,
            modules: cache.modules.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        *cache = snapshot.clone();
        snapshot
    }

    /// Snapshot sent during the auth exchange: the last published load
    /// figures stamped with a fresh creation time.
    pub fn handshake_snapshot(&self) -> NodeInfoSnapshot {
        let mut snapshot = match self.last_snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        snapshot.creation_time = epoch_millis();
        snapshot.draining = self.is_draining();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ListenerAddress;

    fn member(id: &str) -> NetworkClusterNode {
        NetworkClusterNode::new(NodeId::from(id), vec![ListenerAddress::new("10.0.0.9", 1410)])
    }

    fn snapshot_for(node: &NetworkClusterNode, creation_time: u64, draining: bool) -> NodeInfoSnapshot {
        NodeInfoSnapshot {
            node: node.clone(),
            creation_time,
            startup_time: 0,
            draining,
            service_count: 0,
            average_tick_millis: 0.0,
            modules: Vec::new(),
            version: "0.1.0".to_string(),
        }
    }

    fn provider(local: &str, max_no_update: Duration) -> (Arc<ClusterNodeProvider>, ClusterEventBus) {
        let events = ClusterEventBus::new();
        let provider = ClusterNodeProvider::new(member(local), max_no_update, events.clone());
        (provider, events)
    }

    fn connect(provider: &ClusterNodeProvider, id: &str, at: u64) -> ChannelKey {
        let key = ChannelKey::next();
        provider.handle_connected(&NodeId::from(id), key).unwrap();
        provider
            .update_snapshot(snapshot_for(&member(id), at, false))
            .unwrap();
        key
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<ClusterEvent>) -> Vec<ClusterEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn lonely_node_is_head() {
        let (provider, _) = provider("Node-2", Duration::from_secs(30));
        assert!(provider.is_head());
        assert_eq!(provider.head_node(), Some(NodeId::from("Node-2")));
    }

    #[test]
    fn published_snapshot_carries_modules_and_load() {
        let (provider, _) = provider("Node-1", Duration::from_secs(30));
        provider.set_modules(vec!["service_tasks".to_string(), "services".to_string()]);

        let snapshot = provider.local_snapshot(4, 2.5);
        assert_eq!(snapshot.node.id, NodeId::from("Node-1"));
        assert_eq!(snapshot.service_count, 4);
        assert_eq!(snapshot.modules, vec!["service_tasks", "services"]);

        // The auth exchange reuses the last published figures.
        let auth = provider.handshake_snapshot();
        assert_eq!(auth.service_count, 4);
        assert_eq!(auth.modules, snapshot.modules);
        assert!(auth.creation_time >= snapshot.creation_time);
    }

    #[test]
    fn acceptable_connection_guards() {
        let (provider, _) = provider("Node-1", Duration::from_secs(30));
        provider.register_member(member("Node-2"));

        assert!(matches!(
            provider.acceptable_connection(&NodeId::from("Node-9")),
            Err(ClusterError::UnknownNode(_))
        ));
        provider.acceptable_connection(&NodeId::from("Node-2")).unwrap();

        connect(&provider, "Node-2", epoch_millis());
        assert!(matches!(
            provider.acceptable_connection(&NodeId::from("Node-2")),
            Err(ClusterError::AlreadyConnected(_))
        ));

        provider.set_draining(true);
        provider.register_member(member("Node-3"));
        assert!(matches!(
            provider.acceptable_connection(&NodeId::from("Node-3")),
            Err(ClusterError::Draining)
        ));
    }

    #[test]
    fn head_is_minimal_available_id() {
        let (provider, _) = provider("Node-2", Duration::from_secs(30));
        provider.register_member(member("Node-1"));
        provider.register_member(member("Node-3"));

        // Registered but unavailable members do not count.
        assert_eq!(provider.head_node(), Some(NodeId::from("Node-2")));

        connect(&provider, "Node-3", epoch_millis());
        assert_eq!(provider.head_node(), Some(NodeId::from("Node-2")));
        assert!(provider.is_head());

        connect(&provider, "Node-1", epoch_millis());
        assert_eq!(provider.head_node(), Some(NodeId::from("Node-1")));
        assert!(!provider.is_head());
    }

    #[test]
    fn connection_without_snapshot_is_not_available() {
        let (provider, _) = provider("Node-2", Duration::from_secs(30));
        provider.register_member(member("Node-1"));
        provider
            .handle_connected(&NodeId::from("Node-1"), ChannelKey::next())
            .unwrap();

        // No snapshot yet: Node-1 must not win the election.
        assert!(provider.available_node_ids().is_empty());
        assert_eq!(provider.head_node(), Some(NodeId::from("Node-2")));
    }

    #[test]
    fn draining_local_node_abdicates() {
        let (provider, _) = provider("Node-1", Duration::from_secs(30));
        provider.register_member(member("Node-2"));
        connect(&provider, "Node-2", epoch_millis());
        assert!(provider.is_head());

        provider.set_draining(true);
        assert!(!provider.is_head());
        assert_eq!(provider.head_node(), Some(NodeId::from("Node-2")));

        provider.set_draining(false);
        assert!(provider.is_head());
    }

    #[test]
    fn stale_node_is_evicted_exactly_once() {
        let (provider, events) = provider("Node-1", Duration::from_millis(30_000));
        let mut rx = events.subscribe();
        provider.register_member(member("Node-2"));

        let base = epoch_millis();
        connect(&provider, "Node-2", base);
        drain_events(&mut rx);

        // Within the bound: nothing happens.
        assert!(provider.check_liveness(base + 29_000).is_empty());

        // Past the bound: one eviction, one event.
        let evicted = provider.check_liveness(base + 31_000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, NodeId::from("Node-2"));
        assert!(evicted[0].channel.is_some());
        assert_eq!(
            provider.node_state(&NodeId::from("Node-2")),
            Some(NodeState::Evicted)
        );

        // Re-running the check emits nothing further.
        assert!(provider.check_liveness(base + 60_000).is_empty());
        let eviction_events: Vec<_> = drain_events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ClusterEvent::NodeEvicted { .. }))
            .collect();
        assert_eq!(eviction_events.len(), 1);
    }

    #[test]
    fn fresh_snapshot_defers_eviction() {
        let (provider, _) = provider("Node-1", Duration::from_millis(30_000));
        provider.register_member(member("Node-2"));
        let base = epoch_millis();
        connect(&provider, "Node-2", base);

        provider
            .update_snapshot(snapshot_for(&member("Node-2"), base + 25_000, false))
            .unwrap();
        assert!(provider.check_liveness(base + 40_000).is_empty());
        assert_eq!(provider.check_liveness(base + 60_000).len(), 1);
    }

    #[test]
    fn eviction_of_head_triggers_reelection() {
        let (provider, events) = provider("Node-2", Duration::from_millis(30_000));
        provider.register_member(member("Node-1"));
        let base = epoch_millis();
        connect(&provider, "Node-1", base);
        assert!(!provider.is_head());

        let mut rx = events.subscribe();
        provider.check_liveness(base + 31_000);
        assert!(provider.is_head());
        assert!(drain_events(&mut rx)
            .iter()
            .any(|e| matches!(e, ClusterEvent::HeadChanged { head: Some(h) } if h == &NodeId::from("Node-2"))));
    }

    #[test]
    fn channel_close_maps_back_to_the_node() {
        let (provider, _) = provider("Node-1", Duration::from_secs(30));
        provider.register_member(member("Node-2"));
        let key = connect(&provider, "Node-2", epoch_millis());

        assert_eq!(provider.handle_channel_closed(key), Some(NodeId::from("Node-2")));
        assert_eq!(
            provider.node_state(&NodeId::from("Node-2")),
            Some(NodeState::Disconnected)
        );
        // A second close of the same key is a no-op.
        assert_eq!(provider.handle_channel_closed(key), None);
    }

    #[test]
    fn remote_shutdown_disconnects_gracefully() {
        let (provider, events) = provider("Node-1", Duration::from_secs(30));
        provider.register_member(member("Node-2"));
        connect(&provider, "Node-2", epoch_millis());

        let mut rx = events.subscribe();
        let channel = provider.handle_remote_shutdown(&NodeId::from("Node-2"));
        assert!(channel.is_some());
        assert_eq!(
            provider.node_state(&NodeId::from("Node-2")),
            Some(NodeState::Disconnected)
        );
        assert!(drain_events(&mut rx)
            .iter()
            .any(|e| matches!(e, ClusterEvent::NodeDisconnected { .. })));
        assert!(provider.handle_remote_shutdown(&NodeId::from("Node-2")).is_none());
    }
}
