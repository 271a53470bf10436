//! Cluster lifecycle events fanned out to in-process subscribers.

use crate::node::NodeId;
use crate::service::ServiceLifecycle;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodeConnected { node: NodeId },
    NodeDisconnected { node: NodeId },
    NodeEvicted { node: NodeId },
    HeadChanged { head: Option<NodeId> },
    ServiceLifecycleChanged { service: Uuid, lifecycle: ServiceLifecycle },
}

/// Broadcast hub for [`ClusterEvent`]s. Slow subscribers lag and miss
/// events rather than backpressuring the cluster.
#[derive(Debug, Clone)]
pub struct ClusterEventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl ClusterEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscriber is not an error.
    pub fn publish(&self, event: ClusterEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ClusterEventBus {
    fn default() -> Self {
        Self::new()
    }
}
