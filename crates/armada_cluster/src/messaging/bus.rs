//! Fan-out, local dispatch and query plumbing for channel messages.

use crate::error::ClusterError;
use crate::messaging::{ChannelMessage, MessageTarget};
use crate::node::{ClusterNodeProvider, NodeId};
use crate::service::ServiceRegistry;
use armada_network::{
    ChannelKey, ChannelRegistry, NetworkChannel, NetworkError, PacketListener,
};
use armada_protocol::{channel_ids, BufObject, DataBuf, Frame};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// In-process consumer of channel messages, keyed by exact
/// (channel, message) pair.
#[async_trait]
pub trait ChannelMessageListener: Send + Sync {
    /// Handles one message. For queries, the first listener returning a
    /// buffer answers; other return values are ignored.
    async fn handle(&self, message: &ChannelMessage) -> Result<Option<DataBuf>, ClusterError>;
}

type ListenerKey = (String, String);

/// Cluster message bus: resolves targets to peer channels, deduplicates
/// per connection, and dispatches to local listeners.
///
/// Delivery is best effort. A target that resolves to nothing is dropped
/// silently; a peer send failure is logged and does not fail the call.
pub struct MessagingBus {
    local_id: NodeId,
    provider: Arc<ClusterNodeProvider>,
    services: Arc<ServiceRegistry>,
    registry: Arc<ChannelRegistry>,
    listeners: DashMap<ListenerKey, Vec<Arc<dyn ChannelMessageListener>>>,
}

impl MessagingBus {
    pub fn new(
        local_id: NodeId,
        provider: Arc<ClusterNodeProvider>,
        services: Arc<ServiceRegistry>,
        registry: Arc<ChannelRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            provider,
            services,
            registry,
            listeners: DashMap::new(),
        })
    }

    pub fn register_listener(
        &self,
        channel: &str,
        message: &str,
        listener: Arc<dyn ChannelMessageListener>,
    ) {
        self.listeners
            .entry((channel.to_string(), message.to_string()))
            .or_default()
            .push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.iter().map(|e| e.value().len()).sum()
    }

    /// Sends a message to everything its targets resolve to.
    pub async fn send(&self, mut message: ChannelMessage) -> Result<(), ClusterError> {
        message.sender = self.local_id.clone();
        let (local, keys) = self.resolve(&message.targets);
        let body = Self::encode(&message)?;

        for key in &keys {
            let Some(channel) = self.registry.get(*key) else {
                trace!(channel = %key, "resolved channel vanished, dropping");
                continue;
            };
            if let Err(e) = channel.send(Frame::bare(channel_ids::MESSAGE, body.clone())) {
                debug!(channel = %key, error = %e, "message send failed");
            }
        }
        if local {
            self.dispatch_local(&message).await;
        }
        if !local && keys.is_empty() {
            trace!(
                channel = %message.channel,
                message = %message.message,
                "message resolved to no recipient"
            );
        }
        Ok(())
    }

    /// Sends as a query and collects every reply that arrives in time.
    pub async fn send_query(
        &self,
        mut message: ChannelMessage,
        timeout: Duration,
    ) -> Result<Vec<DataBuf>, ClusterError> {
        message.sender = self.local_id.clone();
        let (local, keys) = self.resolve(&message.targets);
        let body = Self::encode(&message)?;

        let channels: Vec<NetworkChannel> = keys
            .iter()
            .filter_map(|key| self.registry.get(*key))
            .collect();
        let queries = channels
            .iter()
            .map(|channel| channel.query(channel_ids::MESSAGE, body.clone(), timeout));

        let mut replies = Vec::new();
        if local {
            if let Some(reply) = self.dispatch_local(&message).await {
                replies.push(reply);
            }
        }
        for (channel, result) in channels.iter().zip(join_all(queries).await) {
            match result {
                Ok(reply) => replies.push(reply),
                Err(e) => debug!(channel = %channel.key(), error = %e, "message query failed"),
            }
        }
        Ok(replies)
    }

    /// Sends as a query and returns the first reply.
    pub async fn send_single_query(
        &self,
        mut message: ChannelMessage,
        timeout: Duration,
    ) -> Result<Option<DataBuf>, ClusterError> {
        message.sender = self.local_id.clone();
        let (local, keys) = self.resolve(&message.targets);

        if local {
            if let Some(reply) = self.dispatch_local(&message).await {
                return Ok(Some(reply));
            }
        }
        let body = Self::encode(&message)?;
        for key in keys {
            let Some(channel) = self.registry.get(key) else {
                continue;
            };
            match channel.query(channel_ids::MESSAGE, body.clone(), timeout).await {
                Ok(reply) => return Ok(Some(reply)),
                Err(e) => debug!(channel = %key, error = %e, "message query failed"),
            }
        }
        Ok(None)
    }

    /// Runs a message through the local listeners for its exact
    /// (channel, message) key. Returns the first reply a listener produced.
    pub async fn dispatch_local(&self, message: &ChannelMessage) -> Option<DataBuf> {
        let key = (message.channel.clone(), message.message.clone());
        let registered = match self.listeners.get(&key) {
            Some(entry) => entry.value().clone(),
            None => {
                trace!(
                    channel = %message.channel,
                    message = %message.message,
                    "no listener for message"
                );
                return None;
            }
        };

        let mut reply = None;
        for listener in &registered {
            match listener.handle(message).await {
                Ok(Some(response)) if reply.is_none() => reply = Some(response),
                Ok(_) => {}
                Err(e) => warn!(
                    channel = %message.channel,
                    message = %message.message,
                    error = %e,
                    "message listener failed"
                ),
            }
        }
        reply
    }

    /// Resolves targets into the local-delivery flag plus the deduplicated
    /// set of peer channels. Resolving twice onto the same connection folds
    /// into one entry.
    fn resolve(&self, targets: &[MessageTarget]) -> (bool, HashSet<ChannelKey>) {
        let mut local = false;
        let mut keys = HashSet::new();

        let route_node = |node: &NodeId, local: &mut bool, keys: &mut HashSet<ChannelKey>| {
            if node == &self.local_id {
                *local = true;
            } else if let Some(key) = self.provider.channel_key_of(node) {
                keys.insert(key);
            }
        };

        for target in targets {
            match target {
                MessageTarget::Node(id) => route_node(id, &mut local, &mut keys),
                MessageTarget::AllNodes => {
                    local = true;
                    for (_, key) in self.provider.connected_channels() {
                        keys.insert(key);
                    }
                }
                MessageTarget::Service(name) => {
                    if let Some(info) = self.services.by_name(name) {
                        if info.lifecycle.is_active() {
                            route_node(&info.id.node, &mut local, &mut keys);
                        }
                    }
                }
                MessageTarget::Task(name) => {
                    for info in self.services.by_task(name) {
                        if info.lifecycle.is_active() {
                            route_node(&info.id.node, &mut local, &mut keys);
                        }
                    }
                }
                MessageTarget::Group(name) => {
                    for info in self.services.by_group(name) {
                        if info.lifecycle.is_active() {
                            route_node(&info.id.node, &mut local, &mut keys);
                        }
                    }
                }
                MessageTarget::Environment(name) => {
                    for info in self.services.by_environment(name) {
                        if info.lifecycle.is_active() {
                            route_node(&info.id.node, &mut local, &mut keys);
                        }
                    }
                }
                MessageTarget::AllServices => {
                    for info in self.services.all() {
                        if info.lifecycle.is_active() {
                            route_node(&info.id.node, &mut local, &mut keys);
                        }
                    }
                }
            }
        }
        (local, keys)
    }

    fn encode(message: &ChannelMessage) -> Result<DataBuf, ClusterError> {
        let mut body = DataBuf::new();
        message.write_into(&mut body)?;
        Ok(body)
    }
}

/// Bridges inbound frames on the message wire channel into the bus.
pub struct MessagePacketListener {
    bus: Arc<MessagingBus>,
}

impl MessagePacketListener {
    pub fn new(bus: Arc<MessagingBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl PacketListener for MessagePacketListener {
    async fn handle(
        &self,
        _channel: &NetworkChannel,
        mut body: DataBuf,
    ) -> Result<Option<DataBuf>, NetworkError> {
        let message = ChannelMessage::read_from(&mut body)?;
        Ok(self.bus.dispatch_local(&message).await)
    }
}
