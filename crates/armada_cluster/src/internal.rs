//! # Internal cluster traffic
//!
//! Listeners for the reserved internal message channel plus the sync
//! handlers of the replicated tables. Together they keep every node's view
//! of the cluster converged: snapshots feed the membership table, lifecycle
//! broadcasts refresh the service registry, shutdown notices remove peers,
//! and the sync handlers reconcile tasks, groups and services when a node
//! joins. The local node registers everything here during assembly.

use crate::error::ClusterError;
use crate::events::{ClusterEvent, ClusterEventBus};
use crate::messaging::{ChannelMessage, ChannelMessageListener};
use crate::node::{ClusterNodeProvider, NodeId, NodeInfoSnapshot};
use crate::service::{
    ServiceGroup, ServiceGroupRegistry, ServiceInfo, ServiceRegistry, ServiceTask,
    ServiceTaskRegistry,
};
use crate::sync::{DataSyncHandler, DataSyncRegistry, SyncApplied};
use armada_network::{ChannelRegistry, NetworkChannel, NetworkError, PacketListener};
use armada_protocol::{
    failure_frame, BufObject, Bytes, ChunkAssembler, ChunkProgress, DataBuf, ProtocolError,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn serialize<T: BufObject>(value: &T) -> Result<DataBuf, ClusterError> {
    let mut buf = DataBuf::new();
    value.write_into(&mut buf)?;
    Ok(buf)
}

/// Applies peer snapshots carried by the heartbeat broadcast.
///
/// Snapshots about this node itself and snapshots from nodes that are not
/// configured members are dropped without error; neither is worth failing
/// the dispatch over.
pub struct SnapshotUpdateListener {
    provider: Arc<ClusterNodeProvider>,
}

impl SnapshotUpdateListener {
    pub fn new(provider: Arc<ClusterNodeProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChannelMessageListener for SnapshotUpdateListener {
    async fn handle(&self, message: &ChannelMessage) -> Result<Option<DataBuf>, ClusterError> {
        let mut content = message.content.clone();
        let snapshot = NodeInfoSnapshot::read_from(&mut content)?;
        if &snapshot.node.id == self.provider.local_id() {
            return Ok(None);
        }
        match self.provider.update_snapshot(snapshot) {
            Ok(()) => {}
            Err(ClusterError::UnknownNode(id)) => {
                debug!(node = %id, "snapshot from unconfigured node dropped");
            }
            Err(e) => return Err(e),
        }
        Ok(None)
    }
}

/// Keeps the replicated service table fresh from lifecycle broadcasts.
///
/// The content is the full [`ServiceInfo`] record, not just the lifecycle,
/// so a node that missed the creation broadcast still ends up with a
/// complete entry.
pub struct ServiceLifecycleListener {
    services: Arc<ServiceRegistry>,
    events: ClusterEventBus,
}

impl ServiceLifecycleListener {
    pub fn new(services: Arc<ServiceRegistry>, events: ClusterEventBus) -> Self {
        Self { services, events }
    }
}

#[async_trait]
impl ChannelMessageListener for ServiceLifecycleListener {
    async fn handle(&self, message: &ChannelMessage) -> Result<Option<DataBuf>, ClusterError> {
        let mut content = message.content.clone();
        let info = ServiceInfo::read_from(&mut content)?;
        let service = info.id.unique_id;
        let lifecycle = info.lifecycle;
        let previous = self.services.upsert(info);
        if previous.map(|p| p.lifecycle) != Some(lifecycle) {
            debug!(%service, %lifecycle, "service lifecycle updated");
            self.events
                .publish(ClusterEvent::ServiceLifecycleChanged { service, lifecycle });
        }
        Ok(None)
    }
}

/// Applies a received sync payload.
///
/// Elements the local handlers kept come back as the reply, force-flagged,
/// so a querying sender converges onto the authoritative data.
pub struct ClusterDataSyncListener {
    sync: Arc<DataSyncRegistry>,
}

impl ClusterDataSyncListener {
    pub fn new(sync: Arc<DataSyncRegistry>) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl ChannelMessageListener for ClusterDataSyncListener {
    async fn handle(&self, message: &ChannelMessage) -> Result<Option<DataBuf>, ClusterError> {
        let mut payload = message.content.clone();
        self.sync.apply_all(&mut payload)
    }
}

/// Answers a joining node's pull with the full local dataset.
pub struct InitialDataRequestListener {
    sync: Arc<DataSyncRegistry>,
}

impl InitialDataRequestListener {
    pub fn new(sync: Arc<DataSyncRegistry>) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl ChannelMessageListener for InitialDataRequestListener {
    async fn handle(&self, _message: &ChannelMessage) -> Result<Option<DataBuf>, ClusterError> {
        Ok(Some(self.sync.serialize_all(false)?))
    }
}

/// Reacts to shutdown notices.
///
/// The content names the node that is going away. A notice naming this
/// node is a drain request (the liveness checker broadcasts one per
/// eviction, so an evicted node that still hears the cluster stands down).
/// Any other id means that node left: disconnect it and mark its services
/// deleted.
pub struct NodeShutdownListener {
    provider: Arc<ClusterNodeProvider>,
    services: Arc<ServiceRegistry>,
    registry: Arc<ChannelRegistry>,
}

impl NodeShutdownListener {
    pub fn new(
        provider: Arc<ClusterNodeProvider>,
        services: Arc<ServiceRegistry>,
        registry: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            provider,
            services,
            registry,
        }
    }
}

#[async_trait]
impl ChannelMessageListener for NodeShutdownListener {
    async fn handle(&self, message: &ChannelMessage) -> Result<Option<DataBuf>, ClusterError> {
        let mut content = message.content.clone();
        let node = NodeId::read_from(&mut content)?;

        if &node == self.provider.local_id() {
            info!(from = %message.sender, "cluster requested local shutdown");
            self.provider.set_draining(true);
            return Ok(None);
        }

        if let Some(key) = self.provider.handle_remote_shutdown(&node) {
            if let Some(channel) = self.registry.get(key) {
                channel.close().await;
            }
        }
        for info in self.services.mark_node_deleted(&node) {
            self.provider
                .events()
                .publish(ClusterEvent::ServiceLifecycleChanged {
                    service: info.id.unique_id,
                    lifecycle: info.lifecycle,
                });
        }
        Ok(None)
    }
}

/// One fully reassembled chunked transfer.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub transfer_id: Uuid,
    pub payload: Bytes,
}

/// Reassembles inbound chunked transfers and hands finished payloads to
/// the consumer channel. A broken transfer answers the sender with a
/// failure frame instead of poisoning the connection.
pub struct TransferPacketListener {
    assembler: Mutex<ChunkAssembler>,
    completed: mpsc::UnboundedSender<CompletedTransfer>,
}

impl TransferPacketListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompletedTransfer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Self {
            assembler: Mutex::new(ChunkAssembler::new()),
            completed: tx,
        };
        (listener, rx)
    }
}

#[async_trait]
impl PacketListener for TransferPacketListener {
    async fn handle(
        &self,
        channel: &NetworkChannel,
        mut body: DataBuf,
    ) -> Result<Option<DataBuf>, NetworkError> {
        let progress = self.assembler.lock().await.handle_body(&mut body);
        match progress {
            Ok(ChunkProgress::Accepted { .. }) => Ok(None),
            Ok(ChunkProgress::Complete {
                transfer_id,
                payload,
            }) => {
                debug!(transfer = %transfer_id, bytes = payload.len(), "transfer complete");
                let _ = self.completed.send(CompletedTransfer {
                    transfer_id,
                    payload,
                });
                Ok(None)
            }
            Ok(ChunkProgress::Failed { transfer_id }) => {
                debug!(transfer = %transfer_id, "transfer aborted by sender");
                Ok(None)
            }
            Err(e) => {
                let broken = match &e {
                    ProtocolError::UnknownTransfer(id) => Some(*id),
                    ProtocolError::ChunkOutOfSequence { transfer_id, .. } => Some(*transfer_id),
                    _ => None,
                };
                let Some(transfer_id) = broken else {
                    return Err(e.into());
                };
                warn!(transfer = %transfer_id, error = %e, "transfer failed");
                if let Ok(frame) = failure_frame(transfer_id, 0) {
                    let _ = channel.send(frame);
                }
                Ok(None)
            }
        }
    }
}

/// Replicates service task templates. Local edits win a conflict; the
/// kept version is echoed back for the sender to adopt.
pub struct TaskSyncHandler {
    tasks: Arc<ServiceTaskRegistry>,
}

impl TaskSyncHandler {
    pub fn new(tasks: Arc<ServiceTaskRegistry>) -> Self {
        Self { tasks }
    }
}

impl DataSyncHandler for TaskSyncHandler {
    fn key(&self) -> &str {
        "service_tasks"
    }

    fn collect(&self) -> Result<Vec<DataBuf>, ClusterError> {
        self.tasks.all().iter().map(serialize).collect()
    }

    fn apply(&self, element: &mut DataBuf, force: bool) -> Result<SyncApplied, ClusterError> {
        let incoming = ServiceTask::read_from(element)?;
        match self.tasks.get(&incoming.name) {
            Some(existing) if existing != incoming && !force => {
                Ok(SyncApplied::Kept(serialize(&existing)?))
            }
            _ => {
                self.tasks.upsert(incoming);
                Ok(SyncApplied::Applied)
            }
        }
    }
}

/// Replicates service groups, same conflict rule as tasks.
pub struct GroupSyncHandler {
    groups: Arc<ServiceGroupRegistry>,
}

impl GroupSyncHandler {
    pub fn new(groups: Arc<ServiceGroupRegistry>) -> Self {
        Self { groups }
    }
}

impl DataSyncHandler for GroupSyncHandler {
    fn key(&self) -> &str {
        "service_groups"
    }

    fn collect(&self) -> Result<Vec<DataBuf>, ClusterError> {
        self.groups.all().iter().map(serialize).collect()
    }

    fn apply(&self, element: &mut DataBuf, force: bool) -> Result<SyncApplied, ClusterError> {
        let incoming = ServiceGroup::read_from(element)?;
        match self.groups.get(&incoming.name) {
            Some(existing) if existing != incoming && !force => {
                Ok(SyncApplied::Kept(serialize(&existing)?))
            }
            _ => {
                self.groups.upsert(incoming);
                Ok(SyncApplied::Applied)
            }
        }
    }
}

/// Replicates the live service table.
///
/// Runtime state has no meaningful conflict resolution, whoever reported
/// last is right, so received records are adopted wholesale.
pub struct ServiceSyncHandler {
    services: Arc<ServiceRegistry>,
    events: ClusterEventBus,
}

impl ServiceSyncHandler {
    pub fn new(services: Arc<ServiceRegistry>, events: ClusterEventBus) -> Self {
        Self { services, events }
    }
}

impl DataSyncHandler for ServiceSyncHandler {
    fn key(&self) -> &str {
        "services"
    }

    fn always_force(&self) -> bool {
        true
    }

    fn collect(&self) -> Result<Vec<DataBuf>, ClusterError> {
        self.services.all().iter().map(serialize).collect()
    }

    fn apply(&self, element: &mut DataBuf, _force: bool) -> Result<SyncApplied, ClusterError> {
        let incoming = ServiceInfo::read_from(element)?;
        let service = incoming.id.unique_id;
        let lifecycle = incoming.lifecycle;
        let previous = self.services.upsert(incoming);
        if previous.map(|p| p.lifecycle) != Some(lifecycle) {
            self.events
                .publish(ClusterEvent::ServiceLifecycleChanged { service, lifecycle });
        }
        Ok(SyncApplied::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{internal, MessageTarget};
    use crate::node::{epoch_millis, ListenerAddress, NetworkClusterNode};
    use crate::service::{ServiceId, ServiceLifecycle};
    use armada_network::{spawn_channel, AcceptAllHandler, ChannelKey, NetworkContext};
    use armada_protocol::{channel_ids, split_into_frames};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn member(id: &str) -> NetworkClusterNode {
        NetworkClusterNode::new(NodeId::from(id), vec![ListenerAddress::new("10.0.0.9", 1410)])
    }

    fn provider_with(local: &str, peers: &[&str]) -> Arc<ClusterNodeProvider> {
        let provider =
            ClusterNodeProvider::new(member(local), Duration::from_secs(30), ClusterEventBus::new());
        for peer in peers {
            provider.register_member(member(peer));
        }
        provider
    }

    fn snapshot_for(node: &str, service_count: u32) -> NodeInfoSnapshot {
        NodeInfoSnapshot {
            node: member(node),
            creation_time: epoch_millis(),
            startup_time: 0,
            draining: false,
            service_count,
            average_tick_millis: 0.0,
            modules: Vec::new(),
            version: "0.1.0".to_string(),
        }
    }

    fn service_on(task: &str, idx: u32, node: &str) -> ServiceInfo {
        ServiceInfo {
            id: ServiceId {
                unique_id: Uuid::new_v4(),
                task_name: task.to_string(),
                task_service_id: idx,
                node: NodeId::from(node),
                environment: "minecraft".to_string(),
            },
            lifecycle: ServiceLifecycle::Running,
            address: ListenerAddress::new("127.0.0.1", 25565),
            groups: Vec::new(),
            properties: HashMap::new(),
            creation_time: epoch_millis(),
        }
    }

    fn task(name: &str, min: u32) -> ServiceTask {
        ServiceTask {
            name: name.to_string(),
            environment: "minecraft".to_string(),
            min_service_count: min,
            associated_nodes: Vec::new(),
            groups: Vec::new(),
        }
    }

    fn internal_message(message: &str, content: DataBuf) -> ChannelMessage {
        ChannelMessage::builder()
            .channel(internal::CHANNEL)
            .message(message)
            .sender(NodeId::from("Node-9"))
            .target(MessageTarget::AllNodes)
            .buffer(content)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn snapshot_listener_updates_the_membership_table() {
        let provider = provider_with("Node-1", &["Node-2"]);
        provider
            .handle_connected(&NodeId::from("Node-2"), ChannelKey::next())
            .unwrap();
        let listener = SnapshotUpdateListener::new(provider.clone());

        let content = serialize(&snapshot_for("Node-2", 3)).unwrap();
        listener
            .handle(&internal_message(internal::UPDATE_NODE_INFO_SNAPSHOT, content))
            .await
            .unwrap();

        let snapshot = provider.node_snapshot(&NodeId::from("Node-2")).unwrap();
        assert_eq!(snapshot.service_count, 3);
    }

    #[tokio::test]
    async fn snapshot_of_unknown_or_local_node_is_dropped() {
        let provider = provider_with("Node-1", &[]);
        let listener = SnapshotUpdateListener::new(provider.clone());

        // Neither an unconfigured peer nor a reflected own snapshot errors.
        let content = serialize(&snapshot_for("Node-7", 0)).unwrap();
        listener
            .handle(&internal_message(internal::UPDATE_NODE_INFO_SNAPSHOT, content))
            .await
            .unwrap();
        let content = serialize(&snapshot_for("Node-1", 0)).unwrap();
        listener
            .handle(&internal_message(internal::UPDATE_NODE_INFO_SNAPSHOT, content))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lifecycle_listener_upserts_and_publishes_once() {
        let services = Arc::new(ServiceRegistry::new());
        let events = ClusterEventBus::new();
        let mut rx = events.subscribe();
        let listener = ServiceLifecycleListener::new(services.clone(), events);

        let info = service_on("lobby", 1, "Node-2");
        let id = info.id.unique_id;
        let content = serialize(&info).unwrap();
        listener
            .handle(&internal_message(internal::UPDATE_SERVICE_LIFECYCLE, content.clone()))
            .await
            .unwrap();

        assert_eq!(services.get(&id).unwrap().lifecycle, ServiceLifecycle::Running);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClusterEvent::ServiceLifecycleChanged { service, lifecycle: ServiceLifecycle::Running } if service == id
        ));

        // Replaying the same lifecycle is not an event.
        listener
            .handle(&internal_message(internal::UPDATE_SERVICE_LIFECYCLE, content))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_notice_naming_this_node_starts_drain() {
        let provider = provider_with("Node-1", &["Node-2"]);
        let services = Arc::new(ServiceRegistry::new());
        let registry = Arc::new(ChannelRegistry::new());
        let listener = NodeShutdownListener::new(provider.clone(), services, registry);

        let content = serialize(&NodeId::from("Node-1")).unwrap();
        listener
            .handle(&internal_message(internal::CLUSTER_NODE_SHUTDOWN, content))
            .await
            .unwrap();
        assert!(provider.is_draining());
    }

    #[tokio::test]
    async fn shutdown_notice_for_a_peer_removes_it_and_its_services() {
        let provider = provider_with("Node-1", &["Node-2"]);
        provider
            .handle_connected(&NodeId::from("Node-2"), ChannelKey::next())
            .unwrap();
        let services = Arc::new(ServiceRegistry::new());
        services.upsert(service_on("lobby", 1, "Node-2"));
        services.upsert(service_on("lobby", 2, "Node-3"));
        let registry = Arc::new(ChannelRegistry::new());
        let listener = NodeShutdownListener::new(provider.clone(), services.clone(), registry);

        let content = serialize(&NodeId::from("Node-2")).unwrap();
        listener
            .handle(&internal_message(internal::CLUSTER_NODE_SHUTDOWN, content))
            .await
            .unwrap();

        assert!(!provider.is_draining());
        assert_eq!(
            provider.node_state(&NodeId::from("Node-2")),
            Some(crate::node::NodeState::Disconnected)
        );
        // Only Node-2's services flip to deleted.
        assert_eq!(services.count_active_for_node(&NodeId::from("Node-2")), 0);
        assert_eq!(services.count_active_for_node(&NodeId::from("Node-3")), 1);
    }

    #[tokio::test]
    async fn initial_data_request_carries_every_table() {
        let tasks = Arc::new(ServiceTaskRegistry::new());
        tasks.upsert(task("lobby", 2));
        let groups = Arc::new(ServiceGroupRegistry::new());
        groups.upsert(ServiceGroup {
            name: "global".to_string(),
            environments: vec!["minecraft".to_string()],
        });
        let sync = Arc::new(DataSyncRegistry::new());
        sync.register(Arc::new(TaskSyncHandler::new(tasks)));
        sync.register(Arc::new(GroupSyncHandler::new(groups)));
        let listener = InitialDataRequestListener::new(sync);

        let reply = listener
            .handle(&internal_message(
                internal::REQUEST_INITIAL_CLUSTER_DATA,
                DataBuf::new(),
            ))
            .await
            .unwrap();
        let mut reply = reply.expect("request must be answered");

        // A fresh node applies the reply and ends up with both tables.
        let joiner_tasks = Arc::new(ServiceTaskRegistry::new());
        let joiner_groups = Arc::new(ServiceGroupRegistry::new());
        let joiner = Arc::new(DataSyncRegistry::new());
        joiner.register(Arc::new(TaskSyncHandler::new(joiner_tasks.clone())));
        joiner.register(Arc::new(GroupSyncHandler::new(joiner_groups.clone())));
        assert!(joiner.apply_all(&mut reply).unwrap().is_none());
        assert_eq!(joiner_tasks.get("lobby").unwrap().min_service_count, 2);
        assert!(joiner_groups.get("global").is_some());
    }

    #[tokio::test]
    async fn conflicting_task_is_kept_and_converges_via_echo() {
        let local_tasks = Arc::new(ServiceTaskRegistry::new());
        local_tasks.upsert(task("lobby", 5));
        let local = Arc::new(DataSyncRegistry::new());
        local.register(Arc::new(TaskSyncHandler::new(local_tasks.clone())));

        let remote_tasks = Arc::new(ServiceTaskRegistry::new());
        remote_tasks.upsert(task("lobby", 1));
        let remote = Arc::new(DataSyncRegistry::new());
        remote.register(Arc::new(TaskSyncHandler::new(remote_tasks.clone())));

        let mut payload = remote.serialize_all(false).unwrap();
        let mut echo = local.apply_all(&mut payload).unwrap().expect("conflict echo");
        assert_eq!(local_tasks.get("lobby").unwrap().min_service_count, 5);

        assert!(remote.apply_all(&mut echo).unwrap().is_none());
        assert_eq!(remote_tasks.get("lobby").unwrap().min_service_count, 5);
    }

    #[tokio::test]
    async fn service_table_sync_adopts_remote_state() {
        let events = ClusterEventBus::new();
        let local_services = Arc::new(ServiceRegistry::new());
        let info = service_on("lobby", 1, "Node-2");
        let id = info.id.unique_id;
        let mut stale = info.clone();
        stale.lifecycle = ServiceLifecycle::Prepared;
        local_services.upsert(stale);
        let local = Arc::new(DataSyncRegistry::new());
        local.register(Arc::new(ServiceSyncHandler::new(
            local_services.clone(),
            events.clone(),
        )));

        let remote_services = Arc::new(ServiceRegistry::new());
        remote_services.upsert(info);
        let remote = Arc::new(DataSyncRegistry::new());
        remote.register(Arc::new(ServiceSyncHandler::new(remote_services, events)));

        let mut payload = remote.serialize_all(false).unwrap();
        assert!(local.apply_all(&mut payload).unwrap().is_none());
        assert_eq!(
            local_services.get(&id).unwrap().lifecycle,
            ServiceLifecycle::Running
        );
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transfer_frames_reassemble_into_a_completed_payload() {
        let ctx_a = NetworkContext::new(Arc::new(AcceptAllHandler));
        let ctx_b = NetworkContext::new(Arc::new(AcceptAllHandler));
        let (listener, mut completed) = TransferPacketListener::new();
        ctx_b.listeners.register(channel_ids::TRANSFER, Arc::new(listener));

        let (stream_a, stream_b) = tokio::io::duplex(256 * 1024);
        let ch_a = spawn_channel(stream_a, test_addr(), true, &ctx_a).await.unwrap();
        let _ch_b = spawn_channel(stream_b, test_addr(), false, &ctx_b).await.unwrap();

        let transfer_id = Uuid::new_v4();
        let payload = vec![0x42u8; 300_000];
        for frame in split_into_frames(transfer_id, &payload, 64 * 1024).unwrap() {
            ch_a.send(frame).unwrap();
        }

        let done = timeout(Duration::from_secs(2), completed.recv())
            .await
            .expect("transfer timed out")
            .unwrap();
        assert_eq!(done.transfer_id, transfer_id);
        assert_eq!(done.payload.len(), payload.len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broken_transfer_answers_with_a_failure_frame() {
        let ctx_a = NetworkContext::new(Arc::new(AcceptAllHandler));
        let ctx_b = NetworkContext::new(Arc::new(AcceptAllHandler));
        let (listener_b, _completed_b) = TransferPacketListener::new();
        ctx_b.listeners.register(channel_ids::TRANSFER, Arc::new(listener_b));

        let (stream_a, stream_b) = tokio::io::duplex(256 * 1024);
        let ch_a = spawn_channel(stream_a, test_addr(), true, &ctx_a).await.unwrap();
        let ch_b = spawn_channel(stream_b, test_addr(), false, &ctx_b).await.unwrap();

        // A mid-transfer chunk with no opened session is a broken transfer.
        let transfer_id = Uuid::new_v4();
        let frames = split_into_frames(transfer_id, &[1u8; 500], 100).unwrap();
        ch_a.send(frames[3].clone()).unwrap();

        // The failure notice comes back on the transfer channel.
        timeout(Duration::from_secs(2), async {
            while ch_a.stats().frames_received == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no failure frame received");
        assert!(!ch_b.is_closed());
    }
}
