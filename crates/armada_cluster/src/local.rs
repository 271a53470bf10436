//! # Local node
//!
//! The assembly root of one cluster member. [`LocalNode`] owns the network
//! context, the membership provider, the domain registries and the tick
//! scheduler, wires every packet and message listener together and runs the
//! recurring cluster duties: heartbeat, liveness checks, the head node's
//! minimum-instance policy and the drain watch.
//!
//! Construction is pure wiring; nothing touches the network until
//! [`LocalNode::start`] binds the listener and spawns the dial loop.

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::events::{ClusterEvent, ClusterEventBus};
use crate::internal::{
    ClusterDataSyncListener, CompletedTransfer, GroupSyncHandler, InitialDataRequestListener,
    NodeShutdownListener, ServiceLifecycleListener, ServiceSyncHandler, SnapshotUpdateListener,
    TaskSyncHandler, TransferPacketListener,
};
use crate::messaging::{
    internal, ChannelMessage, MessagePacketListener, MessageTarget, MessagingBus,
};
use crate::node::{
    epoch_millis, ClusterChannelHandler, ClusterNodeProvider, ListenerAddress, NodeAuthListener,
    NodeId,
};
use crate::scheduler::TickScheduler;
use crate::service::{
    LockPool, ServiceGroupRegistry, ServiceId, ServiceInfo, ServiceLifecycle, ServiceRegistry,
    ServiceTask, ServiceTaskRegistry,
};
use crate::sync::DataSyncRegistry;
use armada_network::{
    NetworkChannel, NetworkClient, NetworkContext, NetworkServer, RpcHandlerRegistry,
    RpcPacketListener, RpcSender, StreamAcceptor, StreamConnector, SWEEP_INTERVAL,
};
use armada_protocol::{channel_ids, split_into_frames, BufObject, DataBuf, DEFAULT_CHUNK_SIZE};
use futures::FutureExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A running cluster member.
///
/// Embedders build one from a [`ClusterConfig`], call [`start`](Self::start)
/// and hold on to the `Arc` for the lifetime of the process. The node joins
/// its configured peers on its own; [`shutdown`](Self::shutdown) leaves the
/// cluster cleanly. A stopped node cannot be restarted; build a fresh one to
/// rejoin.
pub struct LocalNode {
    config: ClusterConfig,
    ctx: Arc<NetworkContext>,
    provider: Arc<ClusterNodeProvider>,
    services: Arc<ServiceRegistry>,
    tasks: Arc<ServiceTaskRegistry>,
    groups: Arc<ServiceGroupRegistry>,
    bus: Arc<MessagingBus>,
    sync: Arc<DataSyncRegistry>,
    scheduler: Arc<TickScheduler>,
    events: ClusterEventBus,
    service_locks: LockPool,
    connector: StreamConnector,
    acceptor: StreamAcceptor,
    started: AtomicBool,
    bound_addr: OnceLock<SocketAddr>,
    server: Mutex<Option<NetworkServer>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    transfers: std::sync::Mutex<Option<mpsc::UnboundedReceiver<CompletedTransfer>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl LocalNode {
    pub fn new(config: ClusterConfig) -> Result<Arc<Self>, ClusterError> {
        Self::with_transport(config, StreamConnector::default(), StreamAcceptor::default())
    }

    /// Builds a node that dials and accepts through the given transports,
    /// which is how TLS-enabled deployments are assembled.
    pub fn with_transport(
        config: ClusterConfig,
        connector: StreamConnector,
        acceptor: StreamAcceptor,
    ) -> Result<Arc<Self>, ClusterError> {
        config.validate()?;

        let events = ClusterEventBus::new();
        let provider = ClusterNodeProvider::new(
            config.local.clone(),
            config.max_no_update,
            events.clone(),
        );
        provider.apply_members(config.members.clone());

        let handler = Arc::new(ClusterChannelHandler::new(provider.clone()));
        let ctx = NetworkContext::with_max_frame_size(handler, config.max_frame_size);

        let services = Arc::new(ServiceRegistry::new());
        let tasks = Arc::new(ServiceTaskRegistry::new());
        let groups = Arc::new(ServiceGroupRegistry::new());
        let bus = MessagingBus::new(
            provider.local_id().clone(),
            provider.clone(),
            services.clone(),
            ctx.registry.clone(),
        );

        let sync = Arc::new(DataSyncRegistry::new());
        sync.register(Arc::new(TaskSyncHandler::new(tasks.clone())));
        sync.register(Arc::new(GroupSyncHandler::new(groups.clone())));
        sync.register(Arc::new(ServiceSyncHandler::new(
            services.clone(),
            events.clone(),
        )));
        provider.set_modules(sync.keys());

        ctx.listeners.register(
            channel_ids::RAW,
            Arc::new(NodeAuthListener::new(provider.clone())),
        );
        ctx.listeners.register(
            channel_ids::MESSAGE,
            Arc::new(MessagePacketListener::new(bus.clone())),
        );
        ctx.listeners.register(
            channel_ids::RPC,
            Arc::new(RpcPacketListener::new(rpc_bindings(
                &provider, &services, &tasks, &groups,
            ))),
        );
        let (transfer_listener, completed_transfers) = TransferPacketListener::new();
        ctx.listeners
            .register(channel_ids::TRANSFER, Arc::new(transfer_listener));

        bus.register_listener(
            internal::CHANNEL,
            internal::UPDATE_NODE_INFO_SNAPSHOT,
            Arc::new(SnapshotUpdateListener::new(provider.clone())),
        );
        bus.register_listener(
            internal::CHANNEL,
            internal::UPDATE_SERVICE_LIFECYCLE,
            Arc::new(ServiceLifecycleListener::new(
                services.clone(),
                events.clone(),
            )),
        );
        bus.register_listener(
            internal::CHANNEL,
            internal::SYNC_CLUSTER_DATA,
            Arc::new(ClusterDataSyncListener::new(sync.clone())),
        );
        bus.register_listener(
            internal::CHANNEL,
            internal::REQUEST_INITIAL_CLUSTER_DATA,
            Arc::new(InitialDataRequestListener::new(sync.clone())),
        );
        bus.register_listener(
            internal::CHANNEL,
            internal::CLUSTER_NODE_SHUTDOWN,
            Arc::new(NodeShutdownListener::new(
                provider.clone(),
                services.clone(),
                ctx.registry.clone(),
            )),
        );

        let scheduler = TickScheduler::new(config.ticks_per_second);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            ctx,
            provider,
            services,
            tasks,
            groups,
            bus,
            sync,
            scheduler,
            events,
            service_locks: LockPool::new(),
            connector,
            acceptor,
            started: AtomicBool::new(false),
            bound_addr: OnceLock::new(),
            server: Mutex::new(None),
            background: Mutex::new(Vec::new()),
            transfers: std::sync::Mutex::new(Some(completed_transfers)),
            shutdown_tx,
        }))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn local_id(&self) -> &NodeId {
        self.provider.local_id()
    }

    pub fn provider(&self) -> &Arc<ClusterNodeProvider> {
        &self.provider
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn tasks(&self) -> &Arc<ServiceTaskRegistry> {
        &self.tasks
    }

    pub fn groups(&self) -> &Arc<ServiceGroupRegistry> {
        &self.groups
    }

    pub fn bus(&self) -> &Arc<MessagingBus> {
        &self.bus
    }

    pub fn sync(&self) -> &Arc<DataSyncRegistry> {
        &self.sync
    }

    pub fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.scheduler
    }

    pub fn events(&self) -> &ClusterEventBus {
        &self.events
    }

    /// The address the cluster listener actually bound, once started. With a
    /// configured port of zero this is where the ephemeral port shows up.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get().copied()
    }

    /// Resolves to `true` once the node wants the process to exit, either
    /// after [`shutdown`](Self::shutdown) or when a drain completed.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Hands out the stream of completed inbound transfers. There is one
    /// receiver; the second call returns `None`.
    pub fn take_transfer_receiver(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<CompletedTransfer>> {
        self.transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Binds the cluster listener, starts the tick loop and begins dialing
    /// the configured members. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClusterError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Subscribed before the listener goes live so no join is missed.
        let cluster_events = self.events.subscribe();

        let server = match NetworkServer::bind_with(
            self.config.bind_address,
            self.ctx.clone(),
            self.acceptor.clone(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let addr = server.local_addr();
        let _ = self.bound_addr.set(addr);
        *self.server.lock().await = Some(server);
        info!(node = %self.provider.local_id(), %addr, "cluster listener bound");

        self.ctx.query_manager.start_sweeper(SWEEP_INTERVAL);
        self.install_cluster_duties();
        self.scheduler.start();

        let mut background = self.background.lock().await;
        background.push(tokio::spawn(run_join_sync(
            self.clone(),
            cluster_events,
            self.shutdown_tx.subscribe(),
        )));
        background.push(tokio::spawn(run_reconnect_loop(
            self.clone(),
            self.shutdown_tx.subscribe(),
        )));
        Ok(())
    }

    fn install_cluster_duties(self: &Arc<Self>) {
        let node = self.clone();
        self.scheduler
            .schedule_periodic(self.config.heartbeat_interval, None, move || {
                let node = node.clone();
                async move { node.broadcast_snapshot().await }.boxed()
            });

        let node = self.clone();
        self.scheduler.add_tick_hook(move || {
            let node = node.clone();
            async move { node.liveness_duty().await }.boxed()
        });

        let node = self.clone();
        self.scheduler.add_tick_hook(move || {
            let node = node.clone();
            async move { node.autostart_duty().await }.boxed()
        });

        let node = self.clone();
        self.scheduler.add_tick_hook(move || {
            let node = node.clone();
            async move { node.drain_duty().await }.boxed()
        });
    }

    /// Publishes the local snapshot so peers refresh their liveness and
    /// election view of this node.
    async fn broadcast_snapshot(&self) {
        let snapshot = self.provider.local_snapshot(
            self.services.count_active_for_node(self.provider.local_id()) as u32,
            self.scheduler.average_tick_millis(),
        );
        let outcome = encode(&snapshot).and_then(|content| {
            internal_message(
                internal::UPDATE_NODE_INFO_SNAPSHOT,
                MessageTarget::AllNodes,
                content,
            )
        });
        match outcome {
            Ok(message) => {
                if let Err(e) = self.bus.send(message).await {
                    debug!(error = %e, "snapshot broadcast failed");
                }
            }
            Err(e) => debug!(error = %e, "snapshot not serialized"),
        }
    }

    /// Drops members that stopped updating and tells the rest of the cluster.
    async fn liveness_duty(&self) {
        for evicted in self.provider.check_liveness(epoch_millis()) {
            warn!(node = %evicted.id, "member went stale, evicting");
            if let Some(key) = evicted.channel {
                if let Some(channel) = self.ctx.registry.get(key) {
                    channel.close().await;
                }
            }
            // The broadcast also dispatches locally, which clears the
            // evicted node's service records.
            let outcome = encode(&evicted.id).and_then(|content| {
                internal_message(
                    internal::CLUSTER_NODE_SHUTDOWN,
                    MessageTarget::AllNodes,
                    content,
                )
            });
            match outcome {
                Ok(notice) => {
                    if let Err(e) = self.bus.send(notice).await {
                        debug!(error = %e, "eviction notice not delivered");
                    }
                }
                Err(e) => debug!(error = %e, "eviction notice not built"),
            }
        }
    }

    /// Head-only duty: keep every task at its configured minimum. One start
    /// per task per tick so placement always works from fresh counts.
    async fn autostart_duty(&self) {
        if !self.provider.is_head() || self.provider.is_draining() {
            return;
        }
        for task in self.tasks.all() {
            if task.min_service_count == 0 {
                continue;
            }
            let active = self.services.count_active_for_task(&task.name) as u32;
            if active >= task.min_service_count {
                continue;
            }
            match self.start_service(&task.name).await {
                Ok(info) => {
                    info!(service = %info.id.name(), node = %info.id.node, "started service below task minimum");
                }
                Err(e) => debug!(task = %task.name, error = %e, "autostart attempt failed"),
            }
        }
    }

    async fn drain_duty(&self) {
        if self.provider.is_draining()
            && self.services.count_active_for_node(self.provider.local_id()) == 0
        {
            self.shutdown_tx.send_if_modified(|requested| {
                if *requested {
                    false
                } else {
                    *requested = true;
                    true
                }
            });
        }
    }

    /// Creates one new service from the named task.
    ///
    /// Picks the least loaded eligible node, allocates the next numeric id
    /// within the task and announces the prepared record to the whole
    /// cluster. The record starts with port 0; the hosting runtime reports
    /// the real port with its first lifecycle update.
    pub async fn start_service(&self, task_name: &str) -> Result<ServiceInfo, ClusterError> {
        let task = self
            .tasks
            .get(task_name)
            .ok_or_else(|| ClusterError::UnknownTask(task_name.to_string()))?;
        // Serialized per task so concurrent starts cannot reuse an id.
        let _guard = self.service_locks.lock(task_name).await;

        let node = self.pick_node(&task)?;
        let task_service_id = self
            .services
            .by_task(&task.name)
            .iter()
            .map(|s| s.id.task_service_id)
            .max()
            .unwrap_or(0)
            + 1;
        let host = self.listener_host_of(&node);
        let info = ServiceInfo {
            id: ServiceId {
                unique_id: Uuid::new_v4(),
                task_name: task.name.clone(),
                task_service_id,
                node,
                environment: task.environment.clone(),
            },
            lifecycle: ServiceLifecycle::Prepared,
            address: ListenerAddress::new(host, 0),
            groups: task.groups.clone(),
            properties: HashMap::new(),
            creation_time: epoch_millis(),
        };
        self.publish_service(&info).await?;
        Ok(info)
    }

    /// Moves a known service into a new lifecycle and announces the change.
    pub async fn update_service_lifecycle(
        &self,
        service: &Uuid,
        lifecycle: ServiceLifecycle,
    ) -> Result<ServiceInfo, ClusterError> {
        let mut info = self
            .services
            .get(service)
            .ok_or_else(|| ClusterError::UnknownService(service.to_string()))?;
        info.lifecycle = lifecycle;
        self.publish_service(&info).await?;
        Ok(info)
    }

    /// Least loaded among the available nodes and, unless draining, this
    /// one. Tasks pinned to specific nodes only consider those.
    fn pick_node(&self, task: &ServiceTask) -> Result<NodeId, ClusterError> {
        let mut candidates = self.provider.available_node_ids();
        if !self.provider.is_draining() {
            candidates.push(self.provider.local_id().clone());
        }
        if !task.associated_nodes.is_empty() {
            candidates.retain(|id| task.associated_nodes.contains(id));
        }
        candidates.sort();
        candidates
            .into_iter()
            .min_by_key(|id| self.services.count_active_for_node(id))
            .ok_or_else(|| ClusterError::NoNodeAvailable(task.name.clone()))
    }

    fn listener_host_of(&self, node: &NodeId) -> String {
        let listeners = if node == self.provider.local_id() {
            self.provider.local_node().listeners.clone()
        } else {
            self.provider
                .node_entry(node)
                .map(|entry| entry.node().listeners.clone())
                .unwrap_or_default()
        };
        listeners
            .into_iter()
            .next()
            .map(|listener| listener.host)
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Announces a service record cluster-wide. Local state is updated by
    /// the same listener path every other node runs.
    async fn publish_service(&self, info: &ServiceInfo) -> Result<(), ClusterError> {
        let content = encode(info)?;
        let message = internal_message(
            internal::UPDATE_SERVICE_LIFECYCLE,
            MessageTarget::AllNodes,
            content,
        )?;
        self.bus.send(message).await
    }

    /// Asks a peer for one of its task templates over RPC, bypassing the
    /// local registry.
    pub async fn remote_service_task(
        &self,
        node: &NodeId,
        name: &str,
    ) -> Result<Option<ServiceTask>, ClusterError> {
        let channel = self.channel_to(node)?;
        let reply = RpcSender::new("ServiceTaskProvider")
            .timeout(self.config.query_timeout)
            .call("service_task")
            .arg(&name.to_string())?
            .fire_and_wait(&channel)
            .await?;
        Ok(reply)
    }

    /// Streams a payload to a peer in chunks on the transfer channel and
    /// returns the transfer id the receiver will observe.
    pub fn send_transfer(&self, node: &NodeId, payload: &[u8]) -> Result<Uuid, ClusterError> {
        let channel = self.channel_to(node)?;
        let transfer_id = Uuid::new_v4();
        for frame in split_into_frames(transfer_id, payload, DEFAULT_CHUNK_SIZE)? {
            channel.send(frame)?;
        }
        Ok(transfer_id)
    }

    /// Pushes the local dataset to every connected node and folds their
    /// kept-entry echoes back in.
    pub async fn sync_cluster_data(&self) -> Result<(), ClusterError> {
        let payload = self.sync.serialize_all(false)?;
        let message = internal_message(
            internal::SYNC_CLUSTER_DATA,
            MessageTarget::AllNodes,
            payload,
        )?;
        for mut echo in self.bus.send_query(message, self.config.query_timeout).await? {
            if let Err(e) = self.sync.apply_all(&mut echo) {
                warn!(error = %e, "sync echo rejected");
            }
        }
        Ok(())
    }

    fn channel_to(&self, node: &NodeId) -> Result<NetworkChannel, ClusterError> {
        self.provider
            .channel_key_of(node)
            .and_then(|key| self.ctx.registry.get(key))
            .ok_or_else(|| ClusterError::NodeUnreachable(node.clone()))
    }

    /// Asks a freshly connected peer for its full dataset, applies it and
    /// pushes back whatever was kept locally so both sides converge.
    async fn pull_initial_data(&self, peer: &NodeId) {
        let request = match internal_message(
            internal::REQUEST_INITIAL_CLUSTER_DATA,
            MessageTarget::Node(peer.clone()),
            DataBuf::new(),
        ) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "initial data request not built");
                return;
            }
        };
        let mut payload = match self
            .bus
            .send_single_query(request, self.config.query_timeout)
            .await
        {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(node = %peer, "peer offered no initial data");
                return;
            }
            Err(e) => {
                warn!(node = %peer, error = %e, "initial data pull failed");
                return;
            }
        };
        match self.sync.apply_all(&mut payload) {
            Ok(None) => info!(node = %peer, "initial cluster data applied"),
            Ok(Some(echo)) => {
                info!(node = %peer, "initial cluster data applied, pushing kept entries back");
                let outcome = internal_message(
                    internal::SYNC_CLUSTER_DATA,
                    MessageTarget::Node(peer.clone()),
                    echo,
                );
                match outcome {
                    Ok(message) => {
                        if let Err(e) = self.bus.send(message).await {
                            warn!(node = %peer, error = %e, "sync echo not delivered");
                        }
                    }
                    Err(e) => warn!(error = %e, "sync echo not built"),
                }
            }
            Err(e) => warn!(node = %peer, error = %e, "initial cluster data rejected"),
        }
    }

    async fn dial_missing(&self, client: &NetworkClient) {
        if self.provider.is_draining() {
            return;
        }
        let local = self.provider.local_id().clone();
        for id in self.provider.registered_node_ids() {
            if id <= local {
                continue;
            }
            if self
                .provider
                .node_state(&id)
                .is_some_and(|state| state.is_connected())
            {
                continue;
            }
            let Some(entry) = self.provider.node_entry(&id) else {
                continue;
            };
            'listeners: for listener in &entry.node().listeners {
                for addr in resolve_listener(listener).await {
                    match client.connect(addr, &self.ctx).await {
                        Ok(channel) => {
                            debug!(node = %id, peer = %addr, channel = %channel.key(), "dialed cluster member");
                            break 'listeners;
                        }
                        Err(e) => {
                            debug!(node = %id, peer = %addr, error = %e, "dial attempt failed");
                        }
                    }
                }
            }
        }
    }

    /// Leaves the cluster and releases every resource.
    ///
    /// Peers are told first so they record a clean departure instead of an
    /// eviction later.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.provider.local_id(), "local node shutting down");
        self.provider.set_draining(true);

        let farewell = encode(self.provider.local_id()).and_then(|content| {
            internal_message(
                internal::CLUSTER_NODE_SHUTDOWN,
                MessageTarget::AllNodes,
                content,
            )
        });
        match farewell {
            Ok(notice) => {
                if let Err(e) = self.bus.send(notice).await {
                    debug!(error = %e, "shutdown notice not delivered");
                }
            }
            Err(e) => debug!(error = %e, "shutdown notice not built"),
        }

        let _ = self.shutdown_tx.send(true);
        for task in self.background.lock().await.drain(..) {
            let _ = task.await;
        }
        self.scheduler.shutdown().await;
        if let Some(server) = self.server.lock().await.take() {
            server.shutdown().await;
        }
        self.ctx.registry.close_all().await;
        self.ctx.query_manager.stop_sweeper();
        info!(node = %self.provider.local_id(), "local node stopped");
    }
}

/// Watches the event stream and pulls cluster data from every peer this node
/// dialed. The accepting side gets corrected in turn by its own dialers.
async fn run_join_sync(
    node: Arc<LocalNode>,
    mut events: broadcast::Receiver<ClusterEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClusterEvent::NodeConnected { node: peer }) => {
                    let dialed = node
                        .provider
                        .channel_key_of(&peer)
                        .and_then(|key| node.ctx.registry.get(key))
                        .is_some_and(|channel| channel.is_client_side());
                    if dialed {
                        node.pull_initial_data(&peer).await;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "cluster event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Dials not-yet-connected members on a fixed interval. Only members with an
/// id greater than the local one are dialed, which leaves exactly one dialer
/// per node pair.
async fn run_reconnect_loop(node: Arc<LocalNode>, mut shutdown: watch::Receiver<bool>) {
    let client = NetworkClient::with_connector(node.connector.clone());
    let mut interval = tokio::time::interval(node.config.reconnect_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => node.dial_missing(&client).await,
            _ = shutdown.changed() => break,
        }
    }
}

/// Numeric addresses parse directly; hostnames go through DNS.
async fn resolve_listener(listener: &ListenerAddress) -> Vec<SocketAddr> {
    if let Some(addr) = listener.to_socket_addr() {
        return vec![addr];
    }
    match tokio::net::lookup_host((listener.host.as_str(), listener.port)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            debug!(address = %listener, error = %e, "listener address did not resolve");
            Vec::new()
        }
    }
}

fn rpc_bindings(
    provider: &Arc<ClusterNodeProvider>,
    services: &Arc<ServiceRegistry>,
    tasks: &Arc<ServiceTaskRegistry>,
    groups: &Arc<ServiceGroupRegistry>,
) -> Arc<RpcHandlerRegistry> {
    fn reply<T: BufObject>(value: &T) -> Result<DataBuf, String> {
        let mut buf = DataBuf::new();
        value.write_into(&mut buf).map_err(|e| e.to_string())?;
        Ok(buf)
    }

    let task_by_name = tasks.clone();
    let all_tasks = tasks.clone();
    let group_by_name = groups.clone();
    let all_groups = groups.clone();
    let service_by_id = services.clone();
    let all_services = services.clone();
    let head_provider = provider.clone();

    RpcHandlerRegistry::builder()
        .bind("ServiceTaskProvider", "service_task", 1, move |mut args| {
            let tasks = task_by_name.clone();
            async move {
                let name = args.read_string().map_err(|e| e.to_string())?;
                reply(&tasks.get(&name))
            }
            .boxed()
        })
        .bind("ServiceTaskProvider", "service_tasks", 0, move |_args| {
            let tasks = all_tasks.clone();
            async move { reply(&tasks.all()) }.boxed()
        })
        .bind("ServiceGroupProvider", "service_group", 1, move |mut args| {
            let groups = group_by_name.clone();
            async move {
                let name = args.read_string().map_err(|e| e.to_string())?;
                reply(&groups.get(&name))
            }
            .boxed()
        })
        .bind("ServiceGroupProvider", "service_groups", 0, move |_args| {
            let groups = all_groups.clone();
            async move { reply(&groups.all()) }.boxed()
        })
        .bind("ServiceProvider", "service", 1, move |mut args| {
            let services = service_by_id.clone();
            async move {
                let id = args.read_unique_id().map_err(|e| e.to_string())?;
                reply(&services.get(&id))
            }
            .boxed()
        })
        .bind("ServiceProvider", "services", 0, move |_args| {
            let services = all_services.clone();
            async move { reply(&services.all()) }.boxed()
        })
        .bind("ClusterNodeProvider", "head_node", 0, move |_args| {
            let provider = head_provider.clone();
            async move { reply(&provider.head_node()) }.boxed()
        })
        .build()
}

fn encode<T: BufObject>(value: &T) -> Result<DataBuf, ClusterError> {
    let mut buf = DataBuf::new();
    value.write_into(&mut buf)?;
    Ok(buf)
}

fn internal_message(
    message: &str,
    target: MessageTarget,
    content: DataBuf,
) -> Result<ChannelMessage, ClusterError> {
    ChannelMessage::builder()
        .channel(internal::CHANNEL)
        .message(message)
        .target(target)
        .buffer(content)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NetworkClusterNode, NodeState};
    use crate::service::ServiceGroup;
    use std::collections::HashSet;
    use std::time::Duration;

    fn member(id: &str, addr: Option<SocketAddr>) -> NetworkClusterNode {
        let listener = match addr {
            Some(addr) => ListenerAddress::from(addr),
            None => ListenerAddress::new("127.0.0.1", 0),
        };
        NetworkClusterNode::new(NodeId::from(id), vec![listener])
    }

    fn config_for(id: &str, members: Vec<NetworkClusterNode>) -> ClusterConfig {
        let mut config = ClusterConfig::new(
            member(id, None),
            "127.0.0.1:0".parse().unwrap(),
        );
        config.members = members;
        config.heartbeat_interval = Duration::from_millis(50);
        config.reconnect_interval = Duration::from_millis(100);
        config.ticks_per_second = 20;
        config.max_no_update = Duration::from_secs(5);
        config
    }

    async fn start_node(id: &str, members: Vec<NetworkClusterNode>) -> Arc<LocalNode> {
        let node = LocalNode::new(config_for(id, members)).unwrap();
        node.start().await.unwrap();
        node
    }

    /// Boots the higher id first so its real port is known, then the lower
    /// id, which is the one that dials.
    async fn start_pair() -> (Arc<LocalNode>, Arc<LocalNode>) {
        let second = start_node("Node-2", vec![member("Node-1", None)]).await;
        let second_addr = second.listen_addr().unwrap();
        let first = start_node("Node-1", vec![member("Node-2", Some(second_addr))]).await;
        wait_for("pair to connect", || {
            connected(&first, "Node-2") && connected(&second, "Node-1")
        })
        .await;
        (first, second)
    }

    fn connected(node: &LocalNode, peer: &str) -> bool {
        node.provider()
            .node_state(&NodeId::from(peer))
            .is_some_and(|state| state.is_connected())
    }

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn task_named(name: &str, min: u32) -> ServiceTask {
        ServiceTask {
            name: name.to_string(),
            environment: "minecraft".to_string(),
            min_service_count: min,
            associated_nodes: Vec::new(),
            groups: Vec::new(),
        }
    }

    fn service_on(node: &str, task: &str, index: u32) -> ServiceInfo {
        ServiceInfo {
            id: ServiceId {
                unique_id: Uuid::new_v4(),
                task_name: task.to_string(),
                task_service_id: index,
                node: NodeId::from(node),
                environment: "minecraft".to_string(),
            },
            lifecycle: ServiceLifecycle::Running,
            address: ListenerAddress::new("127.0.0.1", 30000 + index as u16),
            groups: Vec::new(),
            properties: HashMap::new(),
            creation_time: epoch_millis(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nodes_connect_and_elect_the_lowest_id_head() {
        let (first, second) = start_pair().await;

        wait_for("snapshots to arrive", || {
            first
                .provider()
                .node_snapshot(&NodeId::from("Node-2"))
                .is_some()
                && second
                    .provider()
                    .node_snapshot(&NodeId::from("Node-1"))
                    .is_some()
        })
        .await;
        wait_for("election to converge", || {
            first.provider().head_node() == Some(NodeId::from("Node-1"))
                && second.provider().head_node() == Some(NodeId::from("Node-1"))
        })
        .await;
        assert!(first.provider().is_head());
        assert!(!second.provider().is_head());

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn joining_node_pulls_data_and_conflicting_entries_converge() {
        let second = start_node("Node-2", vec![member("Node-1", None)]).await;
        second.tasks().upsert(task_named("lobby", 2));
        second.groups().upsert(ServiceGroup {
            name: "global".to_string(),
            environments: vec!["minecraft".to_string()],
        });
        let second_addr = second.listen_addr().unwrap();

        let first = LocalNode::new(config_for(
            "Node-1",
            vec![member("Node-2", Some(second_addr))],
        ))
        .unwrap();
        // A conflicting local copy; the joiner's own entry is authoritative.
        first.tasks().upsert(task_named("lobby", 0));
        first.start().await.unwrap();

        wait_for("group to replicate", || first.groups().get("global").is_some()).await;
        assert_eq!(first.tasks().get("lobby").unwrap().min_service_count, 0);

        // The kept entry was echoed back, so the peer adopts it too.
        wait_for("conflict echo to converge", || {
            second.tasks().get("lobby").map(|t| t.min_service_count) == Some(0)
        })
        .await;

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn head_starts_services_for_understaffed_tasks() {
        let (first, second) = start_pair().await;
        wait_for("peer snapshot", || {
            first
                .provider()
                .node_snapshot(&NodeId::from("Node-2"))
                .is_some()
        })
        .await;

        first.tasks().upsert(task_named("lobby", 2));
        wait_for("head to fill the task minimum", || {
            first.services().count_active_for_task("lobby") == 2
        })
        .await;
        wait_for("records to replicate", || {
            second.services().count_active_for_task("lobby") == 2
        })
        .await;

        // Numbered from 1 and spread across both nodes.
        let records = first.services().by_task("lobby");
        let mut ids: Vec<u32> = records.iter().map(|s| s.id.task_service_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        let nodes: HashSet<NodeId> = records.into_iter().map(|s| s.id.node).collect();
        assert_eq!(nodes.len(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            first.services().count_active_for_task("lobby"),
            2,
            "autostart must not overshoot the minimum"
        );

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lifecycle_updates_replicate_to_peers() {
        let (first, second) = start_pair().await;
        first.tasks().upsert(task_named("arena", 0));

        let info = first.start_service("arena").await.unwrap();
        assert_eq!(info.lifecycle, ServiceLifecycle::Prepared);
        wait_for("record to replicate", || {
            second.services().get(&info.id.unique_id).is_some()
        })
        .await;

        first
            .update_service_lifecycle(&info.id.unique_id, ServiceLifecycle::Running)
            .await
            .unwrap();
        wait_for("lifecycle change to replicate", || {
            second
                .services()
                .get(&info.id.unique_id)
                .map(|s| s.lifecycle)
                == Some(ServiceLifecycle::Running)
        })
        .await;

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_service_rejects_unknown_tasks_and_drained_clusters() {
        let solo = start_node("Solo", Vec::new()).await;

        let err = solo.start_service("ghost").await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownTask(name) if name == "ghost"));

        solo.tasks().upsert(task_named("lobby", 0));
        solo.provider().set_draining(true);
        let err = solo.start_service("lobby").await.unwrap_err();
        assert!(matches!(err, ClusterError::NoNodeAvailable(_)));

        solo.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_task_lookup_answers_over_rpc() {
        let (first, second) = start_pair().await;
        second.tasks().upsert(ServiceTask {
            name: "bedwars".to_string(),
            environment: "minecraft".to_string(),
            min_service_count: 0,
            associated_nodes: Vec::new(),
            groups: vec!["pvp".to_string()],
        });

        let fetched = first
            .remote_service_task(&NodeId::from("Node-2"), "bedwars")
            .await
            .unwrap();
        assert_eq!(fetched.unwrap().groups, vec!["pvp".to_string()]);

        let missing = first
            .remote_service_task(&NodeId::from("Node-2"), "ghost")
            .await
            .unwrap();
        assert!(missing.is_none());

        let unreachable = first
            .remote_service_task(&NodeId::from("Node-9"), "bedwars")
            .await;
        assert!(matches!(unreachable, Err(ClusterError::NodeUnreachable(_))));

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_cluster_data_pushes_tables_to_peers() {
        let (first, second) = start_pair().await;
        first.tasks().upsert(task_named("proxy", 0));

        first.sync_cluster_data().await.unwrap();
        assert!(second.tasks().get("proxy").is_some());

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transfers_stream_between_nodes() {
        let (first, second) = start_pair().await;
        let mut completed = second.take_transfer_receiver().unwrap();
        assert!(second.take_transfer_receiver().is_none());

        let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let transfer_id = first
            .send_transfer(&NodeId::from("Node-2"), &payload)
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), completed.recv())
            .await
            .expect("transfer timed out")
            .expect("transfer channel closed");
        assert_eq!(received.transfer_id, transfer_id);
        assert_eq!(received.payload.as_ref(), payload.as_slice());

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn graceful_departure_is_not_an_eviction() {
        let (first, second) = start_pair().await;
        let mut events = first.events().subscribe();

        second.shutdown().await;

        wait_for("departure to land", || {
            first.provider().node_state(&NodeId::from("Node-2"))
                == Some(NodeState::Disconnected)
        })
        .await;
        let mut saw_disconnect = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ClusterEvent::NodeDisconnected { .. } => saw_disconnect = true,
                ClusterEvent::NodeEvicted { .. } => {
                    panic!("graceful departure must not evict")
                }
                _ => {}
            }
        }
        assert!(saw_disconnect);

        first.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_peer_is_evicted_and_its_services_cleared() {
        let second = start_node("Node-2", vec![member("Node-1", None)]).await;
        let second_addr = second.listen_addr().unwrap();

        let mut config = config_for("Node-1", vec![member("Node-2", Some(second_addr))]);
        config.max_no_update = Duration::from_millis(400);
        let first = LocalNode::new(config).unwrap();
        first.start().await.unwrap();
        wait_for("pair to connect", || {
            connected(&first, "Node-2") && connected(&second, "Node-1")
        })
        .await;

        // A service reported as running on the doomed peer.
        first.services().upsert(service_on("Node-2", "lobby", 1));
        let mut events = first.events().subscribe();

        // Stopping the peer's scheduler silences its heartbeats while the
        // socket stays open.
        second.scheduler().shutdown().await;

        wait_for("stale peer to be evicted", || {
            first.provider().node_state(&NodeId::from("Node-2")) == Some(NodeState::Evicted)
        })
        .await;
        wait_for("the evicted node's services to be cleared", || {
            first
                .services()
                .count_active_for_node(&NodeId::from("Node-2"))
                == 0
        })
        .await;

        let mut evictions = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClusterEvent::NodeEvicted { .. }) {
                evictions += 1;
            }
        }
        assert_eq!(evictions, 1);

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_request_over_the_wire_empties_and_signals_shutdown() {
        let (first, second) = start_pair().await;
        let mut signal = second.shutdown_signal();
        assert!(!*signal.borrow());

        let content = encode(&NodeId::from("Node-2")).unwrap();
        let notice = internal_message(
            internal::CLUSTER_NODE_SHUTDOWN,
            MessageTarget::Node(NodeId::from("Node-2")),
            content,
        )
        .unwrap();
        first.bus().send(notice).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), signal.changed())
            .await
            .expect("drain signal timed out")
            .unwrap();
        assert!(*signal.borrow());
        assert!(second.provider().is_draining());

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_is_idempotent() {
        let node = start_node("Solo", Vec::new()).await;
        let addr = node.listen_addr().unwrap();
        node.start().await.unwrap();
        assert_eq!(node.listen_addr(), Some(addr));
        node.shutdown().await;
        // A second shutdown is a no-op as well.
        node.shutdown().await;
    }
}
