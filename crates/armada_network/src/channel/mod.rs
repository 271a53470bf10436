//! # Network channels
//!
//! A [`NetworkChannel`] owns one physical bidirectional connection. Frames
//! are written through an outbound queue drained by a writer task; a reader
//! task feeds the resumable frame decoder and dispatches complete frames in
//! receipt order. Closing is idempotent: the first close wins, synchronously
//! removes the channel from the registry, fails its pending queries and
//! delivers exactly one `handle_close` callback.
//!
//! Channels never appear as strong references inside higher-level tables;
//! cluster state stores the [`ChannelKey`] and looks the channel up in the
//! [`ChannelRegistry`] instead, so a closed channel cannot dangle.

mod handler;
mod server;

pub use handler::{AcceptAllHandler, ChannelHandler, PacketListener, PacketListenerRegistry};
pub use server::{NetworkClient, NetworkServer, DEFAULT_CONNECT_TIMEOUT};

use crate::error::NetworkError;
use crate::query::{parse_header, query_header, response_header, HeaderKind, QueryManager};
use armada_protocol::{DataBuf, Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

static NEXT_CHANNEL_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one channel, used as the index into every
/// table that refers to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(u64);

impl ChannelKey {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Per-channel wire counters.
#[derive(Default)]
pub struct ChannelStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ChannelStats {
    fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_received_bytes(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_received_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Shared wiring for one network component: every channel spawned from the
/// same context shares the registry, the pending-query table, the listener
/// registry and the lifecycle handler.
pub struct NetworkContext {
    pub registry: Arc<ChannelRegistry>,
    pub query_manager: Arc<QueryManager>,
    pub listeners: Arc<PacketListenerRegistry>,
    pub handler: Arc<dyn ChannelHandler>,
    pub max_frame_size: usize,
}

impl NetworkContext {
    pub fn new(handler: Arc<dyn ChannelHandler>) -> Arc<Self> {
        Self::with_max_frame_size(handler, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(handler: Arc<dyn ChannelHandler>, max_frame_size: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(ChannelRegistry::new()),
            query_manager: Arc::new(QueryManager::new()),
            listeners: Arc::new(PacketListenerRegistry::new()),
            handler,
            max_frame_size,
        })
    }
}

struct ChannelInner {
    key: ChannelKey,
    peer_addr: SocketAddr,
    client_side: bool,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    sender_id: OnceLock<String>,
    stats: ChannelStats,
    query_manager: Arc<QueryManager>,
    registry: Weak<ChannelRegistry>,
    handler: Arc<dyn ChannelHandler>,
}

/// Cheaply cloneable handle to one physical connection.
#[derive(Clone)]
pub struct NetworkChannel {
    inner: Arc<ChannelInner>,
}

impl NetworkChannel {
    pub fn key(&self) -> ChannelKey {
        self.inner.key
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Whether this side initiated the connection.
    pub fn is_client_side(&self) -> bool {
        self.inner.client_side
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Peer identity established by the handshake, if any.
    pub fn sender_id(&self) -> Option<&str> {
        self.inner.sender_id.get().map(String::as_str)
    }

    /// Assigns the peer identity. The identity can be set exactly once;
    /// returns `false` if it was already assigned.
    pub fn assign_sender_id(&self, id: impl Into<String>) -> bool {
        self.inner.sender_id.set(id.into()).is_ok()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Queues a frame for the writer task.
    pub fn send(&self, frame: Frame) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::ChannelClosed(self.key().value()));
        }
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| NetworkError::ChannelClosed(self.key().value()))
    }

    /// Sends a query frame and waits for the correlated response.
    ///
    /// On timeout the pending entry is removed before the error is returned,
    /// so a late response is discarded instead of leaking.
    pub async fn query(
        &self,
        channel_id: i32,
        body: DataBuf,
        timeout: Duration,
    ) -> Result<DataBuf, NetworkError> {
        let id = Uuid::new_v4();
        let rx = self.inner.query_manager.register(id, self.key(), timeout);
        let frame = Frame::new(channel_id, query_header(id), body);
        if let Err(e) = self.send(frame) {
            self.inner.query_manager.discard(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::QueryFailed(id)),
            Err(_) => {
                self.inner.query_manager.discard(&id);
                Err(NetworkError::QueryTimeout(id))
            }
        }
    }

    /// Closes the channel. Idempotent: only the first call tears down.
    ///
    /// Teardown order is fixed: mark closed, unregister, fail pending
    /// queries, wake the I/O tasks, then the single `handle_close` callback.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self.key());
        }
        self.inner.query_manager.fail_channel(self.key());
        let _ = self.inner.closed_tx.send(true);
        self.inner.handler.handle_close(self).await;
        debug!(channel = %self.key(), peer = %self.peer_addr(), "channel closed");
    }
}

impl fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("key", &self.inner.key)
            .field("peer", &self.inner.peer_addr)
            .field("client_side", &self.inner.client_side)
            .field("sender_id", &self.sender_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// All live channels of one network component, keyed by [`ChannelKey`].
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelKey, NetworkChannel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, channel: NetworkChannel) {
        self.channels.insert(channel.key(), channel);
    }

    fn remove(&self, key: ChannelKey) -> Option<NetworkChannel> {
        self.channels.remove(&key).map(|(_, channel)| channel)
    }

    pub fn get(&self, key: ChannelKey) -> Option<NetworkChannel> {
        self.channels.get(&key).map(|entry| entry.value().clone())
    }

    /// Finds the channel whose handshake established the given identity.
    pub fn by_sender(&self, sender_id: &str) -> Option<NetworkChannel> {
        self.channels
            .iter()
            .find(|entry| entry.value().sender_id() == Some(sender_id))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn all(&self) -> Vec<NetworkChannel> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub async fn close_all(&self) {
        for channel in self.all() {
            channel.close().await;
        }
    }
}

/// Wires a fresh byte stream into a running channel.
///
/// The reader and writer tasks are live before `handle_open` fires, so the
/// handler may already exchange frames with the peer. A rejecting handler
/// closes the channel and surfaces the rejection to the caller.
pub async fn spawn_channel<S>(
    stream: S,
    peer_addr: SocketAddr,
    client_side: bool,
    ctx: &Arc<NetworkContext>,
) -> Result<NetworkChannel, NetworkError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);

    let channel = NetworkChannel {
        inner: Arc::new(ChannelInner {
            key: ChannelKey::next(),
            peer_addr,
            client_side,
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            closed_tx,
            sender_id: OnceLock::new(),
            stats: ChannelStats::default(),
            query_manager: ctx.query_manager.clone(),
            registry: Arc::downgrade(&ctx.registry),
            handler: ctx.handler.clone(),
        }),
    };

    ctx.registry.insert(channel.clone());
    debug!(channel = %channel.key(), peer = %peer_addr, client_side, "channel opened");

    run_writer(
        write_half,
        outbound_rx,
        channel.clone(),
        closed_rx.clone(),
        ctx.max_frame_size,
    );
    run_reader(
        read_half,
        channel.clone(),
        ctx.listeners.clone(),
        closed_rx,
        ctx.max_frame_size,
    );

    if let Err(e) = ctx.handler.handle_open(&channel).await {
        warn!(channel = %channel.key(), peer = %peer_addr, error = %e, "channel rejected on open");
        channel.close().await;
        return Err(NetworkError::Rejected(e.to_string()));
    }

    Ok(channel)
}

fn run_writer<W>(
    mut write_half: W,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    channel: NetworkChannel,
    mut closed_rx: watch::Receiver<bool>,
    max_frame_size: usize,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_frame = outbound_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    if !write_frame(&mut write_half, &channel, frame, max_frame_size).await {
                        break;
                    }
                }
                _ = closed_rx.changed() => {
                    // Frames queued before the close flag flipped still go
                    // out, so a farewell written right before close() lands.
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if !write_frame(&mut write_half, &channel, frame, max_frame_size).await {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        channel.close().await;
    });
}

async fn write_frame<W>(
    write_half: &mut W,
    channel: &NetworkChannel,
    frame: Frame,
    max_frame_size: usize,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode();
    if encoded.len() > max_frame_size {
        warn!(
            channel = %channel.key(),
            size = encoded.len(),
            limit = max_frame_size,
            "dropping oversized outbound frame"
        );
        return true;
    }
    if let Err(e) = write_half.write_all(&encoded).await {
        debug!(channel = %channel.key(), error = %e, "write failed");
        return false;
    }
    if write_half.flush().await.is_err() {
        return false;
    }
    channel.inner.stats.record_sent(encoded.len());
    true
}

fn run_reader<R>(
    mut read_half: R,
    channel: NetworkChannel,
    listeners: Arc<PacketListenerRegistry>,
    mut closed_rx: watch::Receiver<bool>,
    max_frame_size: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new(max_frame_size);
        let mut buf = vec![0u8; 16 * 1024];
        'outer: loop {
            tokio::select! {
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => {
                        trace!(channel = %channel.key(), "peer closed connection");
                        break;
                    }
                    Ok(n) => {
                        channel.inner.stats.record_received_bytes(n);
                        decoder.extend(&buf[..n]);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(frame)) => dispatch_frame(&channel, &listeners, frame).await,
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(
                                        channel = %channel.key(),
                                        peer = %channel.peer_addr(),
                                        error = %e,
                                        "protocol error, closing channel"
                                    );
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(channel = %channel.key(), error = %e, "read failed");
                        break;
                    }
                },
                _ = closed_rx.changed() => break,
            }
        }
        channel.close().await;
    });
}

/// Routes one complete inbound frame. Runs on the reader task, so frames on
/// a single channel are always processed in receipt order.
async fn dispatch_frame(
    channel: &NetworkChannel,
    listeners: &PacketListenerRegistry,
    mut frame: Frame,
) {
    channel.inner.stats.record_received_frame();

    match channel.inner.handler.handle_frame(channel, &frame).await {
        Ok(true) => {}
        Ok(false) => {
            trace!(channel = %channel.key(), wire_channel = frame.channel_id, "frame vetoed by handler");
            return;
        }
        Err(e) => {
            warn!(channel = %channel.key(), error = %e, "frame handler error");
            return;
        }
    }

    let kind = match parse_header(&mut frame.header) {
        Ok(kind) => kind,
        Err(e) => {
            warn!(channel = %channel.key(), error = %e, "malformed frame header");
            return;
        }
    };

    match kind {
        HeaderKind::Response(id) => {
            channel.inner.query_manager.complete(&id, frame.body);
        }
        HeaderKind::Query(id) => {
            let registered = listeners.listeners_for(frame.channel_id);
            let mut reply: Option<DataBuf> = None;
            for listener in &registered {
                match listener.handle(channel, frame.body.clone()).await {
                    Ok(Some(response)) if reply.is_none() => reply = Some(response),
                    Ok(_) => {}
                    Err(e) => warn!(
                        channel = %channel.key(),
                        wire_channel = frame.channel_id,
                        error = %e,
                        "packet listener failed"
                    ),
                }
            }
            if let Some(reply) = reply {
                let response = Frame::new(frame.channel_id, response_header(id), reply);
                if let Err(e) = channel.send(response) {
                    debug!(channel = %channel.key(), query_id = %id, error = %e, "failed to send query response");
                }
            }
        }
        HeaderKind::Plain => {
            let registered = listeners.listeners_for(frame.channel_id);
            if registered.is_empty() {
                trace!(channel = %channel.key(), wire_channel = frame.channel_id, "no listener for frame");
                return;
            }
            for listener in &registered {
                if let Err(e) = listener.handle(channel, frame.body.clone()).await {
                    warn!(
                        channel = %channel.key(),
                        wire_channel = frame.channel_id,
                        error = %e,
                        "packet listener failed"
                    );
                }
            }
        }
    }
}
