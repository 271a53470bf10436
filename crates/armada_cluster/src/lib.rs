//! # Armada cluster layer
//!
//! Multi-node coordination on top of the network layer: membership and
//! handshakes, heartbeat-driven liveness, deterministic head election,
//! replicated service records, cluster-wide data sync and the tick
//! scheduler that drives the recurring duties.
//!
//! The moving parts:
//!
//! - [`ClusterNodeProvider`] tracks every configured member through the
//!   `Configured -> Connected -> Disconnected | Evicted` state machine and
//!   recomputes the head node whenever availability changes.
//! - [`MessagingBus`] fans [`ChannelMessage`]s out to nodes and services,
//!   with query variants that collect replies.
//! - [`DataSyncRegistry`] serializes and applies per-key dataset sections,
//!   echoing kept entries back so both sides of a sync converge.
//! - [`TickScheduler`] runs scheduled jobs and the per-tick cluster duties
//!   on one loop.
//! - [`LocalNode`] is the assembly root wiring all of the above to a
//!   listening socket, a dial loop and the platform packet listeners.
//!
//! Embedders normally construct a [`ClusterConfig`], hand it to
//! [`LocalNode::new`] and call [`LocalNode::start`].

mod config;
mod error;
mod events;
mod internal;
mod local;
pub mod messaging;
mod node;
mod scheduler;
mod service;
mod sync;

pub use config::{
    ClusterConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_NO_UPDATE, DEFAULT_RECONNECT_INTERVAL,
};
pub use error::ClusterError;
pub use events::{ClusterEvent, ClusterEventBus};
pub use internal::CompletedTransfer;
pub use local::LocalNode;
pub use messaging::{
    ChannelMessage, ChannelMessageBuilder, ChannelMessageListener, MessagePacketListener,
    MessageTarget, MessagingBus,
};
pub use node::{
    epoch_millis, ClusterChannelHandler, ClusterNodeProvider, ClusterNodeServer, EvictedNode,
    ListenerAddress, NetworkClusterNode, NodeAuthListener, NodeId, NodeInfoSnapshot, NodeState,
    AUTH_MESSAGE, AUTH_TIMEOUT,
};
pub use scheduler::{TickScheduler, DEFAULT_TICKS_PER_SECOND};
pub use service::{
    LockPool, ServiceGroup, ServiceGroupRegistry, ServiceId, ServiceInfo, ServiceLifecycle,
    ServiceRegistry, ServiceTask, ServiceTaskRegistry,
};
pub use sync::{DataSyncHandler, DataSyncRegistry, SyncApplied};
