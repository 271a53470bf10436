//! # Cluster node model
//!
//! Identity, listener addresses and the periodically refreshed
//! [`NodeInfoSnapshot`] that every node publishes about itself. Snapshots
//! are the liveness signal: a peer whose newest snapshot is older than the
//! configured staleness bound gets evicted.

mod handshake;
mod provider;
mod server;

pub use handshake::{ClusterChannelHandler, NodeAuthListener, AUTH_MESSAGE, AUTH_TIMEOUT};
pub use provider::{ClusterNodeProvider, EvictedNode};
pub use server::ClusterNodeServer;

use armada_protocol::{BufObject, DataBuf, ProtocolError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Cluster-wide unique node name. Ordering is plain lexicographic byte
/// order; head election takes the minimum over available nodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl BufObject for NodeId {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_string(&self.0)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Self(buf.read_string()?))
    }
}

/// Host and port a node listens on, kept as written in the member list so
/// the wire form never depends on address resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerAddress {
    pub host: String,
    pub port: u16,
}

impl ListenerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().ok()
    }
}

impl From<SocketAddr> for ListenerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl BufObject for ListenerAddress {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_string(&self.host)?;
        buf.write_u16(self.port)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Self {
            host: buf.read_string()?,
            port: buf.read_u16()?,
        })
    }
}

/// Static node description exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkClusterNode {
    pub id: NodeId,
    pub listeners: Vec<ListenerAddress>,
}

impl NetworkClusterNode {
    pub fn new(id: NodeId, listeners: Vec<ListenerAddress>) -> Self {
        Self { id, listeners }
    }
}

impl BufObject for NetworkClusterNode {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        self.id.write_into(buf)?;
        self.listeners.write_into(buf)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: NodeId::read_from(buf)?,
            listeners: Vec::read_from(buf)?,
        })
    }
}

/// Self-reported state of one node at one instant.
///
/// `creation_time` is the liveness reference: staleness is judged against
/// the receiver's wall clock, so member clocks must be roughly aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfoSnapshot {
    pub node: NetworkClusterNode,
    pub creation_time: u64,
    pub startup_time: u64,
    pub draining: bool,
    pub service_count: u32,
    pub average_tick_millis: f64,
    /// Names of the sync tables this node serves, sorted.
    pub modules: Vec<String>,
    pub version: String,
}

impl NodeInfoSnapshot {
    pub fn uptime_millis(&self) -> u64 {
        self.creation_time.saturating_sub(self.startup_time)
    }
}

impl BufObject for NodeInfoSnapshot {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        self.node.write_into(buf)?;
        buf.write_var_u64(self.creation_time)?;
        buf.write_var_u64(self.startup_time)?;
        buf.write_bool(self.draining)?;
        buf.write_u32(self.service_count)?;
        buf.write_f64(self.average_tick_millis)?;
        self.modules.write_into(buf)?;
        buf.write_string(&self.version)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Self {
            node: NetworkClusterNode::read_from(buf)?,
            creation_time: buf.read_var_u64()?,
            startup_time: buf.read_var_u64()?,
            draining: buf.read_bool()?,
            service_count: buf.read_u32()?,
            average_tick_millis: buf.read_f64()?,
            modules: Vec::read_from(buf)?,
            version: buf.read_string()?,
        })
    }
}

/// Lifecycle of one remote node as seen from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Known by name only, no member entry applied yet.
    #[default]
    Unconfigured,
    /// Listed in the member configuration, no live channel.
    Configured,
    /// Live channel established and authenticated.
    Connected,
    /// Channel lost; the node may come back.
    Disconnected,
    /// Removed for missing its snapshot deadline.
    Evicted,
}

impl NodeState {
    pub fn is_connected(&self) -> bool {
        matches!(self, NodeState::Connected)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Unconfigured => "unconfigured",
            NodeState::Configured => "configured",
            NodeState::Connected => "connected",
            NodeState::Disconnected => "disconnected",
            NodeState::Evicted => "evicted",
        };
        f.write_str(name)
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
