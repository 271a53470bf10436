//! # Channel messaging
//!
//! A [`ChannelMessage`] is the unit of cluster-internal communication:
//! addressed by a channel name plus message name, carrying an opaque
//! content buffer, delivered to one or many targets. Platform traffic
//! rides the reserved [`internal`] channel; embedders pick their own
//! channel names for everything else.

mod bus;

pub use bus::{ChannelMessageListener, MessagePacketListener, MessagingBus};

use crate::error::ClusterError;
use crate::node::NodeId;
use armada_protocol::{BufObject, DataBuf, ProtocolError};
use std::fmt;

/// Reserved channel and message names for platform-internal traffic.
pub mod internal {
    pub const CHANNEL: &str = "internal:network-message";

    pub const SYNC_CLUSTER_DATA: &str = "sync_cluster_data";
    pub const UPDATE_NODE_INFO_SNAPSHOT: &str = "update_node_info_snapshot";
    pub const CLUSTER_NODE_SHUTDOWN: &str = "cluster_node_shutdown";
    pub const UPDATE_SERVICE_LIFECYCLE: &str = "update_service_lifecycle";
    pub const REQUEST_INITIAL_CLUSTER_DATA: &str = "request_initial_cluster_data";
}

/// Where a message is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// One node by id.
    Node(NodeId),
    /// Every node, the sender included.
    AllNodes,
    /// One service by name, delivered to the node hosting it.
    Service(String),
    /// Every active service of a task.
    Task(String),
    /// Every active service in a group.
    Group(String),
    /// Every active service in an environment.
    Environment(String),
    /// Every active service in the cluster.
    AllServices,
}

impl MessageTarget {
    fn tag(&self) -> u8 {
        match self {
            MessageTarget::Node(_) => 0,
            MessageTarget::AllNodes => 1,
            MessageTarget::Service(_) => 2,
            MessageTarget::Task(_) => 3,
            MessageTarget::Group(_) => 4,
            MessageTarget::Environment(_) => 5,
            MessageTarget::AllServices => 6,
        }
    }
}

impl fmt::Display for MessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageTarget::Node(id) => write!(f, "node:{id}"),
            MessageTarget::AllNodes => f.write_str("all-nodes"),
            MessageTarget::Service(name) => write!(f, "service:{name}"),
            MessageTarget::Task(name) => write!(f, "task:{name}"),
            MessageTarget::Group(name) => write!(f, "group:{name}"),
            MessageTarget::Environment(name) => write!(f, "environment:{name}"),
            MessageTarget::AllServices => f.write_str("all-services"),
        }
    }
}

impl BufObject for MessageTarget {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_u8(self.tag())?;
        match self {
            MessageTarget::Node(id) => id.write_into(buf),
            MessageTarget::AllNodes | MessageTarget::AllServices => Ok(()),
            MessageTarget::Service(name)
            | MessageTarget::Task(name)
            | MessageTarget::Group(name)
            | MessageTarget::Environment(name) => buf.write_string(name),
        }
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        match buf.read_u8()? {
            0 => Ok(MessageTarget::Node(NodeId::read_from(buf)?)),
            1 => Ok(MessageTarget::AllNodes),
            2 => Ok(MessageTarget::Service(buf.read_string()?)),
            3 => Ok(MessageTarget::Task(buf.read_string()?)),
            4 => Ok(MessageTarget::Group(buf.read_string()?)),
            5 => Ok(MessageTarget::Environment(buf.read_string()?)),
            6 => Ok(MessageTarget::AllServices),
            tag => Err(ProtocolError::UnknownTag {
                tag,
                context: "message target",
            }),
        }
    }
}

/// One message travelling over the bus. Instances are immutable; build
/// them through [`ChannelMessage::builder`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel: String,
    pub message: String,
    pub sender: NodeId,
    pub targets: Vec<MessageTarget>,
    pub content: DataBuf,
}

impl ChannelMessage {
    pub fn builder() -> ChannelMessageBuilder {
        ChannelMessageBuilder::default()
    }
}

impl BufObject for ChannelMessage {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_string(&self.channel)?;
        buf.write_string(&self.message)?;
        self.sender.write_into(buf)?;
        self.targets.write_into(buf)?;
        buf.write_buf(&self.content)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: buf.read_string()?,
            message: buf.read_string()?,
            sender: NodeId::read_from(buf)?,
            targets: Vec::read_from(buf)?,
            content: buf.read_buf()?,
        })
    }
}

/// Builder enforcing the message invariants: non-empty channel and message
/// names, at least one target.
#[derive(Debug, Default)]
pub struct ChannelMessageBuilder {
    channel: Option<String>,
    message: Option<String>,
    sender: Option<NodeId>,
    targets: Vec<MessageTarget>,
    content: DataBuf,
}

impl ChannelMessageBuilder {
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Usually left unset; the bus stamps the local node id on send.
    pub fn sender(mut self, sender: NodeId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn target(mut self, target: MessageTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = MessageTarget>) -> Self {
        self.targets.extend(targets);
        self
    }

    pub fn buffer(mut self, content: DataBuf) -> Self {
        self.content = content;
        self
    }

    pub fn build(self) -> Result<ChannelMessage, ClusterError> {
        let channel = self
            .channel
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ClusterError::InvalidMessage("channel name is required".into()))?;
        let message = self
            .message
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ClusterError::InvalidMessage("message name is required".into()))?;
        if self.targets.is_empty() {
            return Err(ClusterError::InvalidMessage(
                "at least one target is required".into(),
            ));
        }
        Ok(ChannelMessage {
            channel,
            message,
            sender: self.sender.unwrap_or_else(|| NodeId::from("")),
            targets: self.targets,
            content: self.content,
        })
    }
}
