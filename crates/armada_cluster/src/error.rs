use crate::node::NodeId;
use armada_network::{NetworkError, RpcError};
use armada_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("node {0} is not a configured cluster member")]
    UnknownNode(NodeId),

    #[error("node {0} is already connected")]
    AlreadyConnected(NodeId),

    #[error("no service task named {0}")]
    UnknownTask(String),

    #[error("no service {0}")]
    UnknownService(String),

    #[error("no node available to host task {0}")]
    NoNodeAvailable(String),

    #[error("no channel to node {0}")]
    NodeUnreachable(NodeId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid channel message: {0}")]
    InvalidMessage(String),

    #[error("node is draining")]
    Draining,
}
