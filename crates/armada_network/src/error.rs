//! Error types for the network layer.

use armada_protocol::ProtocolError;
use std::net::SocketAddr;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by channels, servers and the query correlation layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Wire-level encode/decode failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation on a channel that has already closed.
    #[error("channel {0} is closed")]
    ChannelClosed(u64),

    /// A fire-and-wait query did not resolve within its deadline.
    #[error("query {0} timed out")]
    QueryTimeout(Uuid),

    /// A pending query was failed because its channel closed underneath it.
    #[error("query {0} failed: channel closed")]
    QueryFailed(Uuid),

    /// Listener bind failure; fatal to startup when no listener binds.
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Connection establishment failure.
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    /// A connection-lifecycle handler rejected the channel.
    #[error("channel rejected: {0}")]
    Rejected(String),
}
