//! # Armada network layer
//!
//! Channel transport between cluster nodes. A channel wraps one TCP or TLS
//! connection and carries frames for every higher-level concern: raw
//! handshake traffic, queries with correlated responses, RPC dispatch,
//! messaging fan-out and chunked transfers.
//!
//! The layer is assembled from a few cooperating parts:
//!
//! - [`NetworkServer`] / [`NetworkClient`] establish connections and hand
//!   the streams to [`spawn_channel`], which runs one reader and one writer
//!   task per channel.
//! - [`ChannelHandler`] observes channel lifecycle and can fence frames
//!   until a handshake finishes; [`PacketListener`]s consume frames by wire
//!   channel id.
//! - [`QueryManager`] correlates query frames with their responses through
//!   one-shot completion slots with deadlines.
//! - [`RpcSender`] and [`RpcHandlerRegistry`] provide statically-bound
//!   remote calls on top of the query layer.
//!
//! Channel identity is the [`ChannelKey`]. Higher layers store keys, never
//! channel handles, and resolve them through the [`ChannelRegistry`] so a
//! closed channel cannot be held alive by a stale table entry.

mod channel;
mod error;
mod query;
mod rpc;
mod transport;

pub use channel::{
    spawn_channel, AcceptAllHandler, ChannelHandler, ChannelKey, ChannelRegistry, ChannelStats,
    ChannelStatsSnapshot, NetworkChannel, NetworkClient, NetworkContext, NetworkServer,
    PacketListener, PacketListenerRegistry, DEFAULT_CONNECT_TIMEOUT,
};
pub use error::NetworkError;
pub use query::{
    parse_header, query_header, response_header, HeaderKind, QueryManager, QueryStatsSnapshot,
    DEFAULT_QUERY_TIMEOUT, SWEEP_INTERVAL,
};
pub use rpc::{
    MethodKey, RpcCall, RpcError, RpcHandlerRegistry, RpcHandlerRegistryBuilder, RpcInvoker,
    RpcPacketListener, RpcSender, DEFAULT_RPC_TIMEOUT,
};
pub use transport::{NetStream, StreamAcceptor, StreamConnector};
