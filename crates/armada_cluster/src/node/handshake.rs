//! Node authentication over the raw wire channel.
//!
//! The dialing side opens the exchange with a query carrying the
//! [`AUTH_MESSAGE`] marker plus its own identity and state snapshot; the
//! accepting side answers with a verdict and its own snapshot, so both ends
//! are electable the moment the handshake completes. Until a channel carries
//! an authenticated sender id, every frame outside the raw channel is vetoed.

use crate::node::{ClusterNodeProvider, NetworkClusterNode, NodeId, NodeInfoSnapshot};
use armada_network::{ChannelHandler, NetworkChannel, NetworkError, PacketListener};
use armada_protocol::{channel_ids, BufObject, DataBuf, Frame};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Marker string that opens every auth exchange.
pub const AUTH_MESSAGE: &str = "node_auth";

/// How long the dialing side waits for the auth verdict.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period that lets a rejection reply flush before the channel drops.
const REJECT_LINGER: Duration = Duration::from_millis(100);

/// Lifecycle handler for cluster connections.
///
/// Client-side channels authenticate themselves inside `handle_open`, so a
/// successful connect implies a connected member entry. Closes of any kind
/// funnel into the provider, which fails over head election and marks the
/// member disconnected.
pub struct ClusterChannelHandler {
    provider: Arc<ClusterNodeProvider>,
}

impl ClusterChannelHandler {
    pub fn new(provider: Arc<ClusterNodeProvider>) -> Self {
        Self { provider }
    }

    async fn authenticate(&self, channel: &NetworkChannel) -> Result<(), NetworkError> {
        let mut request = DataBuf::new();
        request.write_string(AUTH_MESSAGE)?;
        self.provider.local_node().write_into(&mut request)?;
        self.provider.handshake_snapshot().write_into(&mut request)?;

        let mut reply = channel
            .query(channel_ids::RAW, request, AUTH_TIMEOUT)
            .await?;
        if !reply.read_bool()? {
            let reason = reply.read_string()?;
            return Err(NetworkError::Rejected(reason));
        }

        let peer = NodeId::read_from(&mut reply)?;
        let snapshot = NodeInfoSnapshot::read_from(&mut reply)?;
        channel.assign_sender_id(peer.as_str());
        self.provider
            .handle_connected(&peer, channel.key())
            .and_then(|()| self.provider.update_snapshot(snapshot))
            .map_err(|e| NetworkError::Rejected(e.to_string()))?;
        info!(node = %peer, channel = %channel.key(), "authenticated against cluster node");
        Ok(())
    }
}

#[async_trait]
impl ChannelHandler for ClusterChannelHandler {
    async fn handle_open(&self, channel: &NetworkChannel) -> Result<(), NetworkError> {
        if channel.is_client_side() {
            self.authenticate(channel).await
        } else {
            // Accepting side waits for the peer's auth query.
            Ok(())
        }
    }

    async fn handle_frame(
        &self,
        channel: &NetworkChannel,
        frame: &Frame,
    ) -> Result<bool, NetworkError> {
        if channel.sender_id().is_some() || frame.channel_id == channel_ids::RAW {
            return Ok(true);
        }
        warn!(
            channel = %channel.key(),
            wire_channel = frame.channel_id,
            "dropping frame from unauthenticated peer"
        );
        Ok(false)
    }

    async fn handle_close(&self, channel: &NetworkChannel) {
        if let Some(node) = self.provider.handle_channel_closed(channel.key()) {
            debug!(node = %node, channel = %channel.key(), "cluster channel torn down");
        }
    }
}

/// Accept-side half of the handshake, listening on the raw channel.
pub struct NodeAuthListener {
    provider: Arc<ClusterNodeProvider>,
}

impl NodeAuthListener {
    pub fn new(provider: Arc<ClusterNodeProvider>) -> Self {
        Self { provider }
    }

    fn accept_reply(&self) -> Result<DataBuf, NetworkError> {
        let mut reply = DataBuf::new();
        reply.write_bool(true)?;
        self.provider.local_id().write_into(&mut reply)?;
        self.provider.handshake_snapshot().write_into(&mut reply)?;
        Ok(reply)
    }

    fn reject_reply(reason: &str) -> Result<DataBuf, NetworkError> {
        let mut reply = DataBuf::new();
        reply.write_bool(false)?;
        reply.write_string(reason)?;
        Ok(reply)
    }
}

#[async_trait]
impl PacketListener for NodeAuthListener {
    async fn handle(
        &self,
        channel: &NetworkChannel,
        mut body: DataBuf,
    ) -> Result<Option<DataBuf>, NetworkError> {
        let marker = body.read_string()?;
        if marker != AUTH_MESSAGE {
            return Err(NetworkError::Rejected(format!(
                "unexpected raw packet: {marker}"
            )));
        }
        let node = NetworkClusterNode::read_from(&mut body)?;
        let snapshot = NodeInfoSnapshot::read_from(&mut body)?;

        let verdict = self
            .provider
            .acceptable_connection(&node.id)
            .and_then(|()| {
                // Refresh the advertised listeners from the live peer.
                self.provider.register_member(node.clone());
                self.provider.handle_connected(&node.id, channel.key())
            })
            .and_then(|()| self.provider.update_snapshot(snapshot));

        match verdict {
            Ok(()) => {
                channel.assign_sender_id(node.id.as_str());
                Ok(Some(self.accept_reply()?))
            }
            Err(e) => {
                warn!(
                    node = %node.id,
                    channel = %channel.key(),
                    reason = %e,
                    "cluster auth rejected"
                );
                let lingering = channel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(REJECT_LINGER).await;
                    lingering.close().await;
                });
                Ok(Some(Self::reject_reply(&e.to_string())?))
            }
        }
    }
}
