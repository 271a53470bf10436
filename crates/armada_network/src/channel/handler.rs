//! Connection-lifecycle handlers and per-channel-id packet listeners.

use super::NetworkChannel;
use crate::error::NetworkError;
use armada_protocol::{DataBuf, Frame};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Hooks into the lifecycle of every channel of one network component.
///
/// `handle_open` fires exactly once when the connection is established;
/// returning an error rejects and closes the channel. `handle_frame` runs
/// before listener dispatch and may veto a frame by returning `Ok(false)`,
/// which is how unauthenticated channels are fenced off. `handle_close`
/// fires exactly once, after the channel left every registry.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle_open(&self, channel: &NetworkChannel) -> Result<(), NetworkError>;

    async fn handle_frame(
        &self,
        channel: &NetworkChannel,
        frame: &Frame,
    ) -> Result<bool, NetworkError>;

    async fn handle_close(&self, channel: &NetworkChannel);
}

/// A lifecycle handler that accepts everything. Useful for tests and for
/// components that rely purely on packet listeners.
pub struct AcceptAllHandler;

#[async_trait]
impl ChannelHandler for AcceptAllHandler {
    async fn handle_open(&self, _channel: &NetworkChannel) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn handle_frame(
        &self,
        _channel: &NetworkChannel,
        _frame: &Frame,
    ) -> Result<bool, NetworkError> {
        Ok(true)
    }

    async fn handle_close(&self, _channel: &NetworkChannel) {}
}

/// Consumes the body of frames arriving on one wire channel id.
///
/// For query frames, the first listener returning `Some(reply)` produces the
/// response body; later listeners still run but their replies are ignored
/// for that frame.
#[async_trait]
pub trait PacketListener: Send + Sync {
    async fn handle(
        &self,
        channel: &NetworkChannel,
        body: DataBuf,
    ) -> Result<Option<DataBuf>, NetworkError>;
}

/// Registry mapping numeric wire channel ids to payload listeners.
#[derive(Default)]
pub struct PacketListenerRegistry {
    listeners: DashMap<i32, Vec<Arc<dyn PacketListener>>>,
}

impl PacketListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel_id: i32, listener: Arc<dyn PacketListener>) {
        self.listeners.entry(channel_id).or_default().push(listener);
    }

    /// Drops every listener for a wire channel id.
    pub fn clear_channel(&self, channel_id: i32) {
        self.listeners.remove(&channel_id);
    }

    pub fn has_listeners(&self, channel_id: i32) -> bool {
        self.listeners
            .get(&channel_id)
            .map(|l| !l.is_empty())
            .unwrap_or(false)
    }

    /// Snapshot of the listeners for one wire channel id.
    pub fn listeners_for(&self, channel_id: i32) -> Vec<Arc<dyn PacketListener>> {
        self.listeners
            .get(&channel_id)
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}
