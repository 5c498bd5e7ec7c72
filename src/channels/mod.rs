use std::sync::Arc;

use tokio::sync::Notify;

use crate::domains::message::Envelope;
use crate::error::{BusError, Result};
use crate::interfaces::transport::{FrameSender, MessageSender};

pub mod registry;

pub use registry::ChannelRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// Sending side of an established channel.
///
/// Cheap to clone. The receive loop owns one clone for as long as the peer
/// keeps its side open, so a channel outlives its registry entry until either
/// the peer disconnects or [`Channel::close`] is called.
#[derive(Debug, Clone)]
pub struct Channel {
    id: u64,
    name: String,
    peer: MessageSender,
    outbound: FrameSender,
    close: Arc<Notify>,
}

impl Channel {
    pub(crate) fn new(id: u64, name: String, peer: MessageSender, outbound: FrameSender) -> Self {
        Self {
            id,
            name,
            peer,
            outbound,
            close: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> &MessageSender {
        &self.peer
    }

    pub fn state(&self) -> ChannelState {
        if self.outbound.is_closed() {
            ChannelState::Closed
        } else {
            ChannelState::Open
        }
    }

    pub fn post(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_frame()?;
        self.outbound
            .send(frame)
            .map_err(|_| BusError::Transport(format!("channel {} is closed", self.name)))
    }

    /// Asks the receive loop to let go of this channel.
    pub(crate) fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`Channel::close`] was called on any clone.
    pub(crate) async fn close_requested(&self) {
        self.close.notified().await;
    }
}
