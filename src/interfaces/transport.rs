use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::domains::message::TabId;
use crate::error::Result;

pub type FrameSender = mpsc::UnboundedSender<String>;
pub type FrameReceiver = mpsc::UnboundedReceiver<String>;
pub type ConnectionReceiver = mpsc::UnboundedReceiver<PortLink>;
pub type DeliveryReceiver = mpsc::UnboundedReceiver<OneTimeDelivery>;
pub type ReplySender = oneshot::Sender<Value>;

/// Where a message came from, as reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSender {
    pub context_id: u64,
    pub tab_id: Option<TabId>,
    pub frame_id: Option<u32>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub frame_id: Option<u32>,
}

/// The local half of a freshly established channel.
///
/// The channel is closed from our side when every clone of `outbound` is
/// dropped, and from the peer's side when `inbound` yields `None`.
pub struct PortLink {
    pub name: String,
    pub peer: MessageSender,
    pub outbound: FrameSender,
    pub inbound: FrameReceiver,
}

/// Reply slot shared by every receiver of a one-time message. First reply wins.
#[derive(Clone)]
pub struct Responder {
    slot: Arc<Mutex<Option<ReplySender>>>,
}

impl Responder {
    pub fn new(reply: ReplySender) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(reply))),
        }
    }

    /// Returns false if a reply was already sent or the requester is gone.
    pub fn respond(&self, value: Value) -> bool {
        let taken = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match taken {
            Some(reply) => reply.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

pub struct OneTimeDelivery {
    pub frame: String,
    pub sender: MessageSender,
    pub responder: Option<Responder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Foreground-visibility signal published by the hosting UI.
pub type VisibilitySignal = watch::Receiver<Visibility>;

/// Delivery primitives one execution context gets from the browser.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a named channel to the hub.
    async fn connect(&self, name: &str) -> Result<PortLink>;

    /// Stream of channels opened by other contexts. Hub only.
    fn accept_connections(&self) -> Result<ConnectionReceiver>;

    /// Stream of one-time messages addressed to this context.
    fn one_time_messages(&self) -> Result<DeliveryReceiver>;

    /// Broadcasts a one-time frame to every other listening context.
    fn send_one_time(
        &self,
        frame: String,
        options: SendOptions,
        reply: Option<ReplySender>,
    ) -> Result<()>;

    /// Sends a one-time frame to the contexts bound to `target`.
    fn send_to_target(
        &self,
        target: TabId,
        frame: String,
        options: SendOptions,
        reply: Option<ReplySender>,
    ) -> Result<()>;
}
