use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domains::message::TabId;
use crate::error::{BusError, Result};
use crate::interfaces::transport::{
    ConnectionReceiver, DeliveryReceiver, MessageSender, OneTimeDelivery, PortLink, ReplySender,
    Responder, SendOptions, Transport,
};

struct HubListener {
    identity: MessageSender,
    connections: mpsc::UnboundedSender<PortLink>,
}

struct Listener {
    identity: MessageSender,
    deliveries: mpsc::UnboundedSender<OneTimeDelivery>,
}

#[derive(Default)]
struct RuntimeInner {
    next_context: AtomicU64,
    hub: Mutex<Option<HubListener>>,
    listeners: Mutex<Vec<Listener>>,
}

/// In-memory browser: every context created from one runtime can reach the
/// others through the same primitives an extension gets from the browser.
#[derive(Clone, Default)]
pub struct LocalRuntime {
    inner: Arc<RuntimeInner>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context without a tab (background worker, side panel, popup).
    pub fn extension_page(&self) -> LocalTransport {
        self.context(MessageSender::default())
    }

    /// A top-frame content script injected into `tab_id`.
    pub fn content_script(&self, tab_id: TabId, url: &str) -> LocalTransport {
        self.frame(tab_id, 0, url)
    }

    pub fn frame(&self, tab_id: TabId, frame_id: u32, url: &str) -> LocalTransport {
        self.context(MessageSender {
            tab_id: Some(tab_id),
            frame_id: Some(frame_id),
            url: Some(url.to_string()),
            ..MessageSender::default()
        })
    }

    fn context(&self, mut identity: MessageSender) -> LocalTransport {
        identity.context_id = self.inner.next_context.fetch_add(1, Ordering::Relaxed) + 1;
        LocalTransport {
            runtime: self.inner.clone(),
            identity,
        }
    }

    pub fn has_hub(&self) -> bool {
        self.inner
            .hub
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|hub| !hub.connections.is_closed())
    }
}

pub struct LocalTransport {
    runtime: Arc<RuntimeInner>,
    identity: MessageSender,
}

impl LocalTransport {
    pub fn identity(&self) -> &MessageSender {
        &self.identity
    }

    fn deliver(
        &self,
        frame: String,
        reply: Option<ReplySender>,
        accepts: impl Fn(&MessageSender) -> bool,
    ) -> usize {
        let responder = reply.map(Responder::new);
        let mut listeners = self
            .runtime
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.retain(|listener| !listener.deliveries.is_closed());
        let mut delivered = 0;
        for listener in listeners.iter() {
            if listener.identity.context_id == self.identity.context_id
                || !accepts(&listener.identity)
            {
                continue;
            }
            let delivery = OneTimeDelivery {
                frame: frame.clone(),
                sender: self.identity.clone(),
                responder: responder.clone(),
            };
            if listener.deliveries.send(delivery).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, name: &str) -> Result<PortLink> {
        let (to_hub, from_client) = mpsc::unbounded_channel();
        let (to_client, from_hub) = mpsc::unbounded_channel();

        let accepted = PortLink {
            name: name.to_string(),
            peer: self.identity.clone(),
            outbound: to_client,
            inbound: from_client,
        };
        let hub_identity = {
            let hub = self
                .runtime
                .hub
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let delivered = match hub.as_ref() {
                Some(listener) => match listener.connections.send(accepted) {
                    Ok(()) => Some(listener.identity.clone()),
                    Err(_) => None,
                },
                None => None,
            };
            // Nobody accepted: the hub half is dropped and the caller observes
            // an immediate disconnect, as a browser would report it.
            delivered.unwrap_or_else(|| {
                tracing::debug!(channel = name, "no hub listening for connections");
                MessageSender::default()
            })
        };

        Ok(PortLink {
            name: name.to_string(),
            peer: hub_identity,
            outbound: to_hub,
            inbound: from_hub,
        })
    }

    fn accept_connections(&self) -> Result<ConnectionReceiver> {
        let mut hub = self
            .runtime
            .hub
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if hub
            .as_ref()
            .is_some_and(|current| !current.connections.is_closed())
        {
            return Err(BusError::Transport(
                "another context is already accepting connections".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *hub = Some(HubListener {
            identity: self.identity.clone(),
            connections: tx,
        });
        Ok(rx)
    }

    fn one_time_messages(&self) -> Result<DeliveryReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Listener {
                identity: self.identity.clone(),
                deliveries: tx,
            });
        Ok(rx)
    }

    fn send_one_time(
        &self,
        frame: String,
        _options: SendOptions,
        reply: Option<ReplySender>,
    ) -> Result<()> {
        let delivered = self.deliver(frame, reply, |listener| listener.tab_id.is_none());
        if delivered == 0 {
            tracing::debug!(context_id = self.identity.context_id, "no receiving end for one-time message");
        }
        Ok(())
    }

    fn send_to_target(
        &self,
        target: TabId,
        frame: String,
        options: SendOptions,
        reply: Option<ReplySender>,
    ) -> Result<()> {
        let delivered = self.deliver(frame, reply, |listener| {
            listener.tab_id == Some(target)
                && options
                    .frame_id
                    .map_or(true, |frame_id| listener.frame_id == Some(frame_id))
        });
        if delivered == 0 {
            tracing::debug!(tab_id = target, "no receiving end in target tab");
        }
        Ok(())
    }
}
