use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, watch};

use crate::channels::{Channel, ChannelRegistry};
use crate::config::BusConfig;
use crate::domains::message::{
    decode_payload, encode_payload, Envelope, InitPort, MessageType, Payload, TabId,
};
use crate::error::{BusError, Result};
use crate::interfaces::diagnostics::{Diagnostic, DiagnosticSink, NoopSink};
use crate::interfaces::transport::{
    FrameReceiver, MessageSender, PortLink, ReplySender, Responder, SendOptions, Transport,
    VisibilitySignal,
};
use crate::services::dispatcher::{Dispatch, Dispatcher};
use crate::services::reconnect::{ReconnectHandle, Reconnector};

/// Invoked with whatever the remote side passed to its responder.
pub type ResponseCallback = Box<dyn FnOnce(Value) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts channels from every other context.
    Hub,
    /// Opens channels to the hub.
    Context,
}

/// Channel lifecycle as seen by one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { name: String, id: u64 },
    Disconnected { name: String, id: u64 },
}

/// Non-owning handle, for handlers that need to send through their own endpoint.
#[derive(Clone)]
pub struct WeakEndpoint {
    inner: Weak<EndpointInner>,
}

impl WeakEndpoint {
    pub fn upgrade(&self) -> Option<Endpoint> {
        Endpoint::upgrade(&self.inner)
    }
}

struct EndpointInner {
    source_id: String,
    role: Role,
    config: BusConfig,
    transport: Arc<dyn Transport>,
    registry: ChannelRegistry,
    dispatcher: Dispatcher,
    events: broadcast::Sender<ChannelEvent>,
    next_channel: AtomicU64,
    accepting: AtomicBool,
    listening: AtomicBool,
    // Never written; its drop ends every task spawned for this endpoint.
    shutdown: watch::Sender<()>,
}

/// Messaging facade for one execution context.
///
/// Cloning is cheap and every clone shares the same channels and handlers.
/// The endpoint whose `source_id` equals the configured hub id plays the hub
/// role.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn new(source_id: impl Into<String>, transport: Arc<dyn Transport>, config: BusConfig) -> Self {
        Self::with_diagnostics(source_id, transport, config, Arc::new(NoopSink))
    }

    pub fn with_diagnostics(
        source_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: BusConfig,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let source_id = source_id.into();
        let role = if source_id == config.hub_id {
            Role::Hub
        } else {
            Role::Context
        };
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(());
        Self {
            inner: Arc::new(EndpointInner {
                dispatcher: Dispatcher::new(source_id.clone(), diagnostics),
                source_id,
                role,
                config,
                transport,
                registry: ChannelRegistry::new(),
                events,
                next_channel: AtomicU64::new(0),
                accepting: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.inner.registry.get(name)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Opens a channel named `name` to the hub and announces this endpoint on it.
    pub async fn connect_to_channel(&self, name: &str) -> Result<Channel> {
        self.require_role(Role::Context, "connect_to_channel")?;
        let link = self.inner.transport.connect(name).await?;
        let channel = self.setup_port(link);
        self.send(name, &self.init_port(), None)?;
        Ok(channel)
    }

    /// Accepts channels opened by other contexts. Hub only.
    pub fn listen_for_connections(&self) -> Result<()> {
        self.require_role(Role::Hub, "listen_for_connections")?;
        if self.inner.accepting.swap(true, Ordering::SeqCst) {
            tracing::warn!(source_id = %self.source_id(), "already listening for connections");
            return Ok(());
        }
        let mut incoming = match self.inner.transport.accept_connections() {
            Ok(incoming) => incoming,
            Err(err) => {
                self.inner.accepting.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let link = tokio::select! {
                    link = incoming.recv() => link,
                    _ = shutdown.changed() => None,
                };
                let Some(link) = link else {
                    break;
                };
                let Some(endpoint) = Endpoint::upgrade(&weak) else {
                    break;
                };
                endpoint.accept(link);
            }
            // Dropping `incoming` frees the runtime's hub slot.
        });
        Ok(())
    }

    /// Routes one-time messages delivered to this context to `on_one_time_message` handlers.
    pub fn listen_for_one_time_messages(&self) -> Result<()> {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            tracing::warn!(source_id = %self.source_id(), "already listening for one-time messages");
            return Ok(());
        }
        let mut deliveries = match self.inner.transport.one_time_messages() {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.inner.listening.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    delivery = deliveries.recv() => delivery,
                    _ = shutdown.changed() => None,
                };
                let Some(delivery) = delivery else {
                    break;
                };
                let Some(endpoint) = Endpoint::upgrade(&weak) else {
                    break;
                };
                match Envelope::from_frame(&delivery.frame) {
                    Ok(envelope) => {
                        endpoint.inner.dispatcher.dispatch_one_time(
                            envelope,
                            &delivery.sender,
                            delivery.responder,
                        );
                    }
                    Err(err) => endpoint.undecodable(err),
                }
            }
        });
        Ok(())
    }

    /// Sends on the named channel. A missing channel is not an error.
    pub fn send_message(
        &self,
        channel_name: &str,
        kind: MessageType,
        payload: Value,
        recipient_id: Option<&str>,
    ) -> Result<()> {
        let Some(channel) = self.inner.registry.get(channel_name) else {
            self.channel_absent(channel_name);
            return Ok(());
        };
        let envelope = Envelope::new(kind, payload, self.source_id()).addressed(recipient_id);
        match channel.post(&envelope) {
            Ok(()) => Ok(()),
            Err(BusError::Transport(_)) => {
                self.channel_absent(channel_name);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn send<P: Payload>(
        &self,
        channel_name: &str,
        payload: &P,
        recipient_id: Option<&str>,
    ) -> Result<()> {
        self.send_message(channel_name, P::KIND, encode_payload(payload)?, recipient_id)
    }

    /// Broadcasts a one-time message. `on_response` fires at most once, and
    /// never if no receiver replies.
    pub fn send_one_time_message(
        &self,
        kind: MessageType,
        payload: Value,
        recipient_id: Option<&str>,
        options: SendOptions,
        on_response: Option<ResponseCallback>,
    ) -> Result<()> {
        let envelope = Envelope::new(kind, payload, self.source_id())
            .addressed(recipient_id)
            .one_time();
        let frame = envelope.to_frame()?;
        let reply = on_response.map(spawn_reply);
        if let Err(err) = self.inner.transport.send_one_time(frame, options, reply) {
            tracing::error!(source_id = %self.source_id(), %kind, %err, "error sending one-time message");
        }
        Ok(())
    }

    /// Sends a one-time message to the contexts bound to `target`.
    pub fn send_message_to_target(
        &self,
        target: TabId,
        kind: MessageType,
        payload: Value,
        options: SendOptions,
        on_response: Option<ResponseCallback>,
    ) -> Result<()> {
        let envelope = Envelope::new(kind, payload, self.source_id()).one_time();
        let frame = envelope.to_frame()?;
        let reply = on_response.map(spawn_reply);
        if let Err(err) = self
            .inner
            .transport
            .send_to_target(target, frame, options, reply)
        {
            tracing::error!(source_id = %self.source_id(), tab_id = target, %kind, %err, "error sending message to target");
        }
        Ok(())
    }

    /// Registers the channel handler for `kind`, replacing any previous one.
    pub fn on_message<F>(&self, kind: MessageType, handler: F) -> bool
    where
        F: Fn(Value, &str, &Channel) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_message(kind, handler)
    }

    /// Registers the one-time handler for `kind`, replacing any previous one.
    pub fn on_one_time_message<F>(&self, kind: MessageType, handler: F) -> bool
    where
        F: Fn(Value, &MessageSender, Option<Responder>) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_one_time_message(kind, handler)
    }

    /// Typed form of [`Endpoint::on_message`]; a payload that does not decode
    /// counts as a handler fault.
    pub fn on<P, F>(&self, handler: F) -> bool
    where
        P: Payload,
        F: Fn(P, &str, &Channel) -> Result<()> + Send + Sync + 'static,
    {
        self.on_message(P::KIND, move |payload, sender_id, channel| {
            handler(decode_payload(payload)?, sender_id, channel)
        })
    }

    pub fn on_one_time<P, F>(&self, handler: F) -> bool
    where
        P: Payload,
        F: Fn(P, &MessageSender, Option<Responder>) -> Result<()> + Send + Sync + 'static,
    {
        self.on_one_time_message(P::KIND, move |payload, sender, responder| {
            handler(decode_payload(payload)?, sender, responder)
        })
    }

    /// Closes the named channel from this side.
    pub fn disconnect(&self, name: &str) -> bool {
        match self.inner.registry.remove(name) {
            Some(channel) => {
                tracing::info!(source_id = %self.source_id(), channel = name, id = channel.id(), "closing channel");
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Keeps the named channel to the hub open, reconnecting after the
    /// configured delay or as soon as `visibility` turns visible.
    pub fn keep_connected(
        &self,
        name: &str,
        visibility: Option<VisibilitySignal>,
    ) -> Result<ReconnectHandle> {
        self.require_role(Role::Context, "keep_connected")?;
        Ok(Reconnector::new(self.clone(), name, self.inner.config.reconnect_delay())
            .with_visibility(visibility)
            .spawn())
    }

    /// Routes one envelope through the channel handler table.
    pub fn dispatch(&self, envelope: Envelope, channel: &Channel) -> Dispatch {
        self.inner.dispatcher.dispatch_channel(envelope, channel)
    }

    fn upgrade(weak: &Weak<EndpointInner>) -> Option<Endpoint> {
        weak.upgrade().map(|inner| Endpoint { inner })
    }

    fn init_port(&self) -> InitPort {
        InitPort {
            source_id: self.source_id().to_string(),
        }
    }

    fn accept(&self, link: PortLink) {
        tracing::info!(source_id = %self.source_id(), channel = %link.name, "incoming connection");
        if self.inner.config.is_ignored_channel(&link.name) {
            self.inner.dispatcher.report(Diagnostic::IgnoredConnection {
                source_id: self.source_id().to_string(),
                channel: link.name,
            });
            return;
        }
        let channel = self.setup_port(link);
        // The hub announces itself without a recipient field.
        let envelope = Envelope::new(
            MessageType::InitPort,
            json!({ "sourceId": self.source_id() }),
            self.source_id(),
        );
        if let Err(err) = channel.post(&envelope) {
            tracing::debug!(source_id = %self.source_id(), channel = channel.name(), %err, "could not announce on new channel");
        }
    }

    fn setup_port(&self, link: PortLink) -> Channel {
        let PortLink {
            name,
            peer,
            outbound,
            inbound,
        } = link;
        let id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = Channel::new(id, name.clone(), peer, outbound);
        // The displaced channel stays open and keeps delivering until its
        // peer disconnects.
        if let Some(previous) = self.inner.registry.register(name.clone(), channel.clone()) {
            tracing::debug!(source_id = %self.source_id(), channel = %name, previous = previous.id(), "replacing registry entry");
        }
        tracing::info!(source_id = %self.source_id(), channel = %name, id, "connected to channel");
        let _ = self.inner.events.send(ChannelEvent::Connected { name, id });

        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(receive_loop(weak, channel.clone(), inbound, shutdown));
        channel
    }

    fn handle_disconnect(&self, channel: &Channel) {
        self.inner.registry.remove_instance(channel.name(), channel.id());
        self.inner.dispatcher.report(Diagnostic::TransportDisconnect {
            source_id: self.source_id().to_string(),
            channel: channel.name().to_string(),
        });
        let _ = self.inner.events.send(ChannelEvent::Disconnected {
            name: channel.name().to_string(),
            id: channel.id(),
        });
    }

    fn require_role(&self, role: Role, operation: &'static str) -> Result<()> {
        if self.inner.role == role {
            return Ok(());
        }
        self.inner.dispatcher.report(Diagnostic::RoleMisuse {
            source_id: self.source_id().to_string(),
            operation,
        });
        Err(BusError::RoleMisuse {
            source_id: self.source_id().to_string(),
            operation,
        })
    }

    fn channel_absent(&self, channel_name: &str) {
        self.inner.dispatcher.report(Diagnostic::ChannelAbsent {
            source_id: self.source_id().to_string(),
            channel: channel_name.to_string(),
        });
    }

    fn undecodable(&self, err: BusError) {
        self.inner.dispatcher.report(Diagnostic::Undecodable {
            source_id: self.source_id().to_string(),
            error: err.to_string(),
        });
    }
}

/// Owns one channel until its peer closes it or [`Channel::close`] is called.
async fn receive_loop(
    weak: Weak<EndpointInner>,
    channel: Channel,
    mut inbound: FrameReceiver,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        let frame = tokio::select! {
            frame = inbound.recv() => frame,
            _ = channel.close_requested() => None,
            _ = shutdown.changed() => return,
        };
        let Some(frame) = frame else {
            break;
        };
        let Some(endpoint) = Endpoint::upgrade(&weak) else {
            return;
        };
        match Envelope::from_frame(&frame) {
            Ok(envelope) => {
                endpoint.dispatch(envelope, &channel);
            }
            Err(err) => endpoint.undecodable(err),
        }
    }
    if let Some(endpoint) = Endpoint::upgrade(&weak) {
        endpoint.handle_disconnect(&channel);
    }
}

fn spawn_reply(on_response: ResponseCallback) -> ReplySender {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok(response) = rx.await {
            on_response(response);
        }
    });
    tx
}
