use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::channels::Channel;
use crate::domains::message::{Envelope, MessageType};
use crate::error::Result;
use crate::interfaces::diagnostics::{Diagnostic, DiagnosticSink, HandlerTable};
use crate::interfaces::transport::{MessageSender, Responder};

/// Handler for messages arriving on a channel: `(payload, sender_id, channel)`.
pub type ChannelHandler = Arc<dyn Fn(Value, &str, &Channel) -> Result<()> + Send + Sync>;

/// Handler for one-time messages: `(payload, sender, responder)`.
pub type OneTimeHandler =
    Arc<dyn Fn(Value, &MessageSender, Option<Responder>) -> Result<()> + Send + Sync>;

/// Outcome of routing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// Addressed to another endpoint.
    Skipped,
    Unhandled,
    Faulted,
}

pub struct Dispatcher {
    source_id: String,
    channel_handlers: RwLock<HashMap<MessageType, ChannelHandler>>,
    one_time_handlers: RwLock<HashMap<MessageType, OneTimeHandler>>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl Dispatcher {
    pub fn new(source_id: impl Into<String>, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            source_id: source_id.into(),
            channel_handlers: RwLock::new(HashMap::new()),
            one_time_handlers: RwLock::new(HashMap::new()),
            diagnostics,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Registers the channel handler for `kind`. Returns true if it replaced one.
    pub fn on_message<F>(&self, kind: MessageType, handler: F) -> bool
    where
        F: Fn(Value, &str, &Channel) -> Result<()> + Send + Sync + 'static,
    {
        let handler: ChannelHandler = Arc::new(handler);
        let replaced = self
            .channel_handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, handler)
            .is_some();
        if replaced {
            self.report(Diagnostic::HandlerReplaced {
                source_id: self.source_id.clone(),
                table: HandlerTable::Channel,
                kind,
            });
        }
        replaced
    }

    /// Registers the one-time handler for `kind`. Returns true if it replaced one.
    pub fn on_one_time_message<F>(&self, kind: MessageType, handler: F) -> bool
    where
        F: Fn(Value, &MessageSender, Option<Responder>) -> Result<()> + Send + Sync + 'static,
    {
        let handler: OneTimeHandler = Arc::new(handler);
        let replaced = self
            .one_time_handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, handler)
            .is_some();
        if replaced {
            self.report(Diagnostic::HandlerReplaced {
                source_id: self.source_id.clone(),
                table: HandlerTable::OneTime,
                kind,
            });
        }
        replaced
    }

    pub fn has_handler(&self, table: HandlerTable, kind: MessageType) -> bool {
        match table {
            HandlerTable::Channel => self
                .channel_handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains_key(&kind),
            HandlerTable::OneTime => self
                .one_time_handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains_key(&kind),
        }
    }

    pub fn dispatch_channel(&self, envelope: Envelope, channel: &Channel) -> Dispatch {
        let handler = self
            .channel_handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&envelope.kind)
            .cloned();
        let Some(handler) = handler else {
            self.report(Diagnostic::NoHandlerRegistered {
                source_id: self.source_id.clone(),
                table: HandlerTable::Channel,
                kind: envelope.kind,
            });
            return Dispatch::Unhandled;
        };
        if !envelope.is_addressed_to(&self.source_id) {
            tracing::debug!(
                source_id = %self.source_id,
                kind = %envelope.kind,
                channel = channel.name(),
                "message addressed elsewhere"
            );
            return Dispatch::Skipped;
        }
        let Envelope {
            kind,
            payload,
            sender_id,
            ..
        } = envelope;
        self.invoke(kind, || handler(payload, &sender_id, channel))
    }

    pub fn dispatch_one_time(
        &self,
        envelope: Envelope,
        sender: &MessageSender,
        responder: Option<Responder>,
    ) -> Dispatch {
        let handler = self
            .one_time_handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&envelope.kind)
            .cloned();
        let Some(handler) = handler else {
            self.report(Diagnostic::NoHandlerRegistered {
                source_id: self.source_id.clone(),
                table: HandlerTable::OneTime,
                kind: envelope.kind,
            });
            return Dispatch::Unhandled;
        };
        if !envelope.is_addressed_to(&self.source_id) {
            tracing::debug!(
                source_id = %self.source_id,
                kind = %envelope.kind,
                "one-time message addressed elsewhere"
            );
            return Dispatch::Skipped;
        }
        let kind = envelope.kind;
        self.invoke(kind, || handler(envelope.payload, sender, responder))
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        diagnostic.log();
        self.diagnostics.report(&diagnostic);
    }

    fn invoke(&self, kind: MessageType, call: impl FnOnce() -> Result<()>) -> Dispatch {
        let error = match catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(())) => return Dispatch::Handled,
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        self.report(Diagnostic::HandlerFault {
            source_id: self.source_id.clone(),
            kind,
            error,
        });
        Dispatch::Faulted
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::error::BusError;
    use crate::interfaces::diagnostics::MemorySink;

    fn dispatcher(id: &str) -> (Dispatcher, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (Dispatcher::new(id, sink.clone()), sink)
    }

    fn channel() -> Channel {
        let (tx, _rx) = mpsc::unbounded_channel();
        Channel::new(1, "sidepanel".to_string(), MessageSender::default(), tx)
    }

    fn recorder() -> (
        Arc<Mutex<Vec<String>>>,
        impl Fn(Value, &str, &Channel) -> Result<()> + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |payload: Value, sender: &str, _channel: &Channel| {
            sink.lock()
                .unwrap()
                .push(format!("{sender}:{}", payload["n"]));
            Ok(())
        };
        (seen, handler)
    }

    #[test]
    fn invokes_the_registered_handler_with_sender() {
        let (dispatcher, _) = dispatcher("sidepanel");
        let (seen, handler) = recorder();
        dispatcher.on_message(MessageType::PageData, handler);

        let envelope = Envelope::new(MessageType::PageData, json!({"n": 1}), "background");
        assert_eq!(dispatcher.dispatch_channel(envelope, &channel()), Dispatch::Handled);
        assert_eq!(*seen.lock().unwrap(), vec!["background:1"]);
    }

    #[test]
    fn second_registration_replaces_the_first_and_warns() {
        let (dispatcher, sink) = dispatcher("sidepanel");
        let (first, h1) = recorder();
        let (second, h2) = recorder();
        assert!(!dispatcher.on_message(MessageType::PageData, h1));
        assert!(dispatcher.on_message(MessageType::PageData, h2));
        assert_eq!(
            sink.snapshot(),
            vec![Diagnostic::HandlerReplaced {
                source_id: "sidepanel".to_string(),
                table: HandlerTable::Channel,
                kind: MessageType::PageData,
            }]
        );

        let envelope = Envelope::new(MessageType::PageData, json!({"n": 2}), "background");
        dispatcher.dispatch_channel(envelope, &channel());
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn missing_handler_is_reported_and_dropped() {
        let (dispatcher, sink) = dispatcher("sidepanel");
        let envelope = Envelope::new(MessageType::TabUpdated, json!({}), "background");
        assert_eq!(dispatcher.dispatch_channel(envelope, &channel()), Dispatch::Unhandled);
        assert_eq!(
            sink.count(|d| matches!(d, Diagnostic::NoHandlerRegistered { .. })),
            1
        );
    }

    #[test]
    fn foreign_recipient_is_skipped_silently() {
        let (dispatcher, sink) = dispatcher("Y");
        let (seen, handler) = recorder();
        dispatcher.on_message(MessageType::PageData, handler);
        let envelope =
            Envelope::new(MessageType::PageData, json!({"n": 1}), "background").addressed(Some("X"));
        assert_eq!(dispatcher.dispatch_channel(envelope, &channel()), Dispatch::Skipped);
        assert!(seen.lock().unwrap().is_empty());
        assert!(sink.snapshot().is_empty());

        let envelope =
            Envelope::new(MessageType::PageData, json!({"n": 2}), "background").addressed(Some("Y"));
        assert_eq!(dispatcher.dispatch_channel(envelope, &channel()), Dispatch::Handled);
    }

    #[test]
    fn faulty_handlers_do_not_stop_later_dispatch() {
        let (dispatcher, sink) = dispatcher("sidepanel");
        dispatcher.on_message(
            MessageType::Error,
            |_, _, _| Err(BusError::Handler("boom".to_string())),
        );
        dispatcher.on_message(MessageType::TabUpdated, |_, _, _| panic!("kaboom"));
        let (seen, handler) = recorder();
        dispatcher.on_message(MessageType::PageData, handler);

        let ch = channel();
        let err = Envelope::new(MessageType::Error, json!({}), "background");
        assert_eq!(dispatcher.dispatch_channel(err.clone(), &ch), Dispatch::Faulted);
        let panicking = Envelope::new(MessageType::TabUpdated, json!({}), "background");
        assert_eq!(dispatcher.dispatch_channel(panicking, &ch), Dispatch::Faulted);
        let ok = Envelope::new(MessageType::PageData, json!({"n": 3}), "background");
        assert_eq!(dispatcher.dispatch_channel(ok, &ch), Dispatch::Handled);
        assert_eq!(dispatcher.dispatch_channel(err, &ch), Dispatch::Faulted);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(sink.count(|d| matches!(d, Diagnostic::HandlerFault { .. })), 3);
        assert!(dispatcher.has_handler(HandlerTable::Channel, MessageType::Error));
    }

    #[test]
    fn one_time_table_is_independent() {
        let (dispatcher, _) = dispatcher("background");
        let (_, handler) = recorder();
        dispatcher.on_message(MessageType::PageLoaded, handler);
        let envelope = Envelope::new(MessageType::PageLoaded, json!({}), "gmail-script").one_time();
        assert_eq!(
            dispatcher.dispatch_one_time(envelope.clone(), &MessageSender::default(), None),
            Dispatch::Unhandled
        );

        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        dispatcher.on_one_time_message(
            MessageType::PageLoaded,
            move |_, sender, responder| {
                *counter.lock().unwrap() += 1;
                if let Some(responder) = responder {
                    responder.respond(json!({"tabId": sender.tab_id}));
                }
                Ok(())
            },
        );
        let sender = MessageSender {
            tab_id: Some(7),
            ..MessageSender::default()
        };
        assert_eq!(
            dispatcher.dispatch_one_time(envelope, &sender, None),
            Dispatch::Handled
        );
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
