use std::fmt;
use std::sync::Mutex;

use crate::domains::message::MessageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerTable {
    Channel,
    OneTime,
}

impl fmt::Display for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerTable::Channel => f.write_str("channel"),
            HandlerTable::OneTime => f.write_str("one-time"),
        }
    }
}

/// Non-fatal conditions raised inside an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    HandlerReplaced {
        source_id: String,
        table: HandlerTable,
        kind: MessageType,
    },
    NoHandlerRegistered {
        source_id: String,
        table: HandlerTable,
        kind: MessageType,
    },
    ChannelAbsent {
        source_id: String,
        channel: String,
    },
    RoleMisuse {
        source_id: String,
        operation: &'static str,
    },
    HandlerFault {
        source_id: String,
        kind: MessageType,
        error: String,
    },
    TransportDisconnect {
        source_id: String,
        channel: String,
    },
    IgnoredConnection {
        source_id: String,
        channel: String,
    },
    Undecodable {
        source_id: String,
        error: String,
    },
}

impl Diagnostic {
    pub fn log(&self) {
        match self {
            Diagnostic::HandlerReplaced {
                source_id,
                table,
                kind,
            } => tracing::warn!(
                source_id = %source_id,
                %table,
                %kind,
                "handler already registered, overwriting"
            ),
            Diagnostic::NoHandlerRegistered {
                source_id,
                table,
                kind,
            } => tracing::warn!(source_id = %source_id, %table, %kind, "no handler for message type"),
            Diagnostic::ChannelAbsent { source_id, channel } => {
                tracing::debug!(source_id = %source_id, %channel, "channel not connected, message dropped")
            }
            Diagnostic::RoleMisuse {
                source_id,
                operation,
            } => tracing::warn!(source_id = %source_id, operation, "operation not allowed for this role"),
            Diagnostic::HandlerFault {
                source_id,
                kind,
                error,
            } => tracing::error!(source_id = %source_id, %kind, %error, "handler failed"),
            Diagnostic::TransportDisconnect { source_id, channel } => {
                tracing::info!(source_id = %source_id, %channel, "disconnected from channel")
            }
            Diagnostic::IgnoredConnection { source_id, channel } => {
                tracing::info!(source_id = %source_id, %channel, "ignoring reserved connection")
            }
            Diagnostic::Undecodable { source_id, error } => {
                tracing::warn!(source_id = %source_id, %error, "dropping undecodable frame")
            }
        }
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: &Diagnostic);
}

/// Sink used when the host only wants the log output.
pub struct NoopSink;

impl DiagnosticSink for NoopSink {
    fn report(&self, _diagnostic: &Diagnostic) {}
}

/// Keeps every reported diagnostic in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, predicate: impl Fn(&Diagnostic) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|event| predicate(event))
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn report(&self, diagnostic: &Diagnostic) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(diagnostic.clone());
    }
}
