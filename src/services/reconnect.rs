use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::channels::ChannelState;
use crate::error::{BusError, Result};
use crate::interfaces::transport::{Visibility, VisibilitySignal};
use crate::services::endpoint::{ChannelEvent, Endpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Keeps one named channel to the hub alive.
///
/// After a disconnect the channel is reopened once the fixed delay elapses,
/// or immediately when the host reports it became visible. There is no retry
/// limit and no backoff.
pub struct Reconnector {
    endpoint: Endpoint,
    name: String,
    delay: Duration,
    visibility: Option<VisibilitySignal>,
}

impl Reconnector {
    pub fn new(endpoint: Endpoint, name: impl Into<String>, delay: Duration) -> Self {
        Self {
            endpoint,
            name: name.into(),
            delay,
            visibility: None,
        }
    }

    pub fn with_visibility(mut self, visibility: Option<VisibilitySignal>) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn spawn(self) -> ReconnectHandle {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let attempts = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(
            Supervisor {
                endpoint: self.endpoint,
                name: self.name,
                delay: self.delay,
                visibility: self.visibility,
                state: state_tx,
                attempts: attempts.clone(),
                current: None,
                retry_at: None,
            }
            .run(shutdown_rx),
        );
        ReconnectHandle {
            state: state_rx,
            attempts,
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Owner-side view of a running [`Reconnector`]. Dropping it stops reconnection.
pub struct ReconnectHandle {
    state: watch::Receiver<LinkState>,
    attempts: Arc<AtomicU64>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReconnectHandle {
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Number of connection attempts made so far, the first one included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn wait_for(&mut self, state: LinkState) -> Result<()> {
        self.state
            .wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|e| BusError::Runtime(e.to_string()))
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for ReconnectHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

struct Supervisor {
    endpoint: Endpoint,
    name: String,
    delay: Duration,
    visibility: Option<VisibilitySignal>,
    state: watch::Sender<LinkState>,
    attempts: Arc<AtomicU64>,
    current: Option<u64>,
    retry_at: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut events = self.endpoint.subscribe();
        self.attempt().await;

        loop {
            let retry_at = self.retry_at.unwrap_or_else(Instant::now);
            let waiting = self.current.is_none();
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Ok(ChannelEvent::Disconnected { name, id })
                        if name == self.name && self.current == Some(id) =>
                    {
                        self.lost();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(channel = %self.name, skipped, "channel events lagged");
                        let still_open = self
                            .endpoint
                            .channel(&self.name)
                            .is_some_and(|channel| Some(channel.id()) == self.current);
                        if self.current.is_some() && !still_open {
                            self.lost();
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = sleep_until(retry_at), if waiting && self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.attempt().await;
                }
                visibility = next_visibility(&mut self.visibility), if waiting => match visibility {
                    Some(Visibility::Visible) => {
                        tracing::debug!(channel = %self.name, "became visible, reconnecting now");
                        self.retry_at = None;
                        self.attempt().await;
                    }
                    Some(Visibility::Hidden) => {}
                    None => self.visibility = None,
                },
            }
        }
        tracing::debug!(channel = %self.name, "reconnection stopped");
    }

    async fn attempt(&mut self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(LinkState::Connecting);
        match self.endpoint.connect_to_channel(&self.name).await {
            Ok(channel) => {
                // A channel nobody accepted is already closed; its disconnect
                // event schedules the next attempt.
                self.current = Some(channel.id());
                if channel.state() == ChannelState::Open {
                    self.state.send_replace(LinkState::Connected);
                }
            }
            Err(err) => {
                tracing::warn!(channel = %self.name, %err, "reconnect attempt failed");
                self.current = None;
                self.schedule();
            }
        }
    }

    fn lost(&mut self) {
        self.current = None;
        self.schedule();
    }

    fn schedule(&mut self) {
        // Only a change that happens while disconnected may cut the delay short.
        if let Some(signal) = self.visibility.as_mut() {
            signal.borrow_and_update();
        }
        self.state.send_replace(LinkState::Disconnected);
        self.retry_at = Some(Instant::now() + self.delay);
        tracing::info!(channel = %self.name, delay_ms = self.delay.as_millis() as u64, "reconnecting after delay");
    }
}

async fn next_visibility(signal: &mut Option<VisibilitySignal>) -> Option<Visibility> {
    match signal {
        Some(signal) => match signal.changed().await {
            Ok(()) => Some(*signal.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
