//! Push-based observation channel over the worker's WebSocket feed.
//!
//! The channel is strictly an accelerator: every event it delivers is also
//! observable by polling, so losing the connection degrades latency, never
//! correctness. The supervisor reconnects with exponential backoff and
//! parks in `Degraded` once the reconnect budget is spent.

use crate::protocol::PushEvent;
use crate::Result;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;
const EVENT_BUFFER: usize = 256;

/// Backoff before reconnect attempt `attempt` (0-indexed):
/// 1s, 2s, 4s, ... capped at 30s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let ms = 1000u64.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(MAX_RECONNECT_DELAY_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect budget exhausted; observation continues by polling only.
    Degraded,
}

pub struct EventChannel {
    url: String,
    max_reconnects: u32,
    keepalive: Duration,
    events: broadcast::Sender<PushEvent>,
    state_tx: watch::Sender<ChannelState>,
    state_rx: watch::Receiver<ChannelState>,
}

impl EventChannel {
    pub fn new(url: impl Into<String>, max_reconnects: u32, keepalive: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        Self {
            url: url.into(),
            max_reconnects,
            keepalive,
            events,
            state_tx,
            state_rx,
        }
    }

    /// Fan-out subscription. Slow subscribers may observe `Lagged`; they
    /// should resubscribe or fall back to the polling view.
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Connection supervisor. Runs until the shutdown signal fires or the
    /// reconnect budget is exhausted.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut attempt: u32 = 0;

        loop {
            let _ = self.state_tx.send(ChannelState::Connecting);

            tokio::select! {
                connected = connect_async(self.url.as_str()) => {
                    match connected {
                        Ok((stream, _)) => {
                            info!(url = %self.url, "event channel connected");
                            attempt = 0;
                            let _ = self.state_tx.send(ChannelState::Connected);
                            if self.pump(stream, &mut shutdown).await {
                                let _ = self.state_tx.send(ChannelState::Disconnected);
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            warn!(url = %self.url, attempt, "event channel connect failed: {err}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    let _ = self.state_tx.send(ChannelState::Disconnected);
                    return Ok(());
                }
            }

            if attempt >= self.max_reconnects {
                warn!(
                    attempts = attempt + 1,
                    "event channel reconnect budget exhausted; polling-only from here"
                );
                let _ = self.state_tx.send(ChannelState::Degraded);
                return Ok(());
            }

            let delay = reconnect_delay(attempt);
            attempt += 1;
            let _ = self.state_tx.send(ChannelState::Disconnected);
            debug!(attempt, ?delay, "event channel reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    return Ok(());
                }
            }
        }
    }

    /// Read frames off one live connection. Returns true on shutdown,
    /// false when the connection dropped and a reconnect is wanted.
    async fn pump(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let (mut sink, mut source) = stream.split();
        let mut keepalive = tokio::time::interval(self.keepalive);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                return false;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("event channel closed by peer");
                            return false;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("event channel read error: {err}");
                            return false;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        return false;
                    }
                }
                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return true;
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<PushEvent>(text) {
            Ok(event) => {
                debug!(?event, "push event");
                self.publish(event);
            }
            Err(err) => {
                // Unknown event shapes are dropped, never fatal.
                warn!("unrecognized push frame ({err}): {text}");
            }
        }
    }

    /// Fan a parsed event out to subscribers. Send only fails when nobody
    /// is subscribed, which is fine.
    pub(crate) fn publish(&self, event: PushEvent) {
        let _ = self.events.send(event);
    }
}

/// Wait on a subscription for the first terminal event about `handle`.
/// Returns `None` if the feed closes first. Lagged receivers skip ahead;
/// a missed terminal event is recovered by the polling channel.
pub async fn wait_for_terminal(
    rx: &mut broadcast::Receiver<PushEvent>,
    handle: &str,
) -> Option<PushEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if event.task_id() != Some(handle) {
                    continue;
                }
                match &event {
                    PushEvent::TaskCompleted { .. } => return Some(event),
                    PushEvent::TaskStatusUpdate { status, .. } if status.is_terminal() => {
                        return Some(event)
                    }
                    _ => continue,
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(handle, skipped, "push subscription lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Accepts terminal status updates too, not just the completion envelope.
pub fn is_terminal_for(event: &PushEvent, handle: &str) -> bool {
    event.task_id() == Some(handle)
        && match event {
            PushEvent::TaskCompleted { .. } => true,
            PushEvent::TaskStatusUpdate { status, .. } => status.is_terminal(),
            _ => false,
        }
}
