//! Realtime hub: WebSocket fan-out of bus events to dashboard clients.
//!
//! Each connection owns one bus subscription; topic filtering happens here,
//! per client. Outbound traffic flows through a bounded queue with the
//! slow-consumer policy; the server emits `pong` on an interval and closes
//! idle connections.

mod client;
mod protocol;
mod topic;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::bus::{EventBus, EventFilter};
use crate::config::HubConfig;

pub use client::{OutboundQueue, PushOutcome};
pub use protocol::{ClientMessage, ServerMessage, translate};
pub use topic::TopicSet;

/// The realtime hub.
pub struct RealtimeHub {
    bus: Arc<EventBus>,
    config: HubConfig,
    clients: Mutex<HashMap<Uuid, Arc<OutboundQueue>>>,
}

impl RealtimeHub {
    pub fn new(bus: Arc<EventBus>, config: HubConfig) -> Self {
        Self {
            bus,
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn connection_count(&self) -> usize {
        match self.clients.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Drive one client connection to completion.
    pub async fn serve_connection(self: Arc<Self>, socket: WebSocket) {
        let id = Uuid::new_v4();
        let outbound = Arc::new(OutboundQueue::new(self.config.client_buffer));

        let Ok((mut events, subscription)) = self.bus.subscribe(EventFilter::all()) else {
            // Bus already closed; nothing to serve.
            return;
        };
        self.register(id, Arc::clone(&outbound));
        outbound.push(ServerMessage::Welcome { connection_id: id });
        tracing::debug!(client = %id, "Realtime client connected");

        let mut topics = TopicSet::new();
        let (mut ws_tx, mut ws_rx) = socket.split();
        let mut pong_ticker = tokio::time::interval(self.config.pong_interval);
        pong_ticker.tick().await; // immediate first tick
        let mut last_client_traffic = tokio::time::Instant::now();

        let close_reason: Option<&str> = loop {
            tokio::select! {
                message = outbound.pop() => {
                    match serde_json::to_string(&message) {
                        Ok(json) => {
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break None;
                            }
                        }
                        Err(e) => {
                            tracing::error!(client = %id, error = %e, "Failed to encode server message");
                        }
                    }
                }
                event = events.next() => {
                    let Some(event) = event else { break None };
                    let Some((topic, message)) = translate(&event) else { continue };
                    let deliver = topic.as_deref().map(|t| topics.matches(t)).unwrap_or(true);
                    if !deliver {
                        continue;
                    }
                    if outbound.push(message) == PushOutcome::SlowConsumer {
                        tracing::warn!(client = %id, "Closing slow consumer");
                        break Some("slow-consumer");
                    }
                }
                incoming = ws_rx.next() => {
                    let Some(Ok(frame)) = incoming else { break None };
                    last_client_traffic = tokio::time::Instant::now();
                    match frame {
                        Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { topics: add }) => topics.subscribe(add),
                            Ok(ClientMessage::Unsubscribe { topics: remove }) => {
                                topics.unsubscribe(remove);
                            }
                            Ok(ClientMessage::Ping) => {
                                outbound.push(ServerMessage::Pong);
                            }
                            Err(e) => {
                                tracing::debug!(client = %id, error = %e, "Ignoring malformed client message");
                            }
                        },
                        Message::Close(_) => break None,
                        _ => {}
                    }
                }
                _ = pong_ticker.tick() => {
                    if last_client_traffic.elapsed() >= self.config.idle_timeout {
                        break Some("timeout");
                    }
                    outbound.push(ServerMessage::Pong);
                }
            }
        };

        self.bus.unsubscribe(subscription);
        self.unregister(id);
        if let Some(reason) = close_reason {
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: reason.into(),
                })))
                .await;
        }
        tracing::debug!(client = %id, reason = ?close_reason, "Realtime client disconnected");
    }

    fn register(&self, id: Uuid, outbound: Arc<OutboundQueue>) {
        match self.clients.lock() {
            Ok(mut guard) => {
                guard.insert(id, outbound);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, outbound);
            }
        }
    }

    fn unregister(&self, id: Uuid) {
        match self.clients.lock() {
            Ok(mut guard) => {
                guard.remove(&id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_with_no_connections() {
        let hub = RealtimeHub::new(
            Arc::new(EventBus::default()),
            HubConfig {
                client_buffer: 100,
                pong_interval: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(60),
            },
        );
        assert_eq!(hub.connection_count(), 0);
    }
}
