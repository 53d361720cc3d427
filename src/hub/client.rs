//! Per-client outbound buffering with the slow-consumer drop policy.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

use crate::hub::protocol::ServerMessage;

/// Result of queueing one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The buffer was full; the oldest non-alert message was evicted.
    DroppedOldest,
    /// Third consecutive drop; the connection must be closed.
    SlowConsumer,
}

/// Bounded outbound queue for one client connection.
///
/// When full, the oldest non-alert message is evicted so alerts survive
/// backpressure. Three consecutive drops mark the client as a slow
/// consumer.
pub struct OutboundQueue {
    queue: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    capacity: usize,
    consecutive_drops: AtomicU32,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            consecutive_drops: AtomicU32::new(0),
        }
    }

    pub fn push(&self, message: ServerMessage) -> PushOutcome {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if queue.len() < self.capacity {
            queue.push_back(message);
            self.consecutive_drops.store(0, Ordering::Relaxed);
            self.notify.notify_one();
            return PushOutcome::Queued;
        }

        // Full: evict the oldest non-alert in favor of the new message, or
        // drop the new message outright when only alerts are queued.
        if let Some(index) = queue.iter().position(|m| !m.is_alert()) {
            queue.remove(index);
            queue.push_back(message);
        } else if message.is_alert() {
            // No droppable entry; an incoming alert displaces the oldest
            // alert so the newest state wins.
            queue.pop_front();
            queue.push_back(message);
        }
        drop(queue);

        let drops = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
        self.notify.notify_one();
        if drops >= 3 {
            PushOutcome::SlowConsumer
        } else {
            PushOutcome::DroppedOldest
        }
    }

    /// Wait for and take the next queued message.
    pub async fn pop(&self) -> ServerMessage {
        loop {
            {
                let mut queue = match self.queue.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(message) = queue.pop_front() {
                    return message;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        match self.queue.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AlertSeverity;

    fn pong() -> ServerMessage {
        ServerMessage::Pong
    }

    fn alert(n: u32) -> ServerMessage {
        ServerMessage::AlertEvent {
            severity: AlertSeverity::Warning,
            message: format!("alert-{n}"),
        }
    }

    #[test]
    fn overflow_evicts_oldest_non_alert_and_keeps_alerts() {
        let queue = OutboundQueue::new(3);
        assert_eq!(queue.push(alert(1)), PushOutcome::Queued);
        assert_eq!(queue.push(pong()), PushOutcome::Queued);
        assert_eq!(queue.push(pong()), PushOutcome::Queued);

        // Full: the oldest pong goes, the alert stays.
        assert_eq!(queue.push(pong()), PushOutcome::DroppedOldest);
        assert_eq!(queue.len(), 3);

        let mut kept_alerts = 0;
        for _ in 0..3 {
            if futures::executor::block_on(queue.pop()).is_alert() {
                kept_alerts += 1;
            }
        }
        assert_eq!(kept_alerts, 1);
    }

    #[test]
    fn three_consecutive_drops_flag_a_slow_consumer() {
        let queue = OutboundQueue::new(1);
        assert_eq!(queue.push(pong()), PushOutcome::Queued);
        assert_eq!(queue.push(pong()), PushOutcome::DroppedOldest);
        assert_eq!(queue.push(pong()), PushOutcome::DroppedOldest);
        assert_eq!(queue.push(pong()), PushOutcome::SlowConsumer);
    }

    #[test]
    fn successful_queue_resets_the_drop_streak() {
        let queue = OutboundQueue::new(1);
        queue.push(pong());
        assert_eq!(queue.push(pong()), PushOutcome::DroppedOldest);

        // Drain, then a clean push resets the streak.
        futures::executor::block_on(queue.pop());
        assert_eq!(queue.push(pong()), PushOutcome::Queued);
        assert_eq!(queue.push(pong()), PushOutcome::DroppedOldest);
        assert_eq!(queue.push(pong()), PushOutcome::DroppedOldest);
        assert_eq!(queue.push(pong()), PushOutcome::SlowConsumer);
    }

    #[tokio::test]
    async fn pop_waits_for_the_next_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new(4));
        let popper = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(pong());
        let message = tokio::time::timeout(std::time::Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, ServerMessage::Pong);
    }
}
