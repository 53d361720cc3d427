//! Per-host wakeup signals for long-polling agents.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// One lazily-created [`Notify`] per host, never removed.
///
/// `enqueue` fires the host's notify; a parked long-poll retries its lease.
/// `Notify` stores a single permit, so a signal that arrives between an
/// empty lease and the `notified().await` is not lost.
#[derive(Default)]
pub struct HostSignals {
    inner: Mutex<HashMap<String, Arc<Notify>>>,
}

impl HostSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the notify handle for a host.
    pub fn for_host(&self, host_id: &str) -> Arc<Notify> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            inner
                .entry(host_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    /// Wake one poller for `host_id`.
    pub fn notify(&self, host_id: &str) {
        self.for_host(host_id).notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_wakes_a_parked_waiter() {
        let signals = Arc::new(HostSignals::new());
        let notify = signals.for_host("h1");

        let waiter = tokio::spawn(async move { notify.notified().await });
        tokio::task::yield_now().await;
        signals.notify("h1");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn signal_before_wait_is_not_lost() {
        let signals = HostSignals::new();
        signals.notify("h1");
        let notify = signals.for_host("h1");
        tokio::time::timeout(Duration::from_millis(100), notify.notified())
            .await
            .expect("stored permit should satisfy the wait");
    }

    #[tokio::test]
    async fn hosts_are_independent() {
        let signals = HostSignals::new();
        signals.notify("h1");
        let other = signals.for_host("h2");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), other.notified())
                .await
                .is_err(),
            "h2 must not observe h1's signal"
        );
    }
}
