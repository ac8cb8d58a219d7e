//! Cooperative shutdown signal.
//!
//! A [`ShutdownTrigger`] raises the signal once; every [`Shutdown`] clone
//! observes it. Blocking waits in the coordinator (queue receive, backoff
//! sleeps) race against [`Shutdown::wait`], while store writes are never
//! raced, so an in-flight write always completes.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Raises the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

/// Observes the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger and signal.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger {
            tx: std::sync::Arc::new(tx),
        },
        Shutdown { rx },
    )
}

impl ShutdownTrigger {
    /// Raise the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Check if the signal was raised.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Create another observer.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    /// Check if the signal was raised.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal is raised.
    ///
    /// Also returns if every trigger was dropped, since nothing can keep the
    /// process alive after that.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns false if the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration).await
    }

    /// Sleep until `deadline` unless shutdown comes first.
    pub async fn sleep_until(&self, deadline: Instant) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => true,
            _ = self.wait() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let (trigger, shutdown) = channel();
        let other = trigger.subscribe();
        assert!(!shutdown.is_triggered());

        let waiter = tokio::spawn(async move { other.wait().await });
        trigger.trigger();
        waiter.await.unwrap();

        assert!(shutdown.is_triggered());
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn test_sleep_is_cut_short() {
        let (trigger, shutdown) = channel();
        trigger.trigger();

        let started = Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_completes_without_signal() {
        let (_trigger, shutdown) = channel();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_dropped_trigger_releases_waiters() {
        let (trigger, shutdown) = channel();
        drop(trigger);
        shutdown.wait().await;
    }
}
