//! Stop signal for the server worker's background loops.

use tokio::sync::watch;

/// Fires once and stays fired.
///
/// The rules check, services and statistics loops each hold a
/// [`ShutdownListener`]. A listener created after the trigger, or polled late,
/// still sees it.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Returns false when it had already fired.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Loops still listening.
    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A background loop's end of [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once the worker stops, or when its [`Shutdown`] is gone.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn every_listener_stops() {
        let shutdown = Shutdown::new();
        let mut first = shutdown.subscribe();
        let mut second = first.clone();
        assert_eq!(shutdown.listeners(), 2);
        assert!(shutdown.trigger());
        first.stopped().await;
        second.stopped().await;
        drop(first);
        assert_eq!(shutdown.listeners(), 1);
    }

    #[tokio::test]
    async fn late_listener_sees_earlier_trigger() {
        let shutdown = Shutdown::new();
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());

        let mut late = shutdown.subscribe();
        assert!(late.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), late.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_coordinator_releases_listeners() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.subscribe();
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), listener.stopped())
            .await
            .unwrap();
        assert!(!listener.is_stopped());
    }
}
