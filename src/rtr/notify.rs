//! Fan-out of "a new serial is available" to every connected client.
//!
//! A prior design hand-rolled this with a `slab::Slab` of
//! per-client `futures::sync::mpsc` senders and a `try_send` that silently
//! drops when a slot already has a pending notification — i.e. coalescing.
//! `tokio::sync::watch` gives the same coalescing semantics for free (only
//! the latest value survives between reads), so the whole registry
//! collapses to one channel every session subscribes to.

use tokio::sync::watch;

use super::serial::Serial;

/// The sending half, held by the refresh loop.
#[derive(Clone)]
pub struct Notifier(watch::Sender<Serial>);

/// The receiving half, held by one client session.
pub struct Listener(watch::Receiver<Serial>);

/// Creates a fresh notifier/listener pair rooted at the given serial.
pub fn channel(initial: Serial) -> (Notifier, Listener) {
    let (tx, rx) = watch::channel(initial);
    (Notifier(tx), Listener(rx))
}

impl Notifier {
    /// Announces that the cache has moved to `serial`.
    ///
    /// A no-op error return means every listener has been dropped; that's
    /// fine, there's simply nobody to notify.
    pub fn notify(&self, serial: Serial) {
        let _ = self.0.send(serial);
    }

    pub fn subscribe(&self) -> Listener {
        Listener(self.0.subscribe())
    }
}

impl Listener {
    /// Waits for the serial to change and returns the new value.
    pub async fn changed(&mut self) -> Option<Serial> {
        self.0.changed().await.ok()?;
        Some(*self.0.borrow())
    }

    pub fn current(&self) -> Serial {
        *self.0.borrow()
    }
}

impl Clone for Listener {
    fn clone(&self) -> Self {
        Listener(self.0.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_observes_latest_notify() {
        let (tx, mut rx) = channel(Serial(0));
        tx.notify(Serial(1));
        tx.notify(Serial(2));
        assert_eq!(rx.changed().await, Some(Serial(2)));
    }

    #[tokio::test]
    async fn fresh_subscriber_sees_current_value() {
        let (tx, _rx) = channel(Serial(0));
        tx.notify(Serial(5));
        let sub = tx.subscribe();
        assert_eq!(sub.current(), Serial(5));
    }
}
