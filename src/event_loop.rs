//! # Main Loop
//!
//! The session runs on one thread. Background producers (the settings-file
//! watcher, tasks on the bus client's tokio runtime) never touch session
//! state directly; they post a [`LoopEvent`] through a [`LoopSender`], and the
//! session thread routes it to the store or bus client when it drains the loop.
//!
//! This is the same split the panel applet uses between its UI and its
//! background service: an `mpsc` channel in each direction, drained with
//! `try_recv()` on the owning thread.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::dbus_client::CallId;
use crate::error::BusError;
use crate::registry::SubscriptionId;
use crate::schema::Value;

/// Work handed to the loop thread.
#[derive(Debug)]
pub enum LoopEvent {
    /// A key was written through this process's store handle.
    StoreChanged { key: String, value: Value },
    /// The settings file changed on disk (possibly by another process).
    StoreFileChanged,
    /// A bus signal arrived for one subscription.
    Signal {
        subscription: SubscriptionId,
        payload: String,
    },
    /// A remote call finished.
    CallComplete {
        call: CallId,
        result: Result<String, BusError>,
    },
}

/// Sending half, cloneable and `Send`.
#[derive(Debug, Clone)]
pub struct LoopSender {
    tx: Sender<LoopEvent>,
}

impl LoopSender {
    /// Queues an event. Returns false once the loop has been dropped.
    pub fn post(&self, event: LoopEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Receiving half, owned by the session.
#[derive(Debug)]
pub struct MainLoop {
    tx: Sender<LoopEvent>,
    rx: Receiver<LoopEvent>,
}

impl MainLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> LoopSender {
        LoopSender {
            tx: self.tx.clone(),
        }
    }

    /// Next queued event, without blocking.
    pub fn try_next(&self) -> Option<LoopEvent> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next event.
    ///
    /// Only for threads that exist to run the loop; never call this from a
    /// UI thread.
    pub fn next_timeout(&self, timeout: Duration) -> Option<LoopEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Discards everything queued. Returns how many events were dropped.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_post_order() {
        let main_loop = MainLoop::new();
        let sender = main_loop.sender();

        let handle = std::thread::spawn(move || {
            for payload in ["a", "b", "c"] {
                sender.post(LoopEvent::Signal {
                    subscription: SubscriptionId::from_raw(1),
                    payload: payload.to_string(),
                });
            }
        });
        handle.join().unwrap();

        let mut seen = Vec::new();
        while let Some(LoopEvent::Signal { payload, .. }) = main_loop.try_next() {
            seen.push(payload);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_next_timeout_on_empty_loop() {
        let main_loop = MainLoop::new();
        assert!(main_loop.next_timeout(Duration::from_millis(10)).is_none());
    }
}
