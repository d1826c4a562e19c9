//! # Subscription Registry
//!
//! Every signal subscription and store watch a session creates is handed to
//! one [`SubscriptionRegistry`], which from then on is the only thing allowed
//! to release it. A handle is removed from the registry *before* its release
//! callback runs, so releasing twice (an explicit unbind followed by the
//! session-wide sweep, say) finds nothing the second time.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique handle for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    BusSignal,
    StoreWatch,
}

/// A live registration of interest in a signal or a store key.
pub struct Subscription {
    id: SubscriptionId,
    kind: SubscriptionKind,
    target: String,
    release: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        kind: SubscriptionKind,
        target: impl Into<String>,
        release: impl FnOnce() + 'static,
    ) -> Self {
        Self {
            id,
            kind,
            target: target.into(),
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release, handed out when nothing could
    /// be attached (a closed client, a signal the bus refused).
    pub fn inert(kind: SubscriptionKind, target: impl Into<String>) -> Self {
        Self {
            id: SubscriptionId::next(),
            kind,
            target: target.into(),
            release: None,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Signal name or key pattern.
    pub fn target(&self) -> &str {
        &self.target
    }

    fn release(mut self) {
        debug!("Releasing {:?} {} ({})", self.kind, self.id, self.target);
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("released", &self.release.is_none())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.release.is_some() {
            warn!(
                "{:?} {} ({}) dropped without being released",
                self.kind, self.id, self.target
            );
        }
    }
}

/// Session-scoped owner of every live [`Subscription`].
#[derive(Default)]
pub struct SubscriptionRegistry {
    /// Registration order; released from the back.
    live: RefCell<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `subscription` and returns its handle.
    pub fn register(&self, subscription: Subscription) -> SubscriptionId {
        let id = subscription.id();
        debug!(
            "Registered {:?} {id} ({})",
            subscription.kind(),
            subscription.target()
        );
        self.live.borrow_mut().push(subscription);
        id
    }

    /// Releases one subscription. Returns false if it was not live
    /// (never registered, or already released).
    pub fn release(&self, id: SubscriptionId) -> bool {
        let taken = {
            let mut live = self.live.borrow_mut();
            live.iter()
                .position(|s| s.id() == id)
                .map(|index| live.remove(index))
        };

        match taken {
            Some(subscription) => {
                subscription.release();
                true
            }
            None => false,
        }
    }

    /// Releases everything, newest first. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        loop {
            // The borrow must end before the callback runs; a release callback
            // is allowed to call back into the registry.
            let next = self.live.borrow_mut().pop();
            match next {
                Some(subscription) => {
                    subscription.release();
                    released += 1;
                }
                None => break,
            }
        }
        released
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.live.borrow().iter().any(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.live.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.borrow().is_empty()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("live", &self.len())
            .finish()
    }
}
