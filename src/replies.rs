//! # Reply Registry
//!
//! Matches inbound messages to the searches and stores waiting for them.
//!
//! A waiter registers a selector predicate and a deadline and gets back a
//! [`ReplyHandle`]. Every inbound reply is offered to all live selectors;
//! each match is cloned into the waiter's channel. Nothing blocks: the
//! waiter races its channel against its own timers.
//!
//! Dropping the handle unregisters the waiter, so a search that finishes
//! early (or is cancelled) never leaves a stale selector behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::identity::Identity;
use crate::messages::NetDbMessage;

pub type Reply = (Identity, NetDbMessage);

/// Predicate deciding whether a message from a peer answers a waiter.
pub type Selector = Box<dyn Fn(&Identity, &NetDbMessage) -> bool + Send + Sync>;

struct Waiter {
    selector: Selector,
    deadline: Instant,
    tx: mpsc::UnboundedSender<Reply>,
}

#[derive(Default)]
pub struct ReplyRegistry {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self: &Arc<Self>, selector: Selector, deadline: Instant) -> ReplyHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Waiter { selector, deadline, tx });
        ReplyHandle {
            id,
            deadline,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    pub fn unregister(&self, id: u64) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Offer a message to every live waiter. Returns true if any matched.
    pub fn dispatch(&self, from: &Identity, message: &NetDbMessage) -> bool {
        let now = Instant::now();
        let mut matched = false;
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        waiters.retain(|id, waiter| {
            if waiter.deadline <= now || waiter.tx.is_closed() {
                trace!(waiter = id, "dropping expired reply waiter");
                return false;
            }
            if (waiter.selector)(from, message) {
                matched = true;
                return waiter.tx.send((*from, message.clone())).is_ok();
            }
            true
        });
        matched
    }

    /// Drop waiters whose deadline has passed. Returns how many were removed.
    pub fn expire(&self, now: Instant) -> usize {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        let before = waiters.len();
        waiters.retain(|_, w| w.deadline > now && !w.tx.is_closed());
        before - waiters.len()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of a registered waiter.
pub struct ReplyHandle {
    id: u64,
    deadline: Instant,
    rx: mpsc::UnboundedReceiver<Reply>,
    registry: Weak<ReplyRegistry>,
}

impl ReplyHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Next matching reply, or `None` once the registration deadline passes.
    pub async fn recv(&mut self) -> Option<Reply> {
        let deadline = self.deadline;
        self.recv_until(deadline).await
    }

    /// Next matching reply arriving before `until` (capped at the
    /// registration deadline).
    pub async fn recv_until(&mut self, until: Instant) -> Option<Reply> {
        let until = until.min(self.deadline);
        tokio::time::timeout_at(until, self.rx.recv()).await.ok().flatten()
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DeliveryAck;
    use std::time::Duration;

    fn ack(token: u64) -> NetDbMessage {
        NetDbMessage::DeliveryAck(DeliveryAck { token })
    }

    fn token_selector(token: u64) -> Selector {
        Box::new(move |_, m| matches!(m, NetDbMessage::DeliveryAck(a) if a.token == token))
    }

    #[tokio::test(start_paused = true)]
    async fn matching_reply_is_delivered() {
        let registry = Arc::new(ReplyRegistry::new());
        let mut handle = registry.register(token_selector(7), Instant::now() + Duration::from_secs(5));
        let peer = Identity::random();

        assert!(!registry.dispatch(&peer, &ack(8)));
        assert!(registry.dispatch(&peer, &ack(7)));

        let (from, message) = handle.recv().await.unwrap();
        assert_eq!(from, peer);
        assert_eq!(message, ack(7));
    }

    #[tokio::test(start_paused = true)]
    async fn recv_returns_none_at_deadline() {
        let registry = Arc::new(ReplyRegistry::new());
        let mut handle = registry.register(token_selector(1), Instant::now() + Duration::from_secs(2));
        let started = Instant::now();
        assert!(handle.recv().await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_unregisters() {
        let registry = Arc::new(ReplyRegistry::new());
        let handle = registry.register(token_selector(3), Instant::now() + Duration::from_secs(60));
        assert_eq!(registry.len(), 1);
        drop(handle);
        assert!(registry.is_empty());
        assert!(!registry.dispatch(&Identity::random(), &ack(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_waiters_are_swept() {
        let registry = Arc::new(ReplyRegistry::new());
        let _short = registry.register(token_selector(1), Instant::now() + Duration::from_secs(1));
        let _long = registry.register(token_selector(2), Instant::now() + Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.expire(Instant::now()), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_reply_reaches_every_matching_waiter() {
        let registry = Arc::new(ReplyRegistry::new());
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut a = registry.register(token_selector(9), deadline);
        let mut b = registry.register(token_selector(9), deadline);
        assert!(registry.dispatch(&Identity::random(), &ack(9)));
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }
}
