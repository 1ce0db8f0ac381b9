//! Live Update Bus
//!
//! In-process registry mapping a poll id to its current listeners. Publishing
//! calls every listener synchronously; a failing listener is logged and
//! skipped so it cannot starve the others.
//!
//! The bus is scoped to one process. It is created by the engine at start-up
//! and passed explicitly to whoever publishes or subscribes; call sites only
//! see [`PollEventSink`] and [`LiveUpdateBus::subscribe`], so an external
//! broker can replace it later.

pub mod feed;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::types::PollId;
use crate::{Error, Result};

pub use feed::{FeedEvent, LiveFeed};

/// Change notification for a poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PollEvent {
    /// The poll's vote set changed
    #[serde(rename = "votes:updated")]
    VotesUpdated,
}

/// Listener callback; an `Err` is logged by the bus and otherwise ignored
pub type Listener = Arc<dyn Fn(&PollEvent) -> Result<()> + Send + Sync>;

/// Anything that can carry poll events to observers
pub trait PollEventSink: Send + Sync {
    /// Deliver `event` to current observers, returning how many accepted it
    fn publish(&self, poll_id: &PollId, event: PollEvent) -> usize;
}

type Registry = HashMap<PollId, Vec<(u64, Listener)>>;

#[derive(Default)]
struct BusInner {
    listeners: RwLock<Registry>,
    next_id: AtomicU64,
}

/// Process-wide publish/subscribe registry keyed by poll
#[derive(Clone, Default)]
pub struct LiveUpdateBus {
    inner: Arc<BusInner>,
}

impl LiveUpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `poll_id`.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, poll_id: PollId, listener: F) -> Result<Subscription>
    where
        F: Fn(&PollEvent) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self
            .inner
            .listeners
            .write()
            .map_err(|_| Error::internal("Live update registry poisoned"))?;
        listeners
            .entry(poll_id)
            .or_default()
            .push((id, Arc::new(listener)));

        tracing::debug!(%poll_id, subscription = id, "live update subscriber added");

        Ok(Subscription {
            bus: Arc::downgrade(&self.inner),
            poll_id,
            id,
            active: true,
        })
    }

    /// Number of listeners currently registered for `poll_id`
    pub fn subscriber_count(&self, poll_id: &PollId) -> usize {
        self.inner
            .listeners
            .read()
            .map(|listeners| listeners.get(poll_id).map_or(0, Vec::len))
            .unwrap_or_default()
    }

    /// Drop every subscription; used at shutdown
    pub fn clear(&self) {
        match self.inner.listeners.write() {
            Ok(mut listeners) => {
                let dropped: usize = listeners.values().map(Vec::len).sum();
                listeners.clear();
                tracing::info!(dropped, "live update bus cleared");
            }
            Err(_) => tracing::error!("live update registry poisoned during clear"),
        }
    }
}

impl PollEventSink for LiveUpdateBus {
    fn publish(&self, poll_id: &PollId, event: PollEvent) -> usize {
        // Snapshot under the lock, call outside it so listeners may
        // subscribe or unsubscribe re-entrantly.
        let snapshot: Vec<(u64, Listener)> = match self.inner.listeners.read() {
            Ok(listeners) => listeners.get(poll_id).cloned().unwrap_or_default(),
            Err(_) => {
                tracing::error!(%poll_id, "live update registry poisoned, event dropped");
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match listener(&event) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::error!(%poll_id, subscription = id, "live update listener failed: {err}");
                }
            }
        }
        delivered
    }
}

/// Handle returned by [`LiveUpdateBus::subscribe`]; unsubscribes on drop
pub struct Subscription {
    bus: Weak<BusInner>,
    poll_id: PollId,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn poll_id(&self) -> PollId {
        self.poll_id
    }

    /// Remove the listener now
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let Ok(mut listeners) = bus.listeners.write() else {
            tracing::error!(poll_id = %self.poll_id, "live update registry poisoned during unsubscribe");
            return;
        };
        if let Some(entries) = listeners.get_mut(&self.poll_id) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                listeners.remove(&self.poll_id);
            }
        }
        tracing::debug!(poll_id = %self.poll_id, subscription = self.id, "live update subscriber removed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&PollEvent) -> Result<()> + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        (hits, move |_event: &PollEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_publish_reaches_only_that_poll() {
        let bus = LiveUpdateBus::new();
        let poll_a = Uuid::new_v4();
        let poll_b = Uuid::new_v4();

        let (hits_a, listener_a) = counter();
        let (hits_b, listener_b) = counter();
        let _sub_a = bus.subscribe(poll_a, listener_a).unwrap();
        let _sub_b = bus.subscribe(poll_b, listener_b).unwrap();

        assert_eq!(bus.publish(&poll_a, PollEvent::VotesUpdated), 1);
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let bus = LiveUpdateBus::new();
        let poll = Uuid::new_v4();

        let _bad = bus
            .subscribe(poll, |_event: &PollEvent| Err(Error::internal("boom")))
            .unwrap();
        let (hits, listener) = counter();
        let _good = bus.subscribe(poll, listener).unwrap();

        assert_eq!(bus.publish(&poll, PollEvent::VotesUpdated), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_and_unsubscribe_remove_listener() {
        let bus = LiveUpdateBus::new();
        let poll = Uuid::new_v4();

        let (hits, listener) = counter();
        let sub = bus.subscribe(poll, listener).unwrap();
        let (_, other) = counter();
        let other_sub = bus.subscribe(poll, other).unwrap();
        assert_eq!(bus.subscriber_count(&poll), 2);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(&poll), 1);

        drop(other_sub);
        assert_eq!(bus.subscriber_count(&poll), 0);
        assert_eq!(bus.publish(&poll, PollEvent::VotesUpdated), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_drops_everything() {
        let bus = LiveUpdateBus::new();
        let poll = Uuid::new_v4();
        let (_, listener) = counter();
        let sub = bus.subscribe(poll, listener).unwrap();

        bus.clear();
        assert_eq!(bus.subscriber_count(&poll), 0);

        // Dropping a subscription after clear is a no-op
        drop(sub);
    }

    #[test]
    fn test_listener_may_unsubscribe_during_publish() {
        let bus = LiveUpdateBus::new();
        let poll = Uuid::new_v4();
        let slot: Arc<std::sync::Mutex<Option<Subscription>>> = Arc::default();

        let inner_slot = slot.clone();
        let sub = bus
            .subscribe(poll, move |_event: &PollEvent| {
                if let Ok(mut guard) = inner_slot.lock() {
                    guard.take();
                }
                Ok(())
            })
            .unwrap();
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(bus.publish(&poll, PollEvent::VotesUpdated), 1);
        assert_eq!(bus.subscriber_count(&poll), 0);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_string(&PollEvent::VotesUpdated).unwrap();
        assert_eq!(json, r#"{"type":"votes:updated"}"#);
    }
}
