//! Bounded multi-consumer delivery of capture events.
//!
//! Producers (the capture thread, the interception proxy) publish without
//! blocking; each subscriber owns a bounded queue drained by its own task.
//! When a queue is full the newest event is dropped and counted against that
//! subscriber, preserving in-flight ordering without head-of-line blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config;
use crate::mitm::HttpsTransaction;
use crate::record::PacketRecord;

/// One event on the feed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Packet(PacketRecord),
    Transaction(HttpsTransaction),
    /// Session-level failure frame, delivered before teardown.
    SessionError { message: String },
}

struct Subscriber {
    tx: mpsc::Sender<Arc<FeedEvent>>,
    dropped: AtomicU64,
    last_delivery: Mutex<Instant>,
}

/// A registered consumer's end of the feed.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<FeedEvent>>,
}

/// The fan-out hub. Cheap to share; producers and subscribers touch disjoint
/// entries of the registry.
pub struct PacketFeed {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

impl PacketFeed {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a subscriber with the default queue depth.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_depth(config::SUBSCRIBER_QUEUE_DEPTH)
    }

    pub fn subscribe_with_depth(&self, depth: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                dropped: AtomicU64::new(0),
                last_delivery: Mutex::new(Instant::now()),
            },
        );
        tracing::debug!("Subscriber {id} registered (depth {depth})");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            tracing::debug!("Subscriber {id} unregistered");
        }
    }

    /// Replicate an event to every live subscriber without blocking.
    ///
    /// A full queue drops this (newest) event for that subscriber and bumps
    /// its drop counter; a closed queue removes the subscriber. One failing
    /// subscriber never affects the others.
    pub fn publish(&self, event: FeedEvent) {
        let event = Arc::new(event);
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().tx.try_send(Arc::clone(&event)) {
                Ok(()) => {
                    *entry.value().last_delivery.lock().unwrap() = Instant::now();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.value().dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*entry.key());
                }
            }
        }
        for id in closed {
            tracing::debug!("Subscriber {id} gone, removing");
            self.subscribers.remove(&id);
        }
    }

    /// Events dropped so far for a subscriber.
    pub fn dropped_count(&self, id: u64) -> Option<u64> {
        self.subscribers
            .get(&id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Remove subscribers with no successful delivery within `max_idle`.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let before = self.subscribers.len();
        self.subscribers
            .retain(|_, s| s.last_delivery.lock().unwrap().elapsed() <= max_idle);
        let pruned = before - self.subscribers.len();
        if pruned > 0 {
            tracing::info!("Pruned {pruned} idle subscribers");
        }
        pruned
    }
}

impl Default for PacketFeed {
    fn default() -> Self {
        Self::new()
    }
}
