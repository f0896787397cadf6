//! In-memory fan-out of Guardian state changes to approval-UI subscribers.
//!
//! Delivery is deliberately lossy: a slow subscriber's channel fills up and
//! further sends are dropped rather than blocking the broadcaster. The UI is
//! expected to reconcile state via `GET /pending-domains` rather than rely on
//! every event arriving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

const SUBSCRIBER_BUFFER: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    DomainAdded { id: String },
    DomainRemoved { id: String },
    TokenAdded { token_id: String },
    TokenRemoved { token_id: String },
    DecisionsReloaded,
}

/// Handle returned by [`EventHub::subscribe`]. Dropping it does not
/// unsubscribe; call [`EventHub::unsubscribe`] with the id explicitly (the
/// approval API does this when an SSE client disconnects).
pub type SubscriberId = u64;

#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<(SubscriberId, mpsc::Sender<Event>)>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push((id, tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.lock().unwrap().retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn broadcast(&self, event: Event) {
        let subscribers = self.subscribers.lock().unwrap();
        for (id, tx) in subscribers.iter() {
            if let Err(err) = tx.try_send(event.clone()) {
                tracing::debug!(subscriber = id, ?err, "event hub: dropping event for slow subscriber");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
