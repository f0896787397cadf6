//! Pending-approval queue: deduplicates concurrent requests for the same
//! `(token, domain)`, applies a per-request timeout, and broadcasts
//! `domain-added`/`domain-removed` events.
//!
//! The response channel is the cross-task hand-off point. Resolution
//! (operator decision or timer expiry) and removal are always performed
//! together by `finish()`, so `remove(id)` happens-before the timer being
//! observably inert and before any later `get(id)` returns the request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::events::{Event, EventHub};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Session,
    Project,
    Global,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Resolution {
    Approved { scope: Scope },
    Denied { reason: String },
    Timeout { reason: String },
}

pub struct NewRequest {
    pub token: String,
    pub cloister: String,
    pub project: String,
    pub domain: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PendingRequestView {
    pub id: String,
    pub cloister: String,
    pub project: String,
    pub domain: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

struct Entry {
    token: String,
    cloister: String,
    project: String,
    domain: String,
    enqueued_at: OffsetDateTime,
    tx: broadcast::Sender<Resolution>,
    timer: tokio::task::JoinHandle<()>,
}

impl Entry {
    fn view(&self, id: &str) -> PendingRequestView {
        PendingRequestView {
            id: id.to_string(),
            cloister: self.cloister.clone(),
            project: self.project.clone(),
            domain: self.domain.clone(),
            timestamp: self.enqueued_at,
        }
    }
}

pub struct ApprovalQueue {
    by_key: Mutex<HashMap<(String, String), String>>,
    by_id: Mutex<HashMap<String, Arc<Entry>>>,
    timeout: Duration,
    events: Option<Arc<EventHub>>,
}

impl ApprovalQueue {
    pub fn new(timeout: Duration, events: Option<Arc<EventHub>>) -> Arc<Self> {
        Arc::new(Self {
            by_key: Mutex::new(HashMap::new()),
            by_id: Mutex::new(HashMap::new()),
            timeout,
            events,
        })
    }

    /// Adds a pending request, or coalesces onto an existing one with the
    /// same `(token, domain)` key. Returns the request id, a receiver for
    /// its eventual resolution, and whether it was coalesced onto an
    /// existing request.
    pub fn add(self: &Arc<Self>, req: NewRequest) -> (String, broadcast::Receiver<Resolution>, bool) {
        let key = (req.token.clone(), req.domain.clone());

        {
            let by_key = self.by_key.lock().unwrap();
            if let Some(existing_id) = by_key.get(&key).cloned() {
                drop(by_key);
                let by_id = self.by_id.lock().unwrap();
                if let Some(entry) = by_id.get(&existing_id) {
                    return (existing_id, entry.tx.subscribe(), true);
                }
                // Entry vanished between the two maps (concurrent removal); fall
                // through and create a fresh request below.
            }
        }

        let id = generate_id();
        let enqueued_at = OffsetDateTime::now_utc();
        let (tx, rx) = broadcast::channel(1);

        let queue = self.clone();
        let timeout = self.timeout;
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            queue.finish(
                &timer_id,
                Some(Resolution::Timeout { reason: "no operator response within timeout".into() }),
            );
        });

        let entry = Arc::new(Entry {
            token: req.token.clone(),
            cloister: req.cloister,
            project: req.project,
            domain: req.domain.clone(),
            enqueued_at,
            tx,
            timer,
        });

        self.by_key.lock().unwrap().insert(key, id.clone());
        self.by_id.lock().unwrap().insert(id.clone(), entry);

        if let Some(hub) = &self.events {
            hub.broadcast(Event::DomainAdded { id: id.clone() });
        }

        (id, rx, false)
    }

    pub fn get(&self, id: &str) -> Option<PendingRequestView> {
        self.by_id.lock().unwrap().get(id).map(|entry| entry.view(id))
    }

    pub fn list(&self) -> Vec<PendingRequestView> {
        self.by_id
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| entry.view(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `resolution` to every waiter on `id` and removes the
    /// request. Used for operator decisions (approve/deny).
    pub fn resolve(&self, id: &str, resolution: Resolution) -> bool {
        self.finish(id, Some(resolution))
    }

    /// Removes `id` without delivering anything on its response channel.
    /// Safe to call after the request has already been resolved elsewhere
    /// (idempotent) — the domain approver calls this as a final cleanup
    /// step regardless of how the wait concluded.
    pub fn remove(&self, id: &str) -> bool {
        self.finish(id, None)
    }

    fn finish(&self, id: &str, resolution: Option<Resolution>) -> bool {
        let entry = self.by_id.lock().unwrap().remove(id);
        let Some(entry) = entry else {
            return false;
        };
        self.by_key.lock().unwrap().remove(&(entry.token.clone(), entry.domain.clone()));
        entry.timer.abort();

        if let Some(resolution) = resolution {
            let _ = entry.tx.send(resolution);
        }
        if let Some(hub) = &self.events {
            hub.broadcast(Event::DomainRemoved { id: id.to_string() });
        }
        true
    }
}

fn generate_id() -> String {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom: failed to source entropy");
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
