//! Authoritative mapping from bearer token to sandbox identity.
//!
//! Never persisted: a Guardian restart drops every registration and sandboxes
//! are expected to re-register (see `spec.md` §1 Non-goals).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::events::{Event, EventHub};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxIdentity {
    pub cloister: String,
    pub project: String,
    pub worktree: String,
}

#[derive(Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<String, SandboxIdentity>>,
    events: Option<Arc<EventHub>>,
    /// `GUARDIAN_INSTANCE_ID`, if any — tagged onto register/revoke logs so
    /// multiple coexisting instances can be told apart in a shared log sink.
    instance_id: Option<String>,
}

impl TokenRegistry {
    pub fn new(events: Option<Arc<EventHub>>) -> Self {
        Self { tokens: RwLock::new(HashMap::new()), events, instance_id: None }
    }

    pub fn with_instance_id(mut self, instance_id: Option<String>) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Binds `token` to `identity`, overwriting any existing binding.
    pub async fn register(&self, token: String, identity: SandboxIdentity) {
        tracing::info!(
            instance_id = self.instance_id.as_deref().unwrap_or("-"),
            cloister = %identity.cloister,
            project = %identity.project,
            "token registered",
        );
        self.tokens.write().await.insert(token.clone(), identity);
        if let Some(hub) = &self.events {
            hub.broadcast(Event::TokenAdded { token_id: token });
        }
    }

    /// Returns `false` if `token` was not present.
    pub async fn revoke(&self, token: &str) -> bool {
        let removed = self.tokens.write().await.remove(token).is_some();
        if removed {
            tracing::info!(instance_id = self.instance_id.as_deref().unwrap_or("-"), "token revoked");
            if let Some(hub) = &self.events {
                hub.broadcast(Event::TokenRemoved { token_id: token.to_string() });
            }
        }
        removed
    }

    pub async fn validate(&self, token: &str) -> Option<SandboxIdentity> {
        self.tokens.read().await.get(token).cloned()
    }

    pub async fn list(&self) -> HashMap<String, SandboxIdentity> {
        self.tokens.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(project: &str) -> SandboxIdentity {
        SandboxIdentity {
            cloister: "c1".into(),
            project: project.into(),
            worktree: "/work/c1".into(),
        }
    }

    #[tokio::test]
    async fn register_overwrites_existing_binding() {
        let registry = TokenRegistry::new(None);
        registry.register("tok".into(), identity("p1")).await;
        registry.register("tok".into(), identity("p2")).await;

        assert_eq!(registry.validate("tok").await.unwrap().project, "p2");
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_reports_absence() {
        let registry = TokenRegistry::new(None);
        registry.register("tok".into(), identity("p1")).await;

        assert!(registry.revoke("tok").await);
        assert!(!registry.revoke("tok").await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn validate_unknown_token_returns_none() {
        let registry = TokenRegistry::new(None);
        assert!(registry.validate("nope").await.is_none());
    }

    #[tokio::test]
    async fn register_and_revoke_broadcast_events() {
        let hub = Arc::new(EventHub::new());
        let (_id, mut rx) = hub.subscribe();
        let registry = TokenRegistry::new(Some(hub));

        registry.register("tok".into(), identity("p1")).await;
        assert_eq!(rx.recv().await, Some(Event::TokenAdded { token_id: "tok".into() }));

        registry.revoke("tok").await;
        assert_eq!(rx.recv().await, Some(Event::TokenRemoved { token_id: "tok".into() }));
    }
}
