//! Orchestrates a single CONNECT attempt against the allowlist and, on a
//! miss, the approval queue: consult the cache, enqueue/wait on miss, apply
//! the operator's chosen scope, and return a verdict.

use std::sync::Arc;

use crate::allowlist::AllowlistCache;
use crate::decisions::DecisionStore;
use crate::queue::{ApprovalQueue, NewRequest, Resolution, Scope};

pub struct ConnectRequest {
    pub token: String,
    pub cloister: String,
    pub project: String,
    /// Bare hostname, port already stripped.
    pub host: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub approved: bool,
    pub scope: Option<Scope>,
    pub reason: Option<String>,
}

pub struct DomainApprover {
    allowlist: Arc<AllowlistCache>,
    queue: Arc<ApprovalQueue>,
    decisions: Arc<DecisionStore>,
}

impl DomainApprover {
    pub fn new(allowlist: Arc<AllowlistCache>, queue: Arc<ApprovalQueue>, decisions: Arc<DecisionStore>) -> Self {
        Self { allowlist, queue, decisions }
    }

    pub async fn authorize(&self, req: ConnectRequest) -> anyhow::Result<Verdict> {
        if req.host.is_empty() {
            anyhow::bail!("empty host in CONNECT request");
        }

        if self.allowlist.matches(&req.project, &req.host).await {
            return Ok(Verdict { approved: true, scope: None, reason: None });
        }

        let (id, mut rx, _coalesced) = self.queue.add(NewRequest {
            token: req.token,
            cloister: req.cloister.clone(),
            project: req.project.clone(),
            domain: req.host.clone(),
        });

        let verdict = match rx.recv().await {
            Ok(Resolution::Approved { scope }) => {
                self.apply_scope(scope, &req.project, &req.host).await;
                Verdict { approved: true, scope: Some(scope), reason: None }
            }
            Ok(Resolution::Denied { reason }) => Verdict { approved: false, scope: None, reason: Some(reason) },
            Ok(Resolution::Timeout { reason }) => Verdict { approved: false, scope: None, reason: Some(reason) },
            Err(_closed) => {
                // The queue dropped the sender without resolving (e.g. the
                // request was cancelled out from under a coalesced waiter).
                // Safe default: treat it as a synthetic timeout.
                Verdict {
                    approved: false,
                    scope: None,
                    reason: Some("pending request was cancelled".to_string()),
                }
            }
        };

        // Idempotent: the winning path (decision or timer) has usually
        // already removed the entry, this is just a safety net.
        self.queue.remove(&id);

        Ok(verdict)
    }

    /// Session approvals go straight into the in-memory layer. Project and
    /// global approvals persist a decision file and then explicitly reload
    /// the allowlist — this is one of the two independent reload triggers
    /// named in the allowlist's own module doc, the other being a SIGHUP.
    async fn apply_scope(&self, scope: Scope, project: &str, host: &str) {
        match scope {
            Scope::Session => self.allowlist.add_session_domain(project, host).await,
            Scope::Project => match self.decisions.append_project_domain(project, host) {
                Ok(_) => {
                    if let Err(err) = self.allowlist.reload().await {
                        tracing::warn!(project, host, ?err, "allowlist reload after a project decision write failed");
                    }
                }
                Err(err) => tracing::warn!(project, host, ?err, "failed to persist project decision"),
            },
            Scope::Global => match self.decisions.append_global_domain(host) {
                Ok(_) => {
                    if let Err(err) = self.allowlist.reload().await {
                        tracing::warn!(host, ?err, "allowlist reload after a global decision write failed");
                    }
                }
                Err(err) => tracing::warn!(host, ?err, "failed to persist global decision"),
            },
        }
    }
}
