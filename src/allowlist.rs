//! Layered, hot-reloadable domain match engine.
//!
//! The effective allowlist for a project is the union of four layers:
//! `default` (static, ships with the Guardian), `global` (persisted global
//! decisions), `project` (the project's static config merged with its
//! persisted decisions), and `session` (in-memory, per-project, additive
//! across reloads). `reload()` rebuilds a whole new snapshot and swaps it in
//! under a single write lock so readers never observe a half-updated layer.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, RwLock};

use crate::decisions::DecisionStore;
use crate::static_config;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Layer {
    pub domains: HashSet<String>,
    /// Each entry is a literal `"*.suffix"` pattern.
    pub patterns: Vec<String>,
}

impl Layer {
    pub fn matches(&self, host: &str) -> bool {
        self.domains.contains(host) || self.patterns.iter().any(|p| pattern_matches(p, host))
    }

    fn merge(&mut self, other: Layer) {
        self.domains.extend(other.domains);
        for pattern in other.patterns {
            if !self.patterns.contains(&pattern) {
                self.patterns.push(pattern);
            }
        }
    }
}

/// `*.X` matches `Y` iff `Y` ends with `.X` and `Y` has at least one label
/// beyond `X`; `X` itself does not match.
pub fn pattern_matches(pattern: &str, host: &str) -> bool {
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    match host.strip_suffix(suffix) {
        Some(rest) if !rest.is_empty() => rest.ends_with('.'),
        _ => false,
    }
}

#[derive(Clone, Default)]
struct Snapshot {
    default: Layer,
    global: Layer,
    project: HashMap<String, Layer>,
}

pub struct AllowlistCache {
    default_path: Option<PathBuf>,
    project_static_dir: Option<PathBuf>,
    decisions: Arc<DecisionStore>,
    known_projects: Mutex<HashSet<String>>,
    snapshot: RwLock<Arc<Snapshot>>,
    session: RwLock<HashMap<String, Layer>>,
}

impl AllowlistCache {
    pub async fn new(
        default_path: Option<PathBuf>,
        project_static_dir: Option<PathBuf>,
        decisions: Arc<DecisionStore>,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(Self {
            default_path,
            project_static_dir,
            decisions,
            known_projects: Mutex::new(HashSet::new()),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            session: RwLock::new(HashMap::new()),
        });
        cache.reload().await?;
        Ok(cache)
    }

    /// Re-reads the default, global, and per-project configuration and
    /// decision files, then atomically swaps the new snapshot into place.
    /// Session layers are additive and are never touched here.
    ///
    /// Invoked from two independent triggers: the decision-store persister
    /// callback after a successful write (via `DomainApprover::apply_scope`)
    /// and the process's SIGHUP handler, for an operator editing decision
    /// files by hand.
    pub async fn reload(&self) -> Result<()> {
        let default = static_config::load_default(self.default_path.as_deref())?;
        let global = self.decisions.load_global()?;

        let projects: Vec<String> = self.known_projects.lock().await.iter().cloned().collect();
        let mut project = HashMap::with_capacity(projects.len());
        for name in projects {
            let mut layer = static_config::load_project_static(self.project_static_dir.as_deref(), &name)?;
            layer.merge(self.decisions.load_project(&name)?);
            project.insert(name, layer);
        }

        let snapshot = Arc::new(Snapshot { default, global, project });
        *self.snapshot.write().await = snapshot;
        Ok(())
    }

    /// Registers `project` with the cache so subsequent `reload()` calls
    /// pick up its static config and decision file. A no-op if already known.
    pub async fn register_project(&self, project: &str) {
        let is_new = self.known_projects.lock().await.insert(project.to_string());
        if is_new {
            if let Err(err) = self.reload().await {
                tracing::warn!(project, ?err, "allowlist cache: reload after registering project failed");
            }
        }
    }

    pub async fn matches(&self, project: &str, host: &str) -> bool {
        self.register_project(project).await;

        let snapshot = self.snapshot.read().await.clone();
        if snapshot.default.matches(host) || snapshot.global.matches(host) {
            return true;
        }
        if let Some(layer) = snapshot.project.get(project) {
            if layer.matches(host) {
                return true;
            }
        }
        self.session
            .read()
            .await
            .get(project)
            .is_some_and(|layer| layer.matches(host))
    }

    /// Inserts `host` into `project`'s session layer directly, bypassing the
    /// decision store. Session approvals are never persisted.
    pub async fn add_session_domain(&self, project: &str, host: &str) {
        self.session
            .write()
            .await
            .entry(project.to_string())
            .or_default()
            .domains
            .insert(host.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decisions::DecisionStore;

    async fn cache() -> (Arc<AllowlistCache>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let decisions = Arc::new(DecisionStore::new(dir.path().join("decisions")));
        let cache = AllowlistCache::new(None, None, decisions).await.unwrap();
        (cache, dir)
    }

    #[test]
    fn pattern_matching_follows_label_boundary_rule() {
        assert!(pattern_matches("*.example.com", "a.example.com"));
        assert!(pattern_matches("*.example.com", "a.b.example.com"));
        assert!(!pattern_matches("*.example.com", "example.com"));
        assert!(!pattern_matches("*.example.com", "notexample.com"));
    }

    #[tokio::test]
    async fn unknown_project_and_host_is_blocked() {
        let (cache, _dir) = cache().await;
        assert!(!cache.matches("p1", "example.com").await);
    }

    #[tokio::test]
    async fn session_layer_is_project_scoped_and_survives_reload() {
        let (cache, _dir) = cache().await;
        cache.add_session_domain("p1", "example.com").await;
        assert!(cache.matches("p1", "example.com").await);
        assert!(!cache.matches("p2", "example.com").await);

        cache.reload().await.unwrap();
        assert!(cache.matches("p1", "example.com").await, "session layer must not be cleared on reload");
    }

    #[tokio::test]
    async fn project_decision_is_visible_only_to_its_own_project() {
        let (cache, _dir) = cache().await;
        cache.register_project("p1").await;
        cache.decisions.append_project_domain("p1", "example.com").unwrap();
        cache.reload().await.unwrap();

        assert!(cache.matches("p1", "example.com").await);
        assert!(!cache.matches("p2", "example.com").await);
    }

    #[tokio::test]
    async fn global_decision_is_visible_to_every_project() {
        let (cache, _dir) = cache().await;
        cache.decisions.append_global_domain("example.com").unwrap();
        cache.reload().await.unwrap();

        assert!(cache.matches("p1", "example.com").await);
        assert!(cache.matches("p2", "example.com").await);
    }
}
