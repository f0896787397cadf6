//! Narrow façade over the two persisted decision-file kinds: one per
//! project, and one global file. Writes are atomic (temp file + rename, the
//! same discipline the teacher's `write_atomic_overwrite` uses for its own
//! identity files) and serialized per file by a mutex held inside this
//! persister. A successful mutating write does not reload anything itself —
//! callers (`DomainApprover::apply_scope`, the SIGHUP handler) are
//! responsible for calling `AllowlistCache::reload` afterward, since that
//! reload is async and this store's write path is not.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::allowlist::Layer;
use crate::error::DecisionError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DecisionDoc {
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

pub struct DecisionStore {
    dir: PathBuf,
    global_lock: Mutex<()>,
    project_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DecisionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            global_lock: Mutex::new(()),
            project_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn load_project(&self, name: &str) -> anyhow::Result<Layer> {
        load_layer(&self.project_path(name))
    }

    pub fn load_global(&self) -> anyhow::Result<Layer> {
        load_layer(&self.global_path())
    }

    pub fn append_project_domain(&self, name: &str, domain: &str) -> Result<bool, DecisionError> {
        validate_domain(domain)?;
        let lock = self.project_lock(name);
        let _guard = lock.lock().unwrap();
        self.append(&self.project_path(name), |doc| insert_unique(&mut doc.domains, domain))
    }

    pub fn append_project_pattern(&self, name: &str, pattern: &str) -> Result<bool, DecisionError> {
        validate_pattern(pattern)?;
        let lock = self.project_lock(name);
        let _guard = lock.lock().unwrap();
        self.append(&self.project_path(name), |doc| insert_unique(&mut doc.patterns, pattern))
    }

    pub fn append_global_domain(&self, domain: &str) -> Result<bool, DecisionError> {
        validate_domain(domain)?;
        let _guard = self.global_lock.lock().unwrap();
        self.append(&self.global_path(), |doc| insert_unique(&mut doc.domains, domain))
    }

    pub fn append_global_pattern(&self, pattern: &str) -> Result<bool, DecisionError> {
        validate_pattern(pattern)?;
        let _guard = self.global_lock.lock().unwrap();
        self.append(&self.global_path(), |doc| insert_unique(&mut doc.patterns, pattern))
    }

    fn project_path(&self, name: &str) -> PathBuf {
        self.dir.join("projects").join(format!("{name}.json"))
    }

    fn global_path(&self) -> PathBuf {
        self.dir.join("global.json")
    }

    fn project_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.project_locks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Loads, mutates, and (if changed) writes `path`. Returns `Ok(false)`
    /// without writing when `mutate` reports no change (a duplicate
    /// decision).
    fn append(&self, path: &Path, mutate: impl FnOnce(&mut DecisionDoc) -> bool) -> Result<bool, DecisionError> {
        let mut doc = read_doc(path)?;
        if !mutate(&mut doc) {
            return Ok(false);
        }
        write_doc(path, &doc)?;
        Ok(true)
    }
}

fn insert_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|existing| existing == value) {
        false
    } else {
        list.push(value.to_string());
        true
    }
}

fn validate_domain(domain: &str) -> Result<(), DecisionError> {
    if domain.is_empty() || domain.chars().any(char::is_whitespace) {
        return Err(DecisionError::InvalidDomain);
    }
    Ok(())
}

fn validate_pattern(pattern: &str) -> Result<(), DecisionError> {
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return Err(DecisionError::InvalidPattern);
    };
    if suffix.split('.').filter(|label| !label.is_empty()).count() < 2 {
        return Err(DecisionError::InvalidPattern);
    }
    Ok(())
}

fn read_doc(path: &Path) -> Result<DecisionDoc, DecisionError> {
    if !path.exists() {
        return Ok(DecisionDoc::default());
    }
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_doc(path: &Path, doc: &DecisionDoc) -> Result<(), DecisionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(doc)?;
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn load_layer(path: &Path) -> anyhow::Result<Layer> {
    let doc = read_doc(path).map_err(anyhow::Error::from)?;
    Ok(Layer {
        domains: doc.domains.into_iter().collect(),
        patterns: doc.patterns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (DecisionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (DecisionStore::new(dir.path().join("decisions")), dir)
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let (store, _dir) = store();
        let layer = store.load_project("p1").unwrap();
        assert!(layer.domains.is_empty());
    }

    #[test]
    fn append_project_domain_round_trips() {
        let (store, _dir) = store();
        assert!(store.append_project_domain("p1", "example.com").unwrap());
        let layer = store.load_project("p1").unwrap();
        assert!(layer.domains.contains("example.com"));

        // A different project's file is untouched.
        assert!(store.load_project("p2").unwrap().domains.is_empty());
    }

    #[test]
    fn duplicate_append_is_skipped() {
        let (store, _dir) = store();

        assert!(store.append_project_domain("p1", "example.com").unwrap());
        assert!(!store.append_project_domain("p1", "example.com").unwrap());

        let layer = store.load_project("p1").unwrap();
        assert_eq!(layer.domains.len(), 1);
    }

    #[test]
    fn invalid_domain_and_pattern_are_rejected() {
        let (store, _dir) = store();
        assert!(matches!(
            store.append_project_domain("p1", "has space.com"),
            Err(DecisionError::InvalidDomain)
        ));
        assert!(matches!(
            store.append_project_domain("p1", ""),
            Err(DecisionError::InvalidDomain)
        ));
        assert!(matches!(
            store.append_global_pattern("example.com"),
            Err(DecisionError::InvalidPattern)
        ));
        assert!(matches!(
            store.append_global_pattern("*.com"),
            Err(DecisionError::InvalidPattern)
        ));
    }

    #[test]
    fn global_and_project_patterns_are_independent() {
        let (store, _dir) = store();
        store.append_global_pattern("*.example.com").unwrap();
        store.append_project_pattern("p1", "*.internal.p1.dev").unwrap();

        assert_eq!(store.load_global().unwrap().patterns, vec!["*.example.com"]);
        assert_eq!(store.load_project("p1").unwrap().patterns, vec!["*.internal.p1.dev"]);
    }
}
