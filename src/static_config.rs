//! Narrow read-only access to the static allowlist configuration files.
//!
//! These are the "older project-config-embedded allowlist" files the source
//! system still ships alongside the newer decision-file layout (see
//! `spec.md` §9's Open Question). The Guardian only ever reads them; nothing
//! in this crate writes back into static config.

use std::path::Path;

use anyhow::{Context, Result};

use crate::allowlist::Layer;

pub fn load_default(path: Option<&Path>) -> Result<Layer> {
    match path {
        Some(path) => load_layer_file(path),
        None => Ok(Layer::default()),
    }
}

pub fn load_project_static(dir: Option<&Path>, project: &str) -> Result<Layer> {
    match dir {
        Some(dir) => load_layer_file(&dir.join(format!("{project}.allowlist"))),
        None => Ok(Layer::default()),
    }
}

/// One domain or `*.`-pattern per line. Blank lines and `#` comments ignored.
fn load_layer_file(path: &Path) -> Result<Layer> {
    if !path.exists() {
        return Ok(Layer::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    let mut layer = Layer::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("*.") {
            layer.patterns.push(line.to_string());
        } else {
            layer.domains.insert(line.to_string());
        }
    }
    Ok(layer)
}
