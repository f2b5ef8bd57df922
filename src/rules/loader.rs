//! Filesystem discovery of threshold rule documents.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{compiler, ThresholdRuleDoc};
use crate::detect::DetectError;

/// Outcome of one file in a rule directory scan.
#[derive(Debug)]
pub struct LoadResult {
    pub path: PathBuf,
    pub status: LoadStatus,
}

#[derive(Debug)]
pub enum LoadStatus {
    Loaded(ThresholdRuleDoc),
    /// Not a candidate: internal marker, dotfile, or other extension.
    Skipped { reason: String },
    Failed(DetectError),
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e == "yml" || e == "yaml")
        .unwrap_or(false)
}

/// Scan `dir` (not recursive) in sorted filename order.
pub fn scan(dir: &Path) -> Vec<LoadResult> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to read rules directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut results = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.starts_with('_') || name.starts_with('.') {
            results.push(LoadResult {
                path,
                status: LoadStatus::Skipped { reason: "internal file".to_string() },
            });
            continue;
        }
        if !is_yaml(&path) {
            results.push(LoadResult {
                path,
                status: LoadStatus::Skipped { reason: "not a YAML file".to_string() },
            });
            continue;
        }

        let status = match load_file(&path) {
            Ok(doc) => LoadStatus::Loaded(doc),
            Err(e) => LoadStatus::Failed(e),
        };
        results.push(LoadResult { path, status });
    }
    results
}

/// Read and shape-check one document. It must parse as YAML and be a
/// mapping; field contents are left to the compiler.
pub fn load_file(path: &Path) -> Result<ThresholdRuleDoc, DetectError> {
    let load_err = |reason: String| DetectError::Load {
        path: path.display().to_string(),
        reason,
    };

    let contents = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&contents).map_err(|e| load_err(e.to_string()))?;
    let serde_yaml::Value::Mapping(body) = value else {
        return Err(load_err("document is not a mapping".to_string()));
    };

    let id = match body.get("id") {
        Some(serde_yaml::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(serde_yaml::Value::Number(n)) => n.to_string(),
        _ => "unnamed".to_string(),
    };

    Ok(ThresholdRuleDoc {
        id,
        path: path.to_path_buf(),
        body,
    })
}

/// Load every usable document in `dir`. Broken files are logged and dropped.
pub fn load_threshold_rules(dir: &Path) -> Vec<ThresholdRuleDoc> {
    let mut docs = Vec::new();
    for result in scan(dir) {
        match result.status {
            LoadStatus::Loaded(doc) => {
                info!(rule_id = %doc.id, path = %result.path.display(), "loaded threshold rule");
                docs.push(doc);
            }
            LoadStatus::Failed(e) => {
                warn!(path = %result.path.display(), error = %e, "skipping rule document");
            }
            LoadStatus::Skipped { .. } => {}
        }
    }
    docs
}

/// Per-file verdict from [`check`].
#[derive(Debug)]
pub enum CheckStatus {
    /// Loads and compiles.
    Valid { id: String },
    Skipped { reason: String },
    /// Would be dropped at load time.
    LoadFailed(DetectError),
    /// Loads, but every run would report it as failed.
    Invalid { id: String, error: DetectError },
}

/// Load and compile every document in `dir` without touching the store.
pub fn check(dir: &Path) -> Vec<(PathBuf, CheckStatus)> {
    scan(dir)
        .into_iter()
        .map(|result| {
            let status = match result.status {
                LoadStatus::Loaded(doc) => match compiler::compile(&doc) {
                    Ok(rule) => CheckStatus::Valid { id: rule.id },
                    Err(error) => CheckStatus::Invalid { id: doc.id, error },
                },
                LoadStatus::Skipped { reason } => CheckStatus::Skipped { reason },
                LoadStatus::Failed(e) => CheckStatus::LoadFailed(e),
            };
            (result.path, status)
        })
        .collect()
}
