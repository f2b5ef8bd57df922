//! Detection engine: threshold, baseline and outlier detectors, the
//! persister, and the run orchestrator.

pub mod baseline;
pub mod engine;
pub mod forest;
pub mod outlier;
pub mod persist;
pub mod threshold;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine failure taxonomy. The orchestrator turns any of these into a
/// `-1` report entry; [`DetectError::Load`] keeps the artifact out of the
/// run entirely.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid rule: {0}")]
    Validation(String),

    #[error("failed to load {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("failed to persist detection for rule '{rule_id}'")]
    Persistence {
        rule_id: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Severity levels for detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(DetectError::Validation(format!("unknown severity '{other}'"))),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    Rule,
    Anomaly,
}

impl DetectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionKind::Rule => "rule",
            DetectionKind::Anomaly => "anomaly",
        }
    }
}

impl FromStr for DetectionKind {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rule" => Ok(DetectionKind::Rule),
            "anomaly" => Ok(DetectionKind::Anomaly),
            other => Err(DetectError::Validation(format!("unknown detection kind '{other}'"))),
        }
    }
}

/// Lifecycle state. The engine only ever writes `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Open,
    Closed,
}

impl DetectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionStatus::Open => "open",
            DetectionStatus::Closed => "closed",
        }
    }
}

impl FromStr for DetectionStatus {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(DetectionStatus::Open),
            "closed" => Ok(DetectionStatus::Closed),
            other => Err(DetectError::Validation(format!("unknown detection status '{other}'"))),
        }
    }
}

/// What a detector hands the persister. One finding becomes one detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub title: String,
    pub severity: Severity,
    pub summary: String,
    /// Newest first, already capped.
    pub evidence_event_ids: Vec<i64>,
    pub features: Option<serde_json::Value>,
}

/// A persisted detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub rule_id: Option<String>,
    pub kind: DetectionKind,
    pub severity: Severity,
    pub title: String,
    pub summary: Option<String>,
    pub event_ids: Vec<i64>,
    pub features: Option<serde_json::Value>,
    pub status: DetectionStatus,
    pub assignee: Option<String>,
    pub tags: Vec<String>,
}

/// Clamp evidence to the newest `cap` ids. Callers pass ids newest first.
pub(crate) fn cap_evidence(mut ids: Vec<i64>, cap: usize) -> Vec<i64> {
    ids.truncate(cap);
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_parse() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!(" low ".parse::<Severity>().unwrap(), Severity::Low);
        assert!(matches!("severe".parse::<Severity>(), Err(DetectError::Validation(_))));
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
    }

    #[test]
    fn test_cap_evidence() {
        let ids: Vec<i64> = (1..=80).rev().collect();
        let capped = cap_evidence(ids, 50);
        assert_eq!(capped.len(), 50);
        assert_eq!(capped[0], 80);
        assert_eq!(capped[49], 31);
    }
}
