use chrono::{DateTime, Utc};
use rusqlite::Connection;

use super::{DetectError, DetectionKind, DetectionStatus, Finding};
use crate::storage::detections::{self, NewDetection};

/// Write one open detection per finding and commit. Returns the count
/// written. Nothing is written if any insert fails.
pub fn persist_findings(
    conn: &Connection,
    rule_id: &str,
    findings: Vec<Finding>,
    created_at: DateTime<Utc>,
) -> Result<usize, DetectError> {
    if findings.is_empty() {
        return Ok(0);
    }

    let persistence = |source| DetectError::Persistence {
        rule_id: rule_id.to_string(),
        source,
    };

    let tx = conn.unchecked_transaction().map_err(persistence)?;
    let mut created = 0;
    for f in findings {
        let det = NewDetection {
            created_at,
            rule_id: Some(rule_id.to_string()),
            kind: DetectionKind::Rule,
            severity: f.severity,
            title: f.title,
            summary: Some(f.summary),
            event_ids: f.evidence_event_ids,
            features: f.features,
            status: DetectionStatus::Open,
            assignee: None,
            tags: vec![rule_id.to_string(), "rule".to_string()],
        };
        detections::insert(&tx, &det).map_err(persistence)?;
        created += 1;
    }
    tx.commit().map_err(persistence)?;
    Ok(created)
}
