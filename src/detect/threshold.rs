//! Executes a compiled threshold rule against the event store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use tracing::debug;

use super::{cap_evidence, DetectError, Finding};
use crate::rules::compiler::CompiledRule;
use crate::storage::events::{self, AggregateQuery, TimeRange};

/// Render a group tuple in the order the aggregate returned it, or `all`
/// for an ungrouped rule.
pub fn group_repr(group: &[Option<String>]) -> String {
    if group.is_empty() {
        return "all".to_string();
    }
    let parts: Vec<&str> = group.iter().map(|v| v.as_deref().unwrap_or("null")).collect();
    format!("({})", parts.join(", "))
}

/// Evaluate `rule` over `[now - window, now)`. One finding per group whose
/// aggregate is at least the threshold.
pub fn evaluate(
    conn: &Connection,
    rule: &CompiledRule,
    now: DateTime<Utc>,
    evidence_cap: usize,
) -> Result<Vec<Finding>> {
    let start = now
        .checked_sub_signed(rule.window)
        .ok_or_else(|| {
            let expr = &rule.window_expr;
            DetectError::Validation(format!("window '{expr}' reaches before the earliest instant"))
        })?;
    let range = TimeRange::half_open(start, now);
    let query = AggregateQuery {
        range,
        filters: &rule.filters,
        group_by: &rule.group_by,
        aggregate: rule.threshold.aggregate(),
    };

    let rows = events::aggregate(conn, &query)?;
    debug!(rule_id = %rule.id, groups = rows.len(), "aggregate complete");

    let distinct_tag = rule
        .threshold
        .distinct_field
        .map(|f| format!(" (distinct={f})"))
        .unwrap_or_default();

    let mut findings = Vec::new();
    for row in rows {
        if !rule.threshold.is_met(row.value) {
            continue;
        }

        let ids = events::evidence_ids(conn, &query, &row.group, evidence_cap)?;
        let group = group_repr(&row.group);
        let group_fields: serde_json::Map<String, serde_json::Value> = rule
            .group_by
            .iter()
            .zip(&row.group)
            .map(|(f, v)| (f.column().to_string(), json!(v)))
            .collect();

        findings.push(Finding {
            title: format!("{} hit", rule.id),
            severity: rule.severity,
            summary: format!(
                "Rule {} matched with count={}{} in window={}; group={}",
                rule.id, row.value, distinct_tag, rule.window_expr, group
            ),
            evidence_event_ids: cap_evidence(ids, evidence_cap),
            features: Some(json!({
                "count": row.value,
                "threshold": rule.threshold.min_count,
                "distinct_field": rule.threshold.distinct_field.map(|f| f.column()),
                "window": rule.window_expr,
                "window_start": range.start.to_rfc3339(),
                "window_end": range.end.to_rfc3339(),
                "group": group_fields,
            })),
        });
    }
    Ok(findings)
}
