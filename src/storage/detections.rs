//! Detection store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::{fmt_ts, ts_from_row};
use crate::detect::{Detection, DetectionKind, DetectionStatus, Severity};

/// A detection that has not been written yet.
#[derive(Debug, Clone)]
pub struct NewDetection {
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

/// Listing filter. `limit` defaults to 50.
#[derive(Debug, Clone)]
pub struct DetectionFilter {
    pub status: Option<DetectionStatus>,
    pub kind: Option<DetectionKind>,
    pub severity: Option<Severity>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            status: None,
            kind: None,
            severity: None,
            limit: 50,
            offset: 0,
        }
    }
}

const DETECTION_COLUMNS: &str = "id, created_at, rule_id, kind, severity, title, summary, \
     event_ids_json, features_json, status, assignee, tags_json";

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn map_detection(row: &rusqlite::Row<'_>) -> rusqlite::Result<Detection> {
    let kind: String = row.get(3)?;
    let severity: String = row.get(4)?;
    let event_ids: String = row.get(7)?;
    let features: Option<String> = row.get(8)?;
    let status: String = row.get(9)?;
    let tags: String = row.get(11)?;

    Ok(Detection {
        id: row.get(0)?,
        created_at: ts_from_row(row, 1)?,
        rule_id: row.get(2)?,
        kind: kind.parse().map_err(|e| conversion_err(3, e))?,
        severity: severity.parse().map_err(|e| conversion_err(4, e))?,
        title: row.get(5)?,
        summary: row.get(6)?,
        event_ids: serde_json::from_str(&event_ids).map_err(|e| conversion_err(7, e))?,
        features: features
            .map(|f| serde_json::from_str(&f))
            .transpose()
            .map_err(|e| conversion_err(8, e))?,
        status: status.parse().map_err(|e| conversion_err(9, e))?,
        assignee: row.get(10)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_err(11, e))?,
    })
}

/// Insert one detection and return its id.
///
/// Returns the bare `rusqlite::Error` so the persister can classify it.
pub fn insert(conn: &Connection, d: &NewDetection) -> rusqlite::Result<i64> {
    let to_sql_err = |e: serde_json::Error| rusqlite::Error::ToSqlConversionFailure(Box::new(e));
    let event_ids = serde_json::to_string(&d.event_ids).map_err(to_sql_err)?;
    let tags = serde_json::to_string(&d.tags).map_err(to_sql_err)?;
    let features = d
        .features
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    conn.execute(
        "INSERT INTO detections (created_at, rule_id, kind, severity, title, summary,
                                 event_ids_json, features_json, status, assignee, tags_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            fmt_ts(&d.created_at),
            d.rule_id,
            d.kind.as_str(),
            d.severity.as_str(),
            d.title,
            d.summary,
            event_ids,
            features,
            d.status.as_str(),
            d.assignee,
            tags,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Detection>> {
    conn.query_row(
        &format!("SELECT {DETECTION_COLUMNS} FROM detections WHERE id = ?1"),
        [id],
        map_detection,
    )
    .optional()
    .context("failed to load detection")
}

/// Newest-first listing.
pub fn list(conn: &Connection, filter: &DetectionFilter) -> Result<Vec<Detection>> {
    let mut clauses = Vec::new();
    let mut binds: Vec<&'static str> = Vec::new();
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        binds.push(status.as_str());
    }
    if let Some(kind) = filter.kind {
        clauses.push("kind = ?");
        binds.push(kind.as_str());
    }
    if let Some(severity) = filter.severity {
        clauses.push("severity = ?");
        binds.push(severity.as_str());
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {DETECTION_COLUMNS} FROM detections {where_sql} \
         ORDER BY id DESC LIMIT {} OFFSET {}",
        filter.limit, filter.offset
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds.iter()), map_detection)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Used by the case workflow. The engine never calls this.
pub fn set_status(conn: &Connection, id: i64, status: DetectionStatus) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE detections SET status = ?1 WHERE id = ?2",
        params![status.as_str(), id],
    )?;
    Ok(changed > 0)
}

pub fn set_assignee(conn: &Connection, id: i64, assignee: Option<&str>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE detections SET assignee = ?1 WHERE id = ?2",
        params![assignee, id],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory;
    use chrono::TimeZone;

    fn sample(severity: Severity, kind: DetectionKind) -> NewDetection {
        NewDetection {
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            rule_id: Some("SSH-Bruteforce".into()),
            kind,
            severity,
            title: "SSH-Bruteforce hit".into(),
            summary: Some("Rule SSH-Bruteforce matched".into()),
            event_ids: vec![9, 8, 7],
            features: Some(serde_json::json!({ "score": -0.2 })),
            status: DetectionStatus::Open,
            assignee: None,
            tags: vec!["SSH-Bruteforce".into(), "rule".into()],
        }
    }

    #[test]
    fn test_insert_and_get() {
        let conn = open_memory().unwrap();
        let id = insert(&conn, &sample(Severity::High, DetectionKind::Rule)).unwrap();
        let d = get(&conn, id).unwrap().unwrap();
        assert_eq!(d.event_ids, vec![9, 8, 7]);
        assert_eq!(d.severity, Severity::High);
        assert_eq!(d.tags, vec!["SSH-Bruteforce".to_string(), "rule".to_string()]);
        assert_eq!(d.features.unwrap()["score"], -0.2);
        assert!(get(&conn, id + 100).unwrap().is_none());
    }

    #[test]
    fn test_list_filters_and_order() {
        let conn = open_memory().unwrap();
        insert(&conn, &sample(Severity::High, DetectionKind::Rule)).unwrap();
        insert(&conn, &sample(Severity::Medium, DetectionKind::Anomaly)).unwrap();
        insert(&conn, &sample(Severity::High, DetectionKind::Rule)).unwrap();

        let all = list(&conn, &DetectionFilter::default()).unwrap();
        let ids: Vec<i64> = all.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let high = DetectionFilter { severity: Some(Severity::High), ..Default::default() };
        assert_eq!(list(&conn, &high).unwrap().len(), 2);

        let page = DetectionFilter { limit: 1, offset: 1, ..Default::default() };
        assert_eq!(list(&conn, &page).unwrap()[0].id, 2);

        let kind = DetectionFilter { kind: Some(DetectionKind::Anomaly), ..Default::default() };
        let anomalies = list(&conn, &kind).unwrap();
        assert_eq!(anomalies.len(), 1);
    }

    #[test]
    fn test_status_and_assignee_updates() {
        let conn = open_memory().unwrap();
        let id = insert(&conn, &sample(Severity::Low, DetectionKind::Rule)).unwrap();
        assert!(set_status(&conn, id, DetectionStatus::Closed).unwrap());
        assert!(set_assignee(&conn, id, Some("analyst1")).unwrap());
        let d = get(&conn, id).unwrap().unwrap();
        assert_eq!(d.status, DetectionStatus::Closed);
        assert_eq!(d.assignee.as_deref(), Some("analyst1"));

        let filter = DetectionFilter { status: Some(DetectionStatus::Open), ..Default::default() };
        let open = list(&conn, &filter).unwrap();
        assert!(open.is_empty());
    }
}
