//! Event store: normalized telemetry rows and the aggregate queries the
//! detectors run over them.
//!
//! Every column a query may touch is reached through [`EventField`], so rule
//! text never ends up spliced into SQL. Values always travel as bound params.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use super::{fmt_ts, ts_from_row};

/// Queryable event attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventField {
    Module,
    Action,
    SrcIp,
    DstIp,
    User,
    HttpMethod,
    HttpPath,
    UserAgent,
    Country,
}

impl EventField {
    pub fn column(self) -> &'static str {
        match self {
            EventField::Module => "event_module",
            EventField::Action => "event_action",
            EventField::SrcIp => "src_ip",
            EventField::DstIp => "dst_ip",
            EventField::User => "user",
            EventField::HttpMethod => "http_method",
            EventField::HttpPath => "http_path",
            EventField::UserAgent => "user_agent",
            EventField::Country => "country",
        }
    }

    /// Resolve a rule-document key. Both the column name and the short
    /// `module` / `action` spellings are accepted.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "event_module" | "module" => Some(EventField::Module),
            "event_action" | "action" => Some(EventField::Action),
            "src_ip" => Some(EventField::SrcIp),
            "dst_ip" => Some(EventField::DstIp),
            "user" => Some(EventField::User),
            "http_method" => Some(EventField::HttpMethod),
            "http_path" => Some(EventField::HttpPath),
            "user_agent" => Some(EventField::UserAgent),
            "country" => Some(EventField::Country),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

/// A stored, normalized event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub module: String,
    pub action: String,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub user: Option<String>,
    pub http_method: Option<String>,
    pub http_path: Option<String>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub raw_ref: Option<String>,
}

impl Event {
    pub fn get(&self, field: EventField) -> Option<&str> {
        match field {
            EventField::Module => Some(&self.module),
            EventField::Action => Some(&self.action),
            EventField::SrcIp => self.src_ip.as_deref(),
            EventField::DstIp => self.dst_ip.as_deref(),
            EventField::User => self.user.as_deref(),
            EventField::HttpMethod => self.http_method.as_deref(),
            EventField::HttpPath => self.http_path.as_deref(),
            EventField::UserAgent => self.user_agent.as_deref(),
            EventField::Country => self.country.as_deref(),
        }
    }
}

/// An event that has not been written yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub timestamp: DateTime<Utc>,
    pub module: String,
    pub action: String,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub user: Option<String>,
    pub http_method: Option<String>,
    pub http_path: Option<String>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub raw_ref: Option<String>,
}

impl NewEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        module: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            module: module.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    /// Set one optional attribute. `Module` and `Action` overwrite the
    /// required pair.
    pub fn with(mut self, field: EventField, value: impl Into<String>) -> Self {
        let value = value.into();
        match field {
            EventField::Module => self.module = value,
            EventField::Action => self.action = value,
            EventField::SrcIp => self.src_ip = Some(value),
            EventField::DstIp => self.dst_ip = Some(value),
            EventField::User => self.user = Some(value),
            EventField::HttpMethod => self.http_method = Some(value),
            EventField::HttpPath => self.http_path = Some(value),
            EventField::UserAgent => self.user_agent = Some(value),
            EventField::Country => self.country = Some(value),
        }
        self
    }
}

/// An instant range over `events.timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub end_inclusive: bool,
}

impl TimeRange {
    /// `[start, end)`
    pub fn half_open(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end, end_inclusive: false }
    }

    /// `[start, end]`
    pub fn closed(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end, end_inclusive: true }
    }

    fn sql(&self) -> &'static str {
        if self.end_inclusive {
            "timestamp >= ? AND timestamp <= ?"
        } else {
            "timestamp >= ? AND timestamp < ?"
        }
    }
}

/// One equality predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filter {
    pub field: EventField,
    pub value: String,
}

impl Filter {
    pub fn new(field: EventField, value: impl Into<String>) -> Self {
        Self { field, value: value.into() }
    }
}

/// What an aggregate counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Aggregate {
    Count,
    Distinct(EventField),
}

/// A range-filtered, optionally grouped count over events.
#[derive(Debug, Clone)]
pub struct AggregateQuery<'a> {
    pub range: TimeRange,
    pub filters: &'a [Filter],
    pub group_by: &'a [EventField],
    pub aggregate: Aggregate,
}

/// One result row. `group` is empty for an ungrouped query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRow {
    pub group: Vec<Option<String>>,
    pub value: i64,
}

/// Build the shared `WHERE` clause and its bound params.
fn where_clause(range: &TimeRange, filters: &[Filter]) -> (String, Vec<Option<String>>) {
    let mut sql = String::from(range.sql());
    let mut binds = vec![Some(fmt_ts(&range.start)), Some(fmt_ts(&range.end))];
    for f in filters {
        sql.push_str(" AND ");
        sql.push_str(f.field.column());
        sql.push_str(" = ?");
        binds.push(Some(f.value.clone()));
    }
    (sql, binds)
}

const EVENT_COLUMNS: &str = "id, timestamp, event_module, event_action, src_ip, dst_ip, user, \
     http_method, http_path, user_agent, country, fields_json, raw_ref";

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let fields_raw: String = row.get(11)?;
    let fields = serde_json::from_str(&fields_raw).unwrap_or_default();
    Ok(Event {
        id: row.get(0)?,
        timestamp: ts_from_row(row, 1)?,
        module: row.get(2)?,
        action: row.get(3)?,
        src_ip: row.get(4)?,
        dst_ip: row.get(5)?,
        user: row.get(6)?,
        http_method: row.get(7)?,
        http_path: row.get(8)?,
        user_agent: row.get(9)?,
        country: row.get(10)?,
        fields,
        raw_ref: row.get(12)?,
    })
}

/// Insert one event and return its generated id.
pub fn insert_event(conn: &Connection, ev: &NewEvent) -> Result<i64> {
    let fields_json = serde_json::to_string(&ev.fields)?;
    conn.execute(
        "INSERT INTO events (timestamp, event_module, event_action, src_ip, dst_ip, user,
                             http_method, http_path, user_agent, country, fields_json, raw_ref)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            fmt_ts(&ev.timestamp),
            ev.module,
            ev.action,
            ev.src_ip,
            ev.dst_ip,
            ev.user,
            ev.http_method,
            ev.http_path,
            ev.user_agent,
            ev.country,
            fields_json,
            ev.raw_ref,
        ],
    )
    .context("failed to insert event")?;
    Ok(conn.last_insert_rowid())
}

/// Insert a batch in one transaction. Returns the written ids.
pub fn insert_events(conn: &Connection, events: &[NewEvent]) -> Result<Vec<i64>> {
    let tx = conn.unchecked_transaction()?;
    let mut ids = Vec::with_capacity(events.len());
    for ev in events {
        ids.push(insert_event(&tx, ev)?);
    }
    tx.commit().context("failed to commit event batch")?;
    Ok(ids)
}

/// Run a grouped or ungrouped count. Grouped rows come back ordered by the
/// grouping tuple.
pub fn aggregate(conn: &Connection, q: &AggregateQuery<'_>) -> Result<Vec<AggregateRow>> {
    let (where_sql, binds) = where_clause(&q.range, q.filters);
    let count_expr = match q.aggregate {
        Aggregate::Count => "COUNT(*)".to_string(),
        Aggregate::Distinct(field) => format!("COUNT(DISTINCT {})", field.column()),
    };

    if q.group_by.is_empty() {
        let sql = format!("SELECT {count_expr} FROM events WHERE {where_sql}");
        let value: i64 = conn
            .query_row(&sql, params_from_iter(binds.iter()), |row| row.get(0))
            .context("aggregate query failed")?;
        return Ok(vec![AggregateRow { group: Vec::new(), value }]);
    }

    let cols: Vec<&str> = q.group_by.iter().map(|f| f.column()).collect();
    let cols = cols.join(", ");
    let sql = format!(
        "SELECT {cols}, {count_expr} FROM events WHERE {where_sql} GROUP BY {cols} ORDER BY {cols}"
    );
    let width = q.group_by.len();

    let mut stmt = conn.prepare(&sql).context("failed to prepare aggregate query")?;
    let rows = stmt.query_map(params_from_iter(binds.iter()), |row| {
        let mut group = Vec::with_capacity(width);
        for i in 0..width {
            group.push(row.get::<_, Option<String>>(i)?);
        }
        Ok(AggregateRow { group, value: row.get(width)? })
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Ids of events matching `q` and the given group tuple, newest first.
/// Group matching uses `IS`, so a NULL group value still finds its rows.
pub fn evidence_ids(
    conn: &Connection,
    q: &AggregateQuery<'_>,
    group: &[Option<String>],
    limit: usize,
) -> Result<Vec<i64>> {
    let (mut where_sql, mut binds) = where_clause(&q.range, q.filters);
    for (field, value) in q.group_by.iter().zip(group) {
        where_sql.push_str(" AND ");
        where_sql.push_str(field.column());
        where_sql.push_str(" IS ?");
        binds.push(value.clone());
    }
    let sql = format!("SELECT id FROM events WHERE {where_sql} ORDER BY id DESC LIMIT {limit}");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds.iter()), |row| row.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for r in rows {
        ids.push(r?);
    }
    Ok(ids)
}

/// Events in `range` that match every filter, newest first.
pub fn find(
    conn: &Connection,
    range: &TimeRange,
    filters: &[Filter],
    limit: Option<usize>,
) -> Result<Vec<Event>> {
    let (where_sql, binds) = where_clause(range, filters);
    let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE {where_sql} ORDER BY id DESC");
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds.iter()), map_event)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Number of events in `range` matching every filter.
pub fn count_matching(conn: &Connection, range: &TimeRange, filters: &[Filter]) -> Result<i64> {
    let (where_sql, binds) = where_clause(range, filters);
    let sql = format!("SELECT COUNT(*) FROM events WHERE {where_sql}");
    let n = conn.query_row(&sql, params_from_iter(binds.iter()), |row| row.get(0))?;
    Ok(n)
}

/// Fetch the given ids, newest first, capped at `limit`.
pub fn get_many(conn: &Connection, ids: &[i64], limit: usize) -> Result<Vec<Event>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let marks = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE id IN ({marks}) ORDER BY id DESC LIMIT {limit}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(ids.iter()), map_event)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Browse query over stored events. Bounds are `[start, end)`; either may
/// be left open.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub filters: Vec<Filter>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

/// Stored events matching `filter`, newest first.
pub fn list(conn: &Connection, filter: &EventFilter) -> Result<Vec<Event>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(start) = &filter.start {
        clauses.push("timestamp >= ?".to_string());
        binds.push(fmt_ts(start));
    }
    if let Some(end) = &filter.end {
        clauses.push("timestamp < ?".to_string());
        binds.push(fmt_ts(end));
    }
    for f in &filter.filters {
        clauses.push(format!("{} = ?", f.field.column()));
        binds.push(f.value.clone());
    }

    let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY id DESC LIMIT {} OFFSET {}", filter.limit, filter.offset));

    let mut stmt = conn.prepare(&sql).context("failed to prepare event listing")?;
    let rows = stmt.query_map(params_from_iter(binds.iter()), map_event)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn failed_login(secs: i64, ip: Option<&str>, user: &str) -> NewEvent {
        let ev = NewEvent::new(t0() + Duration::seconds(secs), "auth", "ssh_login_failed")
            .with(EventField::User, user);
        match ip {
            Some(ip) => ev.with(EventField::SrcIp, ip),
            None => ev,
        }
    }

    fn seed(conn: &Connection) {
        let rows = vec![
            failed_login(0, Some("10.0.0.1"), "root"),
            failed_login(1, Some("10.0.0.1"), "admin"),
            failed_login(2, Some("10.0.0.2"), "root"),
            failed_login(3, None, "root"),
            NewEvent::new(t0() + Duration::seconds(4), "nginx", "http_request")
                .with(EventField::SrcIp, "10.0.0.1"),
        ];
        insert_events(conn, &rows).unwrap();
    }

    #[test]
    fn test_grouped_count_and_distinct() {
        let conn = open_memory().unwrap();
        seed(&conn);
        let filters = [Filter::new(EventField::Action, "ssh_login_failed")];
        let group = [EventField::SrcIp];
        let range = TimeRange::half_open(t0(), t0() + Duration::minutes(5));

        let q = AggregateQuery {
            range,
            filters: &filters,
            group_by: &group,
            aggregate: Aggregate::Count,
        };
        let rows = aggregate(&conn, &q).unwrap();
        // NULL sorts first in SQLite
        assert_eq!(rows[0], AggregateRow { group: vec![None], value: 1 });
        assert_eq!(rows[1], AggregateRow { group: vec![Some("10.0.0.1".into())], value: 2 });
        assert_eq!(rows[2], AggregateRow { group: vec![Some("10.0.0.2".into())], value: 1 });

        let q = AggregateQuery { aggregate: Aggregate::Distinct(EventField::User), ..q };
        let rows = aggregate(&conn, &q).unwrap();
        assert_eq!(rows[1].value, 2);
    }

    #[test]
    fn test_range_end_is_exclusive() {
        let conn = open_memory().unwrap();
        seed(&conn);
        let range = TimeRange::half_open(t0(), t0() + Duration::seconds(4));
        let q = AggregateQuery { range, filters: &[], group_by: &[], aggregate: Aggregate::Count };
        assert_eq!(aggregate(&conn, &q).unwrap()[0].value, 4);

        let closed = TimeRange::closed(t0(), t0() + Duration::seconds(4));
        assert_eq!(count_matching(&conn, &closed, &[]).unwrap(), 5);
    }

    #[test]
    fn test_evidence_ids_newest_first_and_null_safe() {
        let conn = open_memory().unwrap();
        seed(&conn);
        let filters = [Filter::new(EventField::Module, "auth")];
        let group = [EventField::SrcIp];
        let range = TimeRange::half_open(t0(), t0() + Duration::minutes(5));
        let q = AggregateQuery {
            range,
            filters: &filters,
            group_by: &group,
            aggregate: Aggregate::Count,
        };

        let ids = evidence_ids(&conn, &q, &[Some("10.0.0.1".into())], 50).unwrap();
        assert_eq!(ids, vec![2, 1]);
        let ids = evidence_ids(&conn, &q, &[None], 50).unwrap();
        assert_eq!(ids, vec![4]);
        let ids = evidence_ids(&conn, &q, &[Some("10.0.0.1".into())], 1).unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_find_and_get_many() {
        let conn = open_memory().unwrap();
        seed(&conn);
        let range = TimeRange::closed(t0(), t0() + Duration::minutes(1));
        let events = find(&conn, &range, &[Filter::new(EventField::User, "root")], None).unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 3, 1]);

        let events = get_many(&conn, &[1, 5, 3], 2).unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 3]);
        assert_eq!(events[0].get(EventField::Module), Some("nginx"));
    }

    #[test]
    fn test_list_filters_bounds_and_pages() {
        let conn = open_memory().unwrap();
        seed(&conn);
        let ids = |f: &EventFilter| -> Vec<i64> {
            list(&conn, f).unwrap().iter().map(|e| e.id).collect()
        };

        let all = EventFilter { limit: 50, ..Default::default() };
        assert_eq!(ids(&all), vec![5, 4, 3, 2, 1]);

        let by_ip = EventFilter {
            filters: vec![
                Filter::new(EventField::Module, "auth"),
                Filter::new(EventField::SrcIp, "10.0.0.1"),
            ],
            ..all.clone()
        };
        assert_eq!(ids(&by_ip), vec![2, 1]);

        let bounded = EventFilter {
            start: Some(t0() + Duration::seconds(1)),
            end: Some(t0() + Duration::seconds(4)),
            ..all.clone()
        };
        assert_eq!(ids(&bounded), vec![4, 3, 2]);

        let page = EventFilter { limit: 2, offset: 1, ..all };
        assert_eq!(ids(&page), vec![4, 3]);
    }

    #[test]
    fn test_field_keys() {
        assert_eq!(EventField::from_key("event_module"), Some(EventField::Module));
        assert_eq!(EventField::from_key("module"), Some(EventField::Module));
        assert_eq!(EventField::from_key("http_path"), Some(EventField::HttpPath));
        assert_eq!(EventField::from_key("hostname"), None);
    }
}
