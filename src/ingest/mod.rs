//! Event ingestion: wire-shape records normalized into store rows.

pub mod demo;

use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::storage::events::{self, NewEvent};

/// Naive layouts accepted after RFC 3339 fails. Interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("unrecognized timestamp '{0}'")]
    Timestamp(String),

    #[error("'{0}' must not be empty")]
    Empty(&'static str),
}

/// One event as submitted by a collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub timestamp: String,
    #[serde(alias = "module")]
    pub event_module: String,
    #[serde(alias = "action")]
    pub event_action: String,
    #[serde(default)]
    pub src_ip: Option<String>,
    #[serde(default)]
    pub dst_ip: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub http_path: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub fields: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub raw_ref: Option<String>,
}

/// Outcome of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub ingested: usize,
    pub failed: usize,
}

/// Parse RFC 3339, or a naive date-time taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, IngestError> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| IngestError::Timestamp(raw.to_string()))
}

impl RawEvent {
    pub fn normalize(&self) -> Result<NewEvent, IngestError> {
        let module = self.event_module.trim();
        if module.is_empty() {
            return Err(IngestError::Empty("event_module"));
        }
        let action = self.event_action.trim();
        if action.is_empty() {
            return Err(IngestError::Empty("event_action"));
        }

        Ok(NewEvent {
            timestamp: parse_timestamp(&self.timestamp)?,
            module: module.to_string(),
            action: action.to_string(),
            src_ip: self.src_ip.clone(),
            dst_ip: self.dst_ip.clone(),
            user: self.user.clone(),
            http_method: self.http_method.clone(),
            http_path: self.http_path.clone(),
            user_agent: self.user_agent.clone(),
            country: self.country.clone(),
            fields: self.fields.clone().unwrap_or_default(),
            raw_ref: self.raw_ref.clone(),
        })
    }
}

/// Normalize and store a batch. Records that fail to normalize are counted
/// and skipped; the rest are written in one transaction.
pub fn ingest_batch(conn: &Connection, raws: &[RawEvent]) -> Result<IngestSummary> {
    let mut rows = Vec::with_capacity(raws.len());
    let mut failed = 0;
    for raw in raws {
        match raw.normalize() {
            Ok(ev) => rows.push(ev),
            Err(e) => {
                debug!(error = %e, "dropping event");
                failed += 1;
            }
        }
    }

    let ids = events::insert_events(conn, &rows)?;
    info!(ingested = ids.len(), failed, "event batch stored");
    Ok(IngestSummary {
        ingested: ids.len(),
        failed,
    })
}

/// Ingest a JSON Lines file. Blank lines are ignored; unparseable lines
/// count as failed.
pub fn ingest_jsonl(conn: &Connection, path: &Path) -> Result<IngestSummary> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut raws = Vec::new();
    let mut bad_lines = 0;
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawEvent>(&line) {
            Ok(raw) => raws.push(raw),
            Err(e) => {
                warn!(path = %path.display(), line = n + 1, error = %e, "unparseable event line");
                bad_lines += 1;
            }
        }
    }

    let mut summary = ingest_batch(conn, &raws)?;
    summary.failed += bad_lines;
    Ok(summary)
}
