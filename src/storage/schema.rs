//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_module TEXT NOT NULL,
            event_action TEXT NOT NULL,
            src_ip TEXT,
            dst_ip TEXT,
            user TEXT,
            http_method TEXT,
            http_path TEXT,
            user_agent TEXT,
            country TEXT,
            fields_json TEXT NOT NULL DEFAULT '{}',
            raw_ref TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_module ON events(event_module);
        CREATE INDEX IF NOT EXISTS idx_events_action ON events(event_action);
        CREATE INDEX IF NOT EXISTS idx_events_src_ip ON events(src_ip);
        CREATE INDEX IF NOT EXISTS idx_events_user ON events(user);
        CREATE INDEX IF NOT EXISTS idx_events_http_path ON events(http_path);

        CREATE TABLE IF NOT EXISTS detections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            rule_id TEXT,
            kind TEXT NOT NULL DEFAULT 'rule',
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            summary TEXT,
            event_ids_json TEXT NOT NULL DEFAULT '[]',
            features_json TEXT,
            status TEXT NOT NULL DEFAULT 'open',
            assignee TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_detections_rule ON detections(rule_id);
        CREATE INDEX IF NOT EXISTS idx_detections_kind ON detections(kind);
        CREATE INDEX IF NOT EXISTS idx_detections_severity ON detections(severity);
        CREATE INDEX IF NOT EXISTS idx_detections_status ON detections(status);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}
