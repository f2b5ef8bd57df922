//! Geo-rare login: flags a user whose successful logins in the current
//! window come from a country with no precedent in their history.
//!
//! History is measured strictly before the current window. Events inside
//! the current window never count as precedent for each other.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde_json::json;
use tracing::debug;

use super::{cap_evidence, DetectError, Finding, Severity};
use crate::config::BaselineConfig;
use crate::rules::registry::{Detector, Family};
use crate::storage::events::{self, EventField, Filter, TimeRange};

pub struct GeoRareLogin {
    cfg: BaselineConfig,
    evidence_cap: usize,
}

/// Current-window logins for one (user, country) pair.
#[derive(Debug, Default)]
struct Group {
    /// Newest first.
    ids: Vec<i64>,
    latest: Option<DateTime<Utc>>,
}

impl GeoRareLogin {
    pub const NAME: &'static str = "Geo-Rare-Login";

    pub fn new(cfg: BaselineConfig, evidence_cap: usize) -> Self {
        Self { cfg, evidence_cap }
    }

    fn qualifying(&self) -> Vec<Filter> {
        vec![
            Filter::new(EventField::Module, &self.cfg.module),
            Filter::new(EventField::Action, &self.cfg.action),
        ]
    }

    fn is_ignored(&self, value: &str) -> bool {
        self.cfg.ignored_values.iter().any(|v| v == value)
    }

    /// Group current-window logins by trimmed (user, country), dropping
    /// placeholder values and too-short names.
    fn current_groups(
        &self,
        conn: &Connection,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BTreeMap<(String, String), Group>> {
        let rows = events::find(conn, &TimeRange::closed(since, until), &self.qualifying(), None)?;

        let mut groups: BTreeMap<(String, String), Group> = BTreeMap::new();
        for ev in rows {
            let (Some(user), Some(country)) = (ev.user.as_deref(), ev.country.as_deref()) else {
                continue;
            };
            let user = user.trim();
            let country = country.trim();
            let too_short = user.chars().count() < self.cfg.min_entity_len;
            if user.is_empty() || too_short || self.is_ignored(country) {
                continue;
            }
            let g = groups.entry((user.to_string(), country.to_string())).or_default();
            g.ids.push(ev.id);
            g.latest = g.latest.max(Some(ev.timestamp));
        }
        Ok(groups)
    }
}

impl Detector for GeoRareLogin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn family(&self) -> Family {
        Family::Procedural
    }

    fn window(&self) -> Option<Duration> {
        // out of range saturates, which the engine then rejects
        Some(Duration::try_minutes(self.cfg.current_window_minutes).unwrap_or(Duration::MAX))
    }

    fn evaluate(
        &self,
        conn: &Connection,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Finding>> {
        let groups = self.current_groups(conn, since, until)?;
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let history_start = Duration::try_days(self.cfg.history_days)
            .and_then(|d| since.checked_sub_signed(d))
            .ok_or_else(|| {
                let days = self.cfg.history_days;
                DetectError::Validation(format!("history_days {days} is out of range"))
            })?;
        let history = TimeRange::half_open(history_start, since);

        let mut findings = Vec::new();
        for ((user, country), group) in groups {
            let mut filters = self.qualifying();
            filters.push(Filter::new(EventField::User, &user));
            filters.push(Filter::new(EventField::Country, &country));

            let seen = events::count_matching(conn, &history, &filters)?;
            if seen > 0 {
                debug!(%user, %country, seen, "country has precedent");
                continue;
            }

            findings.push(Finding {
                title: format!("Suspicious geo login for {user} from {country}"),
                severity: Severity::High,
                summary: format!(
                    "User '{user}' logged in successfully from new country '{country}' \
                     not seen in the past {}d.",
                    self.cfg.history_days
                ),
                evidence_event_ids: cap_evidence(group.ids, self.evidence_cap),
                features: Some(json!({
                    "user": user,
                    "country": country,
                    "timestamp": group.latest.map(|t| t.to_rfc3339()),
                    "history_days": self.cfg.history_days,
                })),
            });
        }
        Ok(findings)
    }
}
