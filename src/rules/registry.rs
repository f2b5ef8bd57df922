//! Compile-time table of built-in procedural and model units.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use crate::config::Config;
use crate::detect::baseline::GeoRareLogin;
use crate::detect::outlier::AnomalyLoginCombo;
use crate::detect::Finding;

/// Which evaluation phase a unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Runs after threshold rules, default window from `procedural_window_minutes`.
    Procedural,
    /// Runs last, default window from `model_window_hours`.
    Model,
}

/// A non-declarative rule.
pub trait Detector: Send + Sync {
    /// Stable identifier, used as the rule id in detections and the report.
    fn name(&self) -> &'static str;

    fn family(&self) -> Family;

    /// Evaluation window this unit wants instead of its family default.
    fn window(&self) -> Option<Duration> {
        None
    }

    fn evaluate(
        &self,
        conn: &Connection,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Finding>>;
}

type Constructor = fn(&Config) -> Box<dyn Detector>;

/// Name, family and constructor for every built-in unit.
static BUILTIN: &[(&str, Family, Constructor)] = &[
    (GeoRareLogin::NAME, Family::Procedural, geo_rare_login),
    (AnomalyLoginCombo::NAME, Family::Model, anomaly_login_combo),
];

fn geo_rare_login(cfg: &Config) -> Box<dyn Detector> {
    Box::new(GeoRareLogin::new(cfg.baseline.clone(), cfg.engine.evidence_cap))
}

fn anomaly_login_combo(cfg: &Config) -> Box<dyn Detector> {
    Box::new(AnomalyLoginCombo::new(cfg.outlier.clone()))
}

/// Names of every registered unit.
pub fn names() -> impl Iterator<Item = &'static str> {
    BUILTIN.iter().map(|(name, _, _)| *name)
}

/// Instantiate enabled units, split into (procedural, model). Units whose
/// name starts with `_` or appears in `[rules] disabled` are left out.
pub fn enabled(cfg: &Config) -> (Vec<Box<dyn Detector>>, Vec<Box<dyn Detector>>) {
    let mut procedural = Vec::new();
    let mut model = Vec::new();
    for (name, family, build) in BUILTIN {
        if name.starts_with('_') || cfg.rules.disabled.iter().any(|d| d.as_str() == *name) {
            tracing::debug!(unit = %name, "unit disabled");
            continue;
        }
        let unit = build(cfg);
        match family {
            Family::Procedural => procedural.push(unit),
            Family::Model => model.push(unit),
        }
    }
    (procedural, model)
}
