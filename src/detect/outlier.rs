//! Anomaly-Login-Combo: scores every event in the window by how unusual its
//! (source address, user, path) combination is, using an isolation forest
//! fitted on that window alone.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::forest::{ForestParams, IsolationForest};
use super::{Finding, Severity};
use crate::config::OutlierConfig;
use crate::rules::registry::{Detector, Family};
use crate::storage::events::{self, Event, EventField, TimeRange};

/// Identifies the categorical encoding. Bump when `encode_categorical` changes.
pub const ENCODING_VERSION: &str = "sha256-be64-mod-v1";

/// Encoded attributes, in feature-vector order.
pub const FEATURES: [EventField; 3] = [EventField::SrcIp, EventField::User, EventField::HttpPath];

/// Map a categorical value into `[0, modulus)`. Absent and empty values map
/// to 0. Collisions are expected and tolerated.
pub fn encode_categorical(value: Option<&str>, modulus: u64) -> f64 {
    match value {
        None | Some("") => 0.0,
        Some(s) => {
            let digest = Sha256::digest(s.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            (u64::from_be_bytes(head) % modulus.max(1)) as f64
        }
    }
}

pub fn encode_event(ev: &Event, modulus: u64) -> Vec<f64> {
    FEATURES.iter().map(|f| encode_categorical(ev.get(*f), modulus)).collect()
}

/// Per-feature share of the absolute deviation from `baseline`, summing to 1.
/// Returns equal shares when the row sits exactly on the baseline.
pub fn feature_importance(row: &[f64], baseline: &[f64]) -> Vec<f64> {
    let dev: Vec<f64> = row.iter().zip(baseline).map(|(x, m)| (x - m).abs()).collect();
    let total: f64 = dev.iter().sum();
    if total <= 0.0 {
        return vec![1.0 / row.len() as f64; row.len()];
    }
    dev.into_iter().map(|d| d / total).collect()
}

fn column_means(rows: &[&Vec<f64>], width: usize) -> Vec<f64> {
    let mut means = vec![0.0; width];
    if rows.is_empty() {
        return means;
    }
    for row in rows {
        for (m, v) in means.iter_mut().zip(row.iter()) {
            *m += v;
        }
    }
    for m in &mut means {
        *m /= rows.len() as f64;
    }
    means
}

pub struct AnomalyLoginCombo {
    cfg: OutlierConfig,
}

impl AnomalyLoginCombo {
    pub const NAME: &'static str = "Anomaly-Login-Combo";

    pub fn new(cfg: OutlierConfig) -> Self {
        Self { cfg }
    }

    fn params(&self) -> ForestParams {
        ForestParams {
            n_trees: self.cfg.n_trees,
            max_samples: self.cfg.max_samples,
            contamination: self.cfg.contamination,
            seed: self.cfg.seed,
        }
    }
}

impl Detector for AnomalyLoginCombo {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn family(&self) -> Family {
        Family::Model
    }

    fn evaluate(
        &self,
        conn: &Connection,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Finding>> {
        let range = TimeRange::closed(since, until);
        let rows = events::find(conn, &range, &[], Some(self.cfg.max_events))?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let x: Vec<Vec<f64>> = rows
            .iter()
            .map(|ev| encode_event(ev, self.cfg.hash_modulus))
            .collect();
        let forest = IsolationForest::fit(&x, &self.params())?;
        let decision = forest.decision_function(&x);
        let flagged = forest.predict(&x);

        let (outliers, normal): (Vec<usize>, Vec<usize>) =
            (0..rows.len()).partition(|&i| flagged[i]);
        debug!(
            events = rows.len(),
            outliers = outliers.len(),
            offset = forest.offset(),
            "outlier model fitted"
        );
        if outliers.is_empty() {
            return Ok(Vec::new());
        }

        let normal_rows: Vec<&Vec<f64>> = if normal.is_empty() {
            x.iter().collect()
        } else {
            normal.iter().map(|&i| &x[i]).collect()
        };
        let baseline = column_means(&normal_rows, FEATURES.len());

        let mut ranked = outliers;
        ranked.sort_by(|&a, &b| {
            decision[a]
                .total_cmp(&decision[b])
                .then(rows[b].id.cmp(&rows[a].id))
        });
        ranked.truncate(self.cfg.top_n);

        let findings = ranked
            .into_iter()
            .map(|i| {
                let ev = &rows[i];
                let score = decision[i];
                let importance = feature_importance(&x[i], &baseline);
                let top = importance
                    .iter()
                    .enumerate()
                    .fold(0, |best, (j, w)| if *w > importance[best] { j } else { best });
                let top_feature = FEATURES[top].column();

                let breakdown: serde_json::Map<String, serde_json::Value> = FEATURES
                    .iter()
                    .zip(&importance)
                    .map(|(f, w)| (f.column().to_string(), json!(w)))
                    .collect();

                Finding {
                    title: format!("Anomalous event #{}", ev.id),
                    severity: Severity::Medium,
                    summary: format!(
                        "IsolationForest flagged event {} as anomalous (score={:.3}); \
                         top feature={}.",
                        ev.id, score, top_feature
                    ),
                    evidence_event_ids: vec![ev.id],
                    features: Some(json!({
                        "score": score,
                        "top_feature": top_feature,
                        "importance": breakdown,
                        "encoding": ENCODING_VERSION,
                    })),
                }
            })
            .collect();
        Ok(findings)
    }
}
