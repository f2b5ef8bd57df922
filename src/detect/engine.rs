//! Run orchestrator.
//!
//! One pass evaluates threshold documents, then procedural units, then model
//! units, each against its own window ending at the clock's "now". Every
//! rule's outcome lands in the [`RunReport`]; a failing rule records
//! [`FAILED`] and the pass moves on.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Duration;
use rusqlite::Connection;
use tracing::{error, info};

use super::{persist, threshold, DetectError};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::rules::registry::{Detector, Family};
use crate::rules::{compiler, RuleSet, ThresholdRuleDoc};

/// Rule id to detections created in one pass, or [`FAILED`].
pub type RunReport = BTreeMap<String, i64>;

/// Report value for a rule whose evaluation failed.
pub const FAILED: i64 = -1;

pub struct RuleEngine<'a> {
    cfg: &'a EngineConfig,
    clock: &'a dyn Clock,
}

impl<'a> RuleEngine<'a> {
    pub fn new(cfg: &'a EngineConfig, clock: &'a dyn Clock) -> Self {
        Self { cfg, clock }
    }

    /// Evaluate every rule in `rules` once and report what each created.
    pub fn run(&self, conn: &Connection, rules: &RuleSet) -> RunReport {
        let mut report = RunReport::new();

        for doc in &rules.threshold {
            let outcome = self.run_threshold(conn, doc);
            // a later document with the same id replaces the earlier entry
            report.insert(doc.id.clone(), self.outcome(&doc.id, outcome));
        }

        for unit in rules.procedural.iter().chain(rules.model.iter()) {
            let outcome = self.run_unit(conn, unit.as_ref());
            let value = self.outcome(unit.name(), outcome);
            merge(&mut report, unit.name(), value);
        }

        let failed = report.values().filter(|v| **v == FAILED).count();
        info!(rules = report.len(), failed, "run complete");
        report
    }

    fn run_threshold(&self, conn: &Connection, doc: &ThresholdRuleDoc) -> Result<usize> {
        let rule = compiler::compile(doc)?;
        let now = self.clock.now();
        let findings = threshold::evaluate(conn, &rule, now, self.cfg.evidence_cap)?;
        Ok(persist::persist_findings(conn, &rule.id, findings, now)?)
    }

    fn run_unit(&self, conn: &Connection, unit: &dyn Detector) -> Result<usize> {
        let until = self.clock.now();
        let window = self.window_for(unit)?;
        let since = until
            .checked_sub_signed(window)
            .ok_or_else(|| {
                let name = unit.name();
                DetectError::Validation(format!("window for {name} is out of range"))
            })?;
        let findings = unit.evaluate(conn, since, until)?;
        Ok(persist::persist_findings(conn, unit.name(), findings, until)?)
    }

    fn window_for(&self, unit: &dyn Detector) -> Result<Duration> {
        if let Some(w) = unit.window() {
            return Ok(w);
        }
        let window = match unit.family() {
            Family::Procedural => Duration::try_minutes(self.cfg.procedural_window_minutes),
            Family::Model => Duration::try_hours(self.cfg.model_window_hours),
        };
        window.ok_or_else(|| {
            let name = unit.name();
            DetectError::Validation(format!("default window for {name} is out of range")).into()
        })
    }

    fn outcome(&self, rule_id: &str, outcome: Result<usize>) -> i64 {
        match outcome {
            Ok(created) => {
                info!(%rule_id, created, "rule evaluated");
                created as i64
            }
            Err(e) => {
                error!(%rule_id, error = %format!("{e:#}"), "rule evaluation failed");
                FAILED
            }
        }
    }
}

/// Fold a later phase's value into the report. Counts add up; a failure on
/// either side leaves the entry at [`FAILED`].
fn merge(report: &mut RunReport, rule_id: &str, value: i64) {
    report
        .entry(rule_id.to_string())
        .and_modify(|e| {
            *e = if *e == FAILED || value == FAILED { FAILED } else { *e + value };
        })
        .or_insert(value);
}

/// Run all rules once with the given clock.
pub fn run_all_rules(
    conn: &Connection,
    rules: &RuleSet,
    cfg: &EngineConfig,
    clock: &dyn Clock,
) -> RunReport {
    RuleEngine::new(cfg, clock).run(conn, rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::detect::{DetectError, Finding, Severity};
    use crate::storage::detections::{list, DetectionFilter};
    use crate::storage::events::{insert_events, EventField, NewEvent};
    use crate::storage::open_memory;
    use chrono::TimeZone;
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn doc(id: &str, yaml: &str) -> ThresholdRuleDoc {
        let body: serde_yaml::Mapping = serde_yaml::from_str(yaml).unwrap();
        ThresholdRuleDoc {
            id: id.to_string(),
            path: PathBuf::from(format!("{id}.yml")),
            body,
        }
    }

    const BRUTEFORCE: &str = r#"
id: SSH-Bruteforce
severity: high
window: 5m
filters:
  - event_module: auth
  - event_action: ssh_login_failed
group_by: [src_ip]
threshold:
  count: ">= 6"
"#;

    fn seed_failed_logins(conn: &Connection, n: i64) {
        let rows: Vec<NewEvent> = (0..n)
            .map(|i| {
                NewEvent::new(now() - Duration::seconds(10 + i), "auth", "ssh_login_failed")
                    .with(EventField::SrcIp, "203.0.113.5")
            })
            .collect();
        insert_events(conn, &rows).unwrap();
    }

    /// Records the window it was handed and returns a canned result.
    struct StubUnit {
        name: &'static str,
        family: Family,
        fail: bool,
        seen: Arc<Mutex<Option<(DateTime<Utc>, DateTime<Utc>)>>>,
    }

    impl StubUnit {
        fn new(name: &'static str, family: Family, fail: bool) -> Self {
            Self { name, family, fail, seen: Arc::default() }
        }
    }

    impl Detector for StubUnit {
        fn name(&self) -> &'static str {
            self.name
        }

        fn family(&self) -> Family {
            self.family
        }

        fn evaluate(
            &self,
            _conn: &Connection,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> Result<Vec<Finding>> {
            *self.seen.lock().unwrap() = Some((since, until));
            if self.fail {
                return Err(DetectError::Execution("model exploded".to_string()).into());
            }
            Ok(vec![Finding {
                title: format!("{} fired", self.name),
                severity: Severity::Low,
                summary: "stub".to_string(),
                evidence_event_ids: vec![],
                features: None,
            }])
        }
    }

    fn rules(
        threshold: Vec<ThresholdRuleDoc>,
        procedural: Vec<Box<dyn Detector>>,
        model: Vec<Box<dyn Detector>>,
    ) -> RuleSet {
        RuleSet { threshold, procedural, model }
    }

    #[test]
    fn test_threshold_end_to_end() {
        let conn = open_memory().unwrap();
        seed_failed_logins(&conn, 10);

        let clock = FixedClock(now());
        let set = rules(vec![doc("SSH-Bruteforce", BRUTEFORCE)], vec![], vec![]);
        let report = run_all_rules(&conn, &set, &EngineConfig::default(), &clock);
        assert_eq!(report.get("SSH-Bruteforce"), Some(&1));

        let dets = list(&conn, &DetectionFilter::default()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].severity, Severity::High);
        assert_eq!(dets[0].event_ids.len(), 10);
        assert!(dets[0].summary.as_deref().unwrap().contains("count=10"));
        assert_eq!(dets[0].created_at, now());
    }

    #[test]
    fn test_malformed_rule_does_not_stop_the_run() {
        let conn = open_memory().unwrap();
        seed_failed_logins(&conn, 10);

        let broken = doc("Broken", "id: Broken\nwindow: 5x\n");
        let set = rules(
            vec![broken, doc("SSH-Bruteforce", BRUTEFORCE)],
            vec![Box::new(StubUnit::new("Proc", Family::Procedural, false))],
            vec![Box::new(StubUnit::new("Model", Family::Model, true))],
        );
        let report = run_all_rules(&conn, &set, &EngineConfig::default(), &FixedClock(now()));

        assert_eq!(report["Broken"], FAILED);
        assert_eq!(report["SSH-Bruteforce"], 1);
        assert_eq!(report["Proc"], 1);
        assert_eq!(report["Model"], FAILED);
    }

    #[test]
    fn test_oversized_window_fails_only_its_rule() {
        let conn = open_memory().unwrap();
        seed_failed_logins(&conn, 10);

        let huge_yaml = BRUTEFORCE
            .replace("id: SSH-Bruteforce", "id: Huge")
            .replace("5m", "3000000000h");
        let huge = doc("Huge", &huge_yaml);
        let mut cfg = EngineConfig::default();
        cfg.model_window_hours = i64::MAX;
        let set = rules(
            vec![huge, doc("SSH-Bruteforce", BRUTEFORCE)],
            vec![],
            vec![Box::new(StubUnit::new("Model", Family::Model, false))],
        );
        let report = run_all_rules(&conn, &set, &cfg, &FixedClock(now()));

        assert_eq!(report["Huge"], FAILED);
        assert_eq!(report["SSH-Bruteforce"], 1);
        assert_eq!(report["Model"], FAILED);
    }

    #[test]
    fn test_family_default_windows() {
        let conn = open_memory().unwrap();
        let proc_unit = Box::new(StubUnit::new("Proc", Family::Procedural, false));
        let model_unit = Box::new(StubUnit::new("Model", Family::Model, false));
        let proc_seen = Arc::clone(&proc_unit.seen);
        let model_seen = Arc::clone(&model_unit.seen);

        let set = rules(vec![], vec![proc_unit], vec![model_unit]);
        run_all_rules(&conn, &set, &EngineConfig::default(), &FixedClock(now()));

        let p = proc_seen.lock().unwrap().unwrap();
        let m = model_seen.lock().unwrap().unwrap();
        assert_eq!(p, (now() - Duration::minutes(10), now()));
        assert_eq!(m, (now() - Duration::hours(24), now()));
    }

    #[test]
    fn test_recurring_id_sums_across_phases() {
        let conn = open_memory().unwrap();
        seed_failed_logins(&conn, 10);
        let set = rules(
            vec![doc("SSH-Bruteforce", BRUTEFORCE)],
            vec![Box::new(StubUnit::new("SSH-Bruteforce", Family::Procedural, false))],
            vec![],
        );
        let report = run_all_rules(&conn, &set, &EngineConfig::default(), &FixedClock(now()));
        assert_eq!(report["SSH-Bruteforce"], 2);
    }

    #[test]
    fn test_merge_keeps_failure_sticky() {
        let mut report = RunReport::new();
        merge(&mut report, "r", FAILED);
        merge(&mut report, "r", 3);
        assert_eq!(report["r"], FAILED);

        merge(&mut report, "s", 2);
        merge(&mut report, "s", FAILED);
        assert_eq!(report["s"], FAILED);
    }

    #[test]
    fn test_persistence_failure_is_reported() {
        let conn = open_memory().unwrap();
        seed_failed_logins(&conn, 10);
        conn.execute_batch("DROP TABLE detections").unwrap();
        let report = run_all_rules(
            &conn,
            &rules(vec![doc("SSH-Bruteforce", BRUTEFORCE)], vec![], vec![]),
            &EngineConfig::default(),
            &FixedClock(now()),
        );
        assert_eq!(report["SSH-Bruteforce"], FAILED);
    }
}
