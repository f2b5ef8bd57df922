//! End-to-end runs of the library against temp SQLite files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;

use sigwatch::clock::FixedClock;
use sigwatch::config::Config;
use sigwatch::detect::engine::FAILED;
use sigwatch::detect::Severity;
use sigwatch::storage::detections::{self, DetectionFilter};
use sigwatch::storage::events::{insert_events, EventField, NewEvent};
use sigwatch::storage::{open_pool, Pool};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

struct Env {
    _dir: tempfile::TempDir,
    pool: Pool,
    cfg: Config,
}

fn env_with(detectors: PathBuf, disabled: &[&str]) -> Env {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("sigwatch.db");
    let pool = open_pool(db.to_str().unwrap()).unwrap();
    let mut cfg = Config::default();
    cfg.rules.detectors_dir = detectors;
    cfg.rules.disabled = disabled.iter().map(|s| s.to_string()).collect();
    Env { _dir: dir, pool, cfg }
}

fn bundled() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("detectors")
}

#[test]
fn test_failed_login_burst_creates_one_detection() {
    let env = env_with(bundled(), &["Anomaly-Login-Combo"]);
    let conn = env.pool.get().unwrap();

    let rows: Vec<NewEvent> = (0..10)
        .map(|i| {
            NewEvent::new(now() - Duration::seconds(20 * i + 5), "auth", "ssh_login_failed")
                .with(EventField::SrcIp, "198.51.100.23")
                .with(EventField::User, "root")
        })
        .collect();
    let ids = insert_events(&conn, &rows).unwrap();

    let report = sigwatch::run_all_rules_now(&conn, &env.cfg, &FixedClock(now()));
    assert_eq!(report["SSH-Bruteforce"], 1);
    assert_eq!(report["SSH-MultiUser-Bruteforce"], 0);
    assert_eq!(report["Geo-Rare-Login"], 0);
    assert!(!report.contains_key("Anomaly-Login-Combo"));

    let dets = detections::list(&conn, &DetectionFilter::default()).unwrap();
    assert_eq!(dets.len(), 1);
    let det = &dets[0];
    assert_eq!(det.severity, Severity::High);
    assert!(det.summary.as_deref().unwrap().contains("count=10"));
    let mut newest_first = ids.clone();
    newest_first.reverse();
    assert_eq!(det.event_ids, newest_first);
    assert_eq!(det.tags, vec!["SSH-Bruteforce".to_string(), "rule".to_string()]);
}

#[test]
fn test_geo_rare_login_through_engine() {
    let env = env_with(bundled(), &["Anomaly-Login-Combo"]);
    let conn = env.pool.get().unwrap();

    let success = |at: DateTime<Utc>, country: &str| {
        NewEvent::new(at, "auth", "ssh_login_success")
            .with(EventField::User, "geo_user")
            .with(EventField::Country, country)
    };
    insert_events(
        &conn,
        &[
            success(now() - Duration::days(45), "US"),
            success(now() - Duration::minutes(3), "CN"),
            success(now() - Duration::minutes(1), "CN"),
        ],
    )
    .unwrap();

    let report = sigwatch::run_all_rules_now(&conn, &env.cfg, &FixedClock(now()));
    assert_eq!(report["Geo-Rare-Login"], 1);

    // same pass again: the CN logins are still inside the current window
    // and still lack history, so a duplicate is created
    let again = sigwatch::run_all_rules_now(&conn, &env.cfg, &FixedClock(now()));
    assert_eq!(again["Geo-Rare-Login"], 1);

    let det = &detections::list(&conn, &DetectionFilter::default()).unwrap()[0];
    assert_eq!(det.event_ids.len(), 2);
    assert!(det.title.contains("geo_user") && det.title.contains("CN"));
}

#[test]
fn test_malformed_document_is_isolated() {
    let dir = tempfile::TempDir::new().unwrap();
    let rules = dir.path().join("rules");
    std::fs::create_dir_all(&rules).unwrap();
    let bundled_ssh = bundled().join("rules").join("ssh_bruteforce.yml");
    std::fs::copy(bundled_ssh, rules.join("a_ssh.yml")).unwrap();
    std::fs::write(rules.join("b_window.yml"), "id: Bad-Window\nwindow: \"5\"\n").unwrap();
    std::fs::write(rules.join("c_broken.yml"), "id: [unclosed\n").unwrap();

    let env = env_with(dir.path().to_path_buf(), &["Anomaly-Login-Combo", "Geo-Rare-Login"]);
    let conn = env.pool.get().unwrap();
    let rows: Vec<NewEvent> = (0..7)
        .map(|i| {
            NewEvent::new(now() - Duration::seconds(i + 1), "auth", "ssh_login_failed")
                .with(EventField::SrcIp, "192.0.2.1")
        })
        .collect();
    insert_events(&conn, &rows).unwrap();

    let report = sigwatch::run_all_rules_now(&conn, &env.cfg, &FixedClock(now()));
    assert_eq!(report.len(), 2);
    assert_eq!(report["SSH-Bruteforce"], 1);
    assert_eq!(report["Bad-Window"], FAILED);
}

#[test]
fn test_demo_batch_trips_every_bundled_rule() {
    let env = env_with(bundled(), &[]);
    let conn = env.pool.get().unwrap();
    sigwatch::ingest::demo::seed(&conn, now(), &mut StdRng::seed_from_u64(7)).unwrap();

    let report = sigwatch::run_all_rules_now(&conn, &env.cfg, &FixedClock(now()));
    assert_eq!(report["SSH-Bruteforce"], 2);
    assert_eq!(report["SSH-MultiUser-Bruteforce"], 1);
    assert_eq!(report["Web-Scan"], 1);
    assert_eq!(report["HTTP-5xx-Spike"], 1);
    assert_eq!(report["Geo-Rare-Login"], 1);
    assert!(report["Anomaly-Login-Combo"] >= 0);
}
