//! Smoke tests -- verify the binary runs and drives the engine end to end.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use chrono::{Duration, Utc};
use predicates::str::contains;

fn bundled_detectors() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("detectors")
}

/// Config pointing at a temp database and the given detectors root.
fn write_config(dir: &Path, detectors: &Path) -> PathBuf {
    let path = dir.join("sigwatch.toml");
    let body = format!(
        "[storage]\ndatabase_path = {:?}\n\n[rules]\ndetectors_dir = {:?}\n",
        dir.join("sigwatch.db").display().to_string(),
        detectors.display().to_string(),
    );
    std::fs::write(&path, body).unwrap();
    path
}

fn sigwatch() -> Command {
    let mut cmd = Command::cargo_bin("sigwatch").unwrap();
    cmd.env_remove("SIGWATCH_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    sigwatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Correlation and anomaly detection"));
}

#[test]
fn test_cli_version() {
    sigwatch().arg("--version").assert().success().stdout(contains("sigwatch"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["run", "--help"],
        vec!["ingest", "--help"],
        vec!["detections", "list", "--help"],
        vec!["detections", "show", "--help"],
        vec!["rules", "check", "--help"],
        vec!["demo", "seed", "--help"],
        vec!["schedule", "dry-run", "--help"],
    ] {
        sigwatch().args(&args).assert().success();
    }
}

#[test]
fn test_unreadable_env_config_warns_and_falls_back() {
    let dir = tempfile::TempDir::new().unwrap();
    sigwatch()
        .current_dir(dir.path())
        .env("SIGWATCH_CONFIG", dir.path().join("missing.toml"))
        .args(["schedule", "dry-run"])
        .assert()
        .success()
        .stdout(contains("No schedule configured."))
        .stderr(contains("could not be loaded"));
}

#[test]
fn test_bundled_rules_check_clean() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path(), &bundled_detectors());
    sigwatch()
        .arg("--config")
        .arg(&config)
        .args(["rules", "check"])
        .assert()
        .success()
        .stdout(contains("SSH-Bruteforce"))
        .stdout(contains("Web-Scan"))
        .stdout(contains("Geo-Rare-Login"));
}

#[test]
fn test_rules_check_fails_on_bad_document() {
    let dir = tempfile::TempDir::new().unwrap();
    let detectors = dir.path().join("detectors");
    std::fs::create_dir_all(detectors.join("rules")).unwrap();
    let bad = "id: Bad\nthreshold:\n  count: \"> 3\"\n";
    std::fs::write(detectors.join("rules").join("bad.yml"), bad).unwrap();
    let config = write_config(dir.path(), &detectors);

    sigwatch()
        .arg("--config")
        .arg(&config)
        .args(["rules", "check"])
        .assert()
        .failure()
        .stdout(contains("FAIL"));
}

#[test]
fn test_ingest_then_run() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path(), &bundled_detectors());

    let now = Utc::now();
    let lines: Vec<String> = (0..10)
        .map(|i| {
            serde_json::json!({
                "timestamp": (now - Duration::seconds(30 + i)).to_rfc3339(),
                "event_module": "auth",
                "event_action": "ssh_login_failed",
                "src_ip": "203.0.113.50",
                "user": "root"
            })
            .to_string()
        })
        .collect();
    let file = dir.path().join("events.jsonl");
    std::fs::write(&file, lines.join("\n")).unwrap();

    sigwatch()
        .arg("--config")
        .arg(&config)
        .arg("ingest")
        .arg(&file)
        .assert()
        .success()
        .stdout(contains("Ingested 10 event(s), 0 failed."));

    sigwatch()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .assert()
        .success()
        .stdout(contains("\"SSH-Bruteforce\": 1"));

    sigwatch()
        .arg("--config")
        .arg(&config)
        .args(["detections", "list", "--severity", "high"])
        .assert()
        .success()
        .stdout(contains("SSH-Bruteforce hit"));
}
