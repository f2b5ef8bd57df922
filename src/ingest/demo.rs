//! Synthetic telemetry that trips every bundled rule and both built-in units.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::storage::events::{insert_events, EventField, NewEvent};

const BENIGN_PATHS: [&str; 4] = ["/", "/status", "/login", "/api/health"];

const ATTACK_PATHS: [&str; 11] = [
    "/wp-login.php",
    "/phpmyadmin",
    "/admin",
    "/.git/config",
    "/.env",
    "/server-status",
    "/xmlrpc.php",
    "/index.php",
    "/login",
    "/admin/login",
    "/vendor/phpunit/phpunit/src/Util/PHP/eval-stdin.php",
];

const SPRAYED_USERS: [&str; 5] = ["admin", "ubuntu", "ec2-user", "bob", "alice"];

const FAILED_LOGINS: usize = 10;
const SERVER_ERRORS: usize = 25;

/// What was generated, and the actors to look for in the resulting detections.
#[derive(Debug, Clone, Serialize)]
pub struct DemoSummary {
    pub auth_failed: usize,
    pub web: usize,
    pub web_scan_paths: usize,
    pub ssh_multiuser: usize,
    pub geo_rare_login: usize,
    pub http_5xx: usize,
    pub source_ip: String,
    pub scan_ip: String,
    pub multiuser_ip: String,
    pub geo_user: String,
}

fn rand_ip(rng: &mut impl Rng) -> String {
    (0..4).map(|_| rng.gen_range(10..=250).to_string()).collect::<Vec<_>>().join(".")
}

/// Somewhere in the last four minutes, so a 5m window still covers it when
/// the engine runs a little later.
fn recent(now: DateTime<Utc>, rng: &mut impl Rng) -> DateTime<Utc> {
    now - Duration::seconds(rng.gen_range(5..=240))
}

fn maybe<'a>(rng: &mut impl Rng, choices: &[Option<&'a str>]) -> Option<&'a str> {
    choices.choose(rng).copied().flatten()
}

fn auth(at: DateTime<Utc>, action: &str, ip: &str) -> NewEvent {
    NewEvent::new(at, "auth", action).with(EventField::SrcIp, ip)
}

fn http(at: DateTime<Utc>, action: &str, ip: &str) -> NewEvent {
    NewEvent::new(at, "nginx", action).with(EventField::SrcIp, ip)
}

fn with_country(ev: NewEvent, country: Option<&str>) -> NewEvent {
    match country {
        Some(c) => ev.with(EventField::Country, c),
        None => ev,
    }
}

/// Build the demo batch relative to `now`.
pub fn generate(now: DateTime<Utc>, rng: &mut impl Rng) -> (Vec<NewEvent>, DemoSummary) {
    let mut rows = Vec::new();

    let source_ip = rand_ip(rng);
    for _ in 0..FAILED_LOGINS {
        let ev = auth(recent(now, rng), "ssh_login_failed", &source_ip);
        rows.push(ev.with(EventField::User, "demo"));
    }

    for path in BENIGN_PATHS {
        let at = now - Duration::minutes(rng.gen_range(0..=60));
        let ip = rand_ip(rng);
        let country = maybe(rng, &[None, Some("US"), Some("DE"), Some("IN")]);
        let ev = http(at, "http_request", &ip).with(EventField::HttpPath, path);
        rows.push(with_country(ev, country));
    }

    let scan_ip = rand_ip(rng);
    for path in ATTACK_PATHS {
        let at = recent(now, rng);
        let country = maybe(
            rng,
            &[Some("US"), Some("CN"), Some("RU"), Some("DE"), Some("IN"), None],
        );
        let ev = http(at, "http_request", &scan_ip).with(EventField::HttpPath, path);
        rows.push(with_country(ev, country));
    }

    let multiuser_ip = rand_ip(rng);
    let sprayed: Vec<&str> = SPRAYED_USERS.iter().chain(&SPRAYED_USERS[..3]).copied().collect();
    for user in &sprayed {
        let ev = auth(recent(now, rng), "ssh_login_failed", &multiuser_ip);
        rows.push(ev.with(EventField::User, *user));
    }

    // unique per run so earlier demo history never counts as precedent
    let geo_user = format!("geo_user_{}", now.timestamp());
    for days in [7, 3, 1] {
        let at = now - Duration::days(days) - Duration::minutes(30);
        let ip = rand_ip(rng);
        rows.push(
            auth(at, "ssh_login_success", &ip)
                .with(EventField::User, geo_user.as_str())
                .with(EventField::Country, "US"),
        );
    }
    let ip = rand_ip(rng);
    rows.push(
        auth(now - Duration::minutes(1), "ssh_login_success", &ip)
            .with(EventField::User, geo_user.as_str())
            .with(EventField::Country, "CN"),
    );

    for _ in 0..SERVER_ERRORS {
        let at = recent(now, rng);
        let ip = rand_ip(rng);
        rows.push(http(at, "http_5xx", &ip));
    }

    let summary = DemoSummary {
        auth_failed: FAILED_LOGINS,
        web: BENIGN_PATHS.len(),
        web_scan_paths: ATTACK_PATHS.len(),
        ssh_multiuser: sprayed.len(),
        geo_rare_login: 1,
        http_5xx: SERVER_ERRORS,
        source_ip,
        scan_ip,
        multiuser_ip,
        geo_user,
    };
    (rows, summary)
}

/// Generate and store the demo batch.
pub fn seed(conn: &Connection, now: DateTime<Utc>, rng: &mut impl Rng) -> Result<DemoSummary> {
    let (rows, summary) = generate(now, rng);
    insert_events(conn, &rows)?;
    info!(events = rows.len(), geo_user = %summary.geo_user, "demo events seeded");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::events::{count_matching, Filter, TimeRange};
    use crate::storage::open_memory;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_seed_layout() {
        let conn = open_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let summary = seed(&conn, now, &mut StdRng::seed_from_u64(1)).unwrap();

        let last_5m = TimeRange::half_open(now - Duration::minutes(5), now);
        let from_ip = |ip: &str| [Filter::new(EventField::SrcIp, ip)];
        let brute = count_matching(&conn, &last_5m, &from_ip(&summary.source_ip)).unwrap();
        assert_eq!(brute, 10);

        let scan = count_matching(&conn, &last_5m, &from_ip(&summary.scan_ip)).unwrap();
        assert_eq!(scan, ATTACK_PATHS.len() as i64);

        let history = TimeRange::half_open(now - Duration::days(30), now - Duration::minutes(10));
        let geo_user = [Filter::new(EventField::User, &summary.geo_user)];
        let prior = count_matching(&conn, &history, &geo_user).unwrap();
        assert_eq!(prior, 3);
        assert_eq!(summary.ssh_multiuser, 8);
    }
}
