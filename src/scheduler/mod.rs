//! Optional cron trigger for `serve`. Each tick runs one evaluation pass.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tracing::{error, info};

use crate::clock::Clock;
use crate::config::Config;
use crate::storage::Pool;

/// Parse a six-field cron expression (seconds first).
pub fn parse(expr: &str) -> Result<CronSchedule> {
    CronSchedule::from_str(expr.trim())
        .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr}': {e}"))
}

/// Fire times after `from`, up to `until`.
pub fn upcoming(
    schedule: &CronSchedule,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    schedule.after(&from).take_while(|t| *t <= until).collect()
}

pub struct Scheduler {
    schedule: CronSchedule,
    pool: Pool,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(expr: &str, pool: Pool, config: Arc<Config>, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            schedule: parse(expr)?,
            pool,
            config,
            clock,
        })
    }

    /// Sleep until each fire time and run all rules. Never returns unless the
    /// schedule has no further fire times.
    pub async fn run(self) {
        info!("rule scheduler started");
        loop {
            let now = Utc::now();
            let Some(next) = self.schedule.after(&now).next() else {
                info!("schedule has no further fire times");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if let Err(e) = self.tick().await {
                error!(error = %format!("{e:#}"), "scheduled run failed");
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let pool = self.pool.clone();
        let config = Arc::clone(&self.config);
        let clock = Arc::clone(&self.clock);
        let report = tokio::task::spawn_blocking(move || -> Result<_> {
            let conn = pool.get().context("no database connection for scheduled run")?;
            Ok(crate::run_all_rules_now(&conn, &config, clock.as_ref()))
        })
        .await??;

        let created: i64 = report.values().filter(|v| **v > 0).sum();
        info!(rules = report.len(), created, "scheduled run complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_parse_and_preview() {
        let schedule = parse("0 */15 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let runs = upcoming(&schedule, from, from + Duration::hours(1));
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0], from + Duration::minutes(15));
        assert_eq!(runs[3], from + Duration::hours(1));
    }

    #[test]
    fn test_rejects_bad_expression() {
        assert!(parse("every five minutes").is_err());
    }
}
