//! sigwatch -- correlation and anomaly detection over normalized security
//! telemetry.
//!
//! This crate provides the event and detection stores, the declarative
//! threshold rules, the built-in baseline and outlier units, and the
//! orchestrator that runs them in one pass.

pub mod api;
pub mod clock;
pub mod config;
pub mod detect;
pub mod ingest;
pub mod rules;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;
use rusqlite::Connection;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::detect::engine::{self, RunReport};
use crate::rules::RuleSet;

/// Load the rule set from disk and evaluate it once against `conn`.
pub fn run_all_rules_now(conn: &Connection, cfg: &Config, clock: &dyn Clock) -> RunReport {
    let rules = RuleSet::load(cfg);
    engine::run_all_rules(conn, &rules, &cfg.engine, clock)
}

/// Start the daemon: API server plus, when configured, the cron trigger.
pub async fn serve(cfg: Config) -> Result<()> {
    tracing::info!(db_path = %cfg.storage.database_path, "Initializing database");
    let pool = storage::open_pool(&cfg.storage.database_path)?;

    let addr: std::net::SocketAddr = cfg.api.bind.parse()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = api::state::AppState::new(pool.clone(), cfg, Arc::clone(&clock));

    if let Some(expr) = state.config.schedule.cron.as_deref() {
        let sched = scheduler::Scheduler::new(expr, pool, Arc::clone(&state.config), clock)?;
        tokio::spawn(sched.run());
    }

    let app = api::router(state);

    tracing::info!(%addr, "sigwatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
