use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sigwatch::clock::SystemClock;
use sigwatch::config::{Config, LoggingConfig};
use sigwatch::rules::loader::{self, CheckStatus};
use sigwatch::storage::{self, detections, events};

#[derive(Parser)]
#[command(
    name = "sigwatch",
    about = "Correlation and anomaly detection over normalized security telemetry",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults: $SIGWATCH_CONFIG, then ./sigwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + optional cron trigger)
    Serve {
        /// Bind address, overrides [api] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run all rules once and print the report as JSON
    Run,

    /// Ingest a JSON Lines file of events
    Ingest {
        /// Path to the .jsonl file
        file: PathBuf,
    },

    /// Inspect stored detections
    Detections {
        #[command(subcommand)]
        action: DetectionsAction,
    },

    /// Validate rule documents
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Generate demo telemetry
    Demo {
        #[command(subcommand)]
        action: DemoAction,
    },

    /// Inspect the configured cron trigger
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum DetectionsAction {
    /// List detections, newest first
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        severity: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show one detection with its evidence events
    Show {
        id: i64,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Load and compile every document in the rules directory
    Check,
}

#[derive(Subcommand)]
enum DemoAction {
    /// Insert a demo batch that trips every bundled rule
    Seed {
        /// Also run all rules afterwards
        #[arg(long)]
        run: bool,
        /// RNG seed for reproducible batches
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Preview fire times in the next N hours
    DryRun {
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve the config under a plain stderr subscriber so fallback warnings
/// are visible before the configured one is installed.
fn resolve_config(explicit: Option<&Path>) -> Result<Config> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || Config::resolve(explicit))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = resolve_config(cli.config.as_deref())?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.api.bind = bind;
            }
            tracing::info!(bind = %cfg.api.bind, "Starting sigwatch daemon");
            sigwatch::serve(cfg).await?;
        }
        Commands::Run => {
            let pool = storage::open_pool(&cfg.storage.database_path)?;
            let conn = pool.get()?;
            let report = sigwatch::run_all_rules_now(&conn, &cfg, &SystemClock);
            print_json(&report)?;
        }
        Commands::Ingest { file } => {
            let pool = storage::open_pool(&cfg.storage.database_path)?;
            let conn = pool.get()?;
            let summary = sigwatch::ingest::ingest_jsonl(&conn, &file)?;
            println!("Ingested {} event(s), {} failed.", summary.ingested, summary.failed);
        }
        Commands::Detections { action } => {
            let pool = storage::open_pool(&cfg.storage.database_path)?;
            let conn = pool.get()?;
            match action {
                DetectionsAction::List {
                    status,
                    kind,
                    severity,
                    limit,
                    offset,
                } => {
                    let filter = detections::DetectionFilter {
                        status: status.map(|s| s.parse()).transpose()?,
                        kind: kind.map(|s| s.parse()).transpose()?,
                        severity: severity.map(|s| s.parse()).transpose()?,
                        limit,
                        offset,
                    };
                    let rows = detections::list(&conn, &filter)?;
                    if rows.is_empty() {
                        println!("No detections found.");
                    } else {
                        println!(
                            "{:<6} | {:<20} | {:<8} | {:<6} | Title",
                            "ID", "Rule", "Severity", "Status"
                        );
                        println!(
                            "{:-<6}-|-{:-<20}-|-{:-<8}-|-{:-<6}-|-{:-<40}",
                            "", "", "", "", ""
                        );
                        for d in rows {
                            println!(
                                "{:<6} | {:<20} | {:<8} | {:<6} | {}",
                                d.id,
                                d.rule_id.as_deref().unwrap_or("-"),
                                d.severity,
                                d.status.as_str(),
                                d.title
                            );
                        }
                    }
                }
                DetectionsAction::Show { id } => {
                    let Some(det) = detections::get(&conn, id)? else {
                        bail!("detection {id} not found");
                    };
                    let evidence = events::get_many(&conn, &det.event_ids, 200)?;
                    print_json(&serde_json::json!({
                        "detection": det,
                        "evidence_events": evidence
                    }))?;
                }
            }
        }
        Commands::Rules { action: RulesAction::Check } => {
            let dir = cfg.rules.rules_dir();
            let mut bad = 0;
            for (path, status) in loader::check(&dir) {
                let name = path.display();
                match status {
                    CheckStatus::Valid { id } => println!("OK    {name} ({id})"),
                    CheckStatus::Skipped { reason } => println!("SKIP  {name}: {reason}"),
                    CheckStatus::LoadFailed(e) => {
                        bad += 1;
                        println!("FAIL  {name}: {e}");
                    }
                    CheckStatus::Invalid { id, error } => {
                        bad += 1;
                        println!("FAIL  {name} ({id}): {error}");
                    }
                }
            }
            let units: Vec<&str> = sigwatch::rules::registry::names().collect();
            println!("Built-in units: {}", units.join(", "));
            if bad > 0 {
                bail!("{bad} rule document(s) in {} failed validation", dir.display());
            }
        }
        Commands::Demo {
            action: DemoAction::Seed { run, seed },
        } => {
            use rand::SeedableRng;

            let pool = storage::open_pool(&cfg.storage.database_path)?;
            let conn = pool.get()?;
            let mut rng = match seed {
                Some(s) => rand::rngs::StdRng::seed_from_u64(s),
                None => rand::rngs::StdRng::from_entropy(),
            };
            let summary = sigwatch::ingest::demo::seed(&conn, chrono::Utc::now(), &mut rng)?;
            if run {
                let report = sigwatch::run_all_rules_now(&conn, &cfg, &SystemClock);
                print_json(&serde_json::json!({ "generated": summary, "rules": report }))?;
            } else {
                print_json(&summary)?;
            }
        }
        Commands::Schedule {
            action: ScheduleAction::DryRun { hours },
        } => {
            let Some(expr) = cfg.schedule.cron.as_deref() else {
                println!("No schedule configured.");
                return Ok(());
            };
            let schedule = sigwatch::scheduler::parse(expr)?;
            let now = chrono::Utc::now();
            let until = now + chrono::Duration::hours(hours);
            let runs = sigwatch::scheduler::upcoming(&schedule, now, until);
            if runs.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for t in runs {
                    println!("{}", t.to_rfc3339());
                }
            }
        }
    }

    Ok(())
}
