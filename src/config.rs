//! TOML configuration for sigwatch.
//!
//! Every section is optional and every field has a default, so an empty file
//! is a valid configuration. The file is looked up from an explicit path, the
//! `SIGWATCH_CONFIG` environment variable, then `./sigwatch.toml`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the engine, CLI and API server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub outlier: OutlierConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration in order:
    /// 1. `explicit`, when given. A failure here is an error.
    /// 2. The path in `SIGWATCH_CONFIG`.
    /// 3. `./sigwatch.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("SIGWATCH_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SIGWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new("sigwatch.toml");
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/sigwatch.db".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Where rules come from and which built-in units are switched off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Root holding the `rules/` and `ml/` subdirectories.
    pub detectors_dir: PathBuf,
    /// Built-in unit names to skip.
    pub disabled: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            detectors_dir: PathBuf::from("detectors"),
            disabled: Vec::new(),
        }
    }
}

impl RulesConfig {
    pub fn rules_dir(&self) -> PathBuf {
        self.detectors_dir.join("rules")
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default evaluation window for procedural units.
    pub procedural_window_minutes: i64,
    /// Default evaluation window for model units.
    pub model_window_hours: i64,
    /// Maximum evidence ids kept per detection.
    pub evidence_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            procedural_window_minutes: 10,
            model_window_hours: 24,
            evidence_cap: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Baseline (geo rare login)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub current_window_minutes: i64,
    pub history_days: i64,
    pub module: String,
    pub action: String,
    pub min_entity_len: usize,
    /// Attribute values treated as "no data". Absent values are always ignored.
    pub ignored_values: Vec<String>,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            current_window_minutes: 10,
            history_days: 30,
            module: "auth".to_string(),
            action: "ssh_login_success".to_string(),
            min_entity_len: 1,
            ignored_values: vec![String::new(), "ZZ".to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Outlier model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    pub max_events: usize,
    pub top_n: usize,
    pub n_trees: usize,
    /// Subsample size per tree, clamped to the batch size.
    pub max_samples: usize,
    pub contamination: f64,
    pub seed: u64,
    pub hash_modulus: u64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            max_events: 5000,
            top_n: 5,
            n_trees: 50,
            max_samples: 256,
            contamination: 0.01,
            seed: 42,
            hash_modulus: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// API / schedule / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Optional periodic trigger for `serve`. Off when `cron` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Six-field cron expression (seconds first), e.g. `0 */5 * * * *`.
    pub cron: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the human formatter.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
