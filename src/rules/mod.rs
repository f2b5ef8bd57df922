//! Rule definitions: declarative threshold documents plus the built-in
//! procedural and model units.

pub mod compiler;
pub mod loader;
pub mod registry;

use std::path::PathBuf;

use tracing::info;

use crate::config::Config;
use registry::Detector;

/// A threshold document as read from disk. The body is validated only when
/// the rule is compiled, so a bad field fails that rule's evaluation instead
/// of disappearing from the run.
#[derive(Debug, Clone)]
pub struct ThresholdRuleDoc {
    pub id: String,
    pub path: PathBuf,
    pub body: serde_yaml::Mapping,
}

/// Everything one evaluation pass runs, split by family.
pub struct RuleSet {
    pub threshold: Vec<ThresholdRuleDoc>,
    pub procedural: Vec<Box<dyn Detector>>,
    pub model: Vec<Box<dyn Detector>>,
}

impl RuleSet {
    /// Load threshold documents from `<detectors_dir>/rules` and pick up the
    /// enabled built-in units.
    pub fn load(cfg: &Config) -> Self {
        let threshold = loader::load_threshold_rules(&cfg.rules.rules_dir());
        let (procedural, model) = registry::enabled(cfg);
        info!(
            threshold = threshold.len(),
            procedural = procedural.len(),
            model = model.len(),
            "rule set loaded"
        );
        Self {
            threshold,
            procedural,
            model,
        }
    }
}
