//! Tunable thresholds for the matcher.
//! Every value can be overridden through a `MATCH_*` environment variable.

use log::{debug, info};
use std::env;
use std::path::PathBuf;

const DEFAULT_AMBIGUITY_MARGIN: f64 = 0.10;
const DEFAULT_DISAMBIGUATION_NAME_FLOOR: f64 = 0.70;
const DEFAULT_MAX_PROBABILISTIC_CANDIDATES: usize = 10;
const DEFAULT_PROBABILISTIC_THRESHOLD: f64 = 0.60;
const DEFAULT_PROBABILISTIC_NAME_FLOOR: f64 = 0.70;
const DEFAULT_TRIGRAM_THRESHOLD: f64 = 0.40;
const DEFAULT_FUZZY_BATCH_SIZE: usize = 10_000;
const DEFAULT_LOG_FLUSH_SIZE: usize = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    /// Minimum lead the top model probability needs over the runner-up
    /// before a collision is settled by the linkage model.
    pub ambiguity_margin: f64,
    /// Name similarity the model's winner must clear during collision resolution.
    pub disambiguation_name_floor: f64,
    /// Collisions larger than this are not handed to the model.
    pub max_probabilistic_candidates: usize,
    pub probabilistic_threshold: f64,
    pub probabilistic_name_floor: f64,
    pub trigram_threshold: f64,
    pub fuzzy_batch_size: usize,
    pub log_flush_size: usize,
    pub linkage_model_path: Option<PathBuf>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            ambiguity_margin: DEFAULT_AMBIGUITY_MARGIN,
            disambiguation_name_floor: DEFAULT_DISAMBIGUATION_NAME_FLOOR,
            max_probabilistic_candidates: DEFAULT_MAX_PROBABILISTIC_CANDIDATES,
            probabilistic_threshold: DEFAULT_PROBABILISTIC_THRESHOLD,
            probabilistic_name_floor: DEFAULT_PROBABILISTIC_NAME_FLOOR,
            trigram_threshold: DEFAULT_TRIGRAM_THRESHOLD,
            fuzzy_batch_size: DEFAULT_FUZZY_BATCH_SIZE,
            log_flush_size: DEFAULT_LOG_FLUSH_SIZE,
            linkage_model_path: None,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl MatchConfig {
    pub fn from_env() -> Self {
        let config = Self {
            ambiguity_margin: env_or("MATCH_AMBIGUITY_MARGIN", DEFAULT_AMBIGUITY_MARGIN),
            disambiguation_name_floor: env_or(
                "MATCH_DISAMBIGUATION_NAME_FLOOR",
                DEFAULT_DISAMBIGUATION_NAME_FLOOR,
            ),
            max_probabilistic_candidates: env_or(
                "MATCH_MAX_PROBABILISTIC_CANDIDATES",
                DEFAULT_MAX_PROBABILISTIC_CANDIDATES,
            ),
            probabilistic_threshold: env_or("MATCH_PROBABILISTIC_THRESHOLD", DEFAULT_PROBABILISTIC_THRESHOLD),
            probabilistic_name_floor: env_or("MATCH_PROBABILISTIC_NAME_FLOOR", DEFAULT_PROBABILISTIC_NAME_FLOOR),
            trigram_threshold: env_or("MATCH_TRIGRAM_THRESHOLD", DEFAULT_TRIGRAM_THRESHOLD),
            fuzzy_batch_size: env_or("MATCH_FUZZY_BATCH_SIZE", DEFAULT_FUZZY_BATCH_SIZE).max(1),
            log_flush_size: env_or("MATCH_LOG_FLUSH_SIZE", DEFAULT_LOG_FLUSH_SIZE).max(1),
            linkage_model_path: env::var("LINKAGE_MODEL_PATH")
                .ok()
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        };
        debug!("Match config from env: {:?}", config);
        config
    }

    pub fn log_config(&self) {
        info!("⚙️  Matcher configuration:");
        info!("   • ambiguity margin: {:.2}", self.ambiguity_margin);
        info!(
            "   • probabilistic threshold: {:.2} (name floor {:.2})",
            self.probabilistic_threshold, self.probabilistic_name_floor
        );
        info!("   • trigram threshold: {:.2}", self.trigram_threshold);
        info!(
            "   • fuzzy batch size: {}, log flush size: {}",
            self.fuzzy_batch_size, self.log_flush_size
        );
        match &self.linkage_model_path {
            Some(path) => info!("   • linkage model: {}", path.display()),
            None => info!("   • linkage model: none (trigram-only fuzzy matching)"),
        }
    }
}
