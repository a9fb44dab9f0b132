// src/matching/probabilistic.rs - Multi-field Fellegi-Sunter linkage model
use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use strsim::jaro_winkler;

use crate::matching::index::PreparedSource;
use crate::matching::name::{normalize_address, normalize_location_key, normalize_naics, normalize_zip};
use crate::models::core::ReferenceEmployer;
use crate::models::matching::ProbabilisticDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonField {
    Name,
    State,
    City,
    Zip,
    Naics,
    Address,
}

impl ComparisonField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonField::Name => "name",
            ComparisonField::State => "state",
            ComparisonField::City => "city",
            ComparisonField::Zip => "zip",
            ComparisonField::Naics => "naics",
            ComparisonField::Address => "address",
        }
    }
}

/// Predicate deciding whether a pair of field values falls in a level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LevelKind {
    Exact,
    JaroWinkler { threshold: f64 },
    Prefix { length: usize },
    Else,
}

impl LevelKind {
    fn accepts(&self, left: &str, right: &str) -> bool {
        match self {
            LevelKind::Exact => left == right,
            LevelKind::JaroWinkler { threshold } => jaro_winkler(left, right) >= *threshold,
            LevelKind::Prefix { length } => {
                left.chars().count() >= *length
                    && right.chars().count() >= *length
                    && left.chars().take(*length).eq(right.chars().take(*length))
            }
            LevelKind::Else => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonLevel {
    pub label: String,
    pub kind: LevelKind,
    pub m_probability: f64,
    pub u_probability: f64,
}

impl ComparisonLevel {
    fn weight(&self) -> f64 {
        (self.m_probability / self.u_probability).log2()
    }
}

/// Ordered levels for one field; the first level that accepts the pair wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub field: ComparisonField,
    pub levels: Vec<ComparisonLevel>,
}

/// Pre-trained multi-field comparison model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkageModel {
    #[serde(default)]
    pub model_version: Option<String>,
    pub probability_two_random_records_match: f64,
    pub comparisons: Vec<Comparison>,
}

/// Outcome of scoring one source/candidate pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelScore {
    pub probability: f64,
    pub match_weight: f64,
    pub levels: BTreeMap<String, String>,
}

impl ModelScore {
    pub fn into_decision(self, runner_up_probability: Option<f64>, name_similarity: f64) -> ProbabilisticDecision {
        ProbabilisticDecision {
            probability: self.probability,
            runner_up_probability,
            name_similarity,
            match_weight: self.match_weight,
            comparison_levels: self.levels,
        }
    }
}

fn field_values(
    field: ComparisonField,
    source: &PreparedSource<'_>,
    candidate: &ReferenceEmployer,
) -> Option<(String, String)> {
    let pair = match field {
        ComparisonField::Name => {
            if source.name_standard.is_empty() || candidate.name_standard.is_empty() {
                return None;
            }
            (source.name_standard.clone(), candidate.name_standard.clone())
        }
        ComparisonField::State => (source.state.clone()?, normalize_location_key(candidate.state.as_deref())?),
        ComparisonField::City => (source.city.clone()?, normalize_location_key(candidate.city.as_deref())?),
        ComparisonField::Zip => (source.zip.clone()?, normalize_zip(candidate.zip.as_deref())?),
        ComparisonField::Naics => (source.naics.clone()?, normalize_naics(candidate.naics.as_deref())?),
        ComparisonField::Address => (
            source.address.clone()?,
            normalize_address(candidate.street_address.as_deref())?,
        ),
    };
    Some(pair)
}

impl LinkageModel {
    /// Reads and validates a model artifact.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read linkage model at {}", path.display()))?;
        let model: LinkageModel = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse linkage model at {}", path.display()))?;
        model.validate()?;
        Ok(model)
    }

    /// Loads the model when one is configured. Any failure is logged and
    /// reported as `None`: without a model, fuzzy matching runs trigram-only.
    pub fn load_optional(path: Option<&Path>) -> Option<Self> {
        let path = path?;
        match Self::load(path) {
            Ok(model) => {
                info!(
                    "🧮 Loaded linkage model {} ({} comparisons) from {}",
                    model.model_version.as_deref().unwrap_or("unversioned"),
                    model.comparisons.len(),
                    path.display()
                );
                Some(model)
            }
            Err(e) => {
                warn!("Linkage model unavailable, falling back to trigram-only fuzzy matching: {:#}", e);
                None
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let prior = self.probability_two_random_records_match;
        if !(prior > 0.0 && prior < 1.0) {
            bail!("probability_two_random_records_match must be in (0, 1), got {}", prior);
        }
        for comparison in &self.comparisons {
            if comparison.levels.is_empty() {
                bail!("comparison '{}' has no levels", comparison.field.as_str());
            }
            for level in &comparison.levels {
                let valid = |p: f64| p > 0.0 && p <= 1.0;
                if !valid(level.m_probability) || !valid(level.u_probability) {
                    bail!(
                        "comparison '{}' level '{}' has m/u outside (0, 1]",
                        comparison.field.as_str(),
                        level.label
                    );
                }
            }
        }
        Ok(())
    }

    fn prior_weight(&self) -> f64 {
        let prior = self.probability_two_random_records_match;
        (prior / (1.0 - prior)).log2()
    }

    /// Scores a pair. Fields missing on either side take the null level
    /// and contribute nothing to the match weight.
    pub fn score(&self, source: &PreparedSource<'_>, candidate: &ReferenceEmployer) -> ModelScore {
        let mut match_weight = self.prior_weight();
        let mut levels = BTreeMap::new();

        for comparison in &self.comparisons {
            let label = match field_values(comparison.field, source, candidate) {
                None => "null".to_string(),
                Some((left, right)) => match comparison.levels.iter().find(|level| level.kind.accepts(&left, &right)) {
                    Some(level) => {
                        match_weight += level.weight();
                        level.label.clone()
                    }
                    None => "unmatched".to_string(),
                },
            };
            levels.insert(comparison.field.as_str().to_string(), label);
        }

        let odds = match_weight.exp2();
        let probability = if odds.is_infinite() { 1.0 } else { odds / (1.0 + odds) };

        ModelScore {
            probability,
            match_weight,
            levels,
        }
    }
}

#[cfg(test)]
pub(crate) fn bundled_model() -> LinkageModel {
    serde_json::from_str(include_str!("../../models/employer_linkage_model.json")).expect("bundled model parses")
}
