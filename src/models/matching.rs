// src/models/matching.rs

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Sentinel written as `target_id` for collisions nobody could resolve.
pub const AMBIGUOUS_TARGET: &str = "AMBIGUOUS";

/// One matching strategy, ordered by specificity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchTier {
    EinExact,
    NameCityStateExact,
    NameStateExact,
    AggressiveState,
    Probabilistic,
    TrigramFuzzy,
}

impl MatchTier {
    /// Deterministic tiers in the order the cascade evaluates them.
    pub const CASCADE: [MatchTier; 4] = [
        MatchTier::EinExact,
        MatchTier::NameCityStateExact,
        MatchTier::NameStateExact,
        MatchTier::AggressiveState,
    ];

    pub fn rank(&self) -> u8 {
        match self {
            MatchTier::EinExact => 100,
            MatchTier::NameCityStateExact => 90,
            MatchTier::NameStateExact => 80,
            MatchTier::AggressiveState => 60,
            MatchTier::Probabilistic => 45,
            MatchTier::TrigramFuzzy => 40,
        }
    }

    /// Score awarded to an unambiguous index hit. Fuzzy tiers score themselves.
    pub fn base_score(&self) -> f64 {
        match self {
            MatchTier::EinExact => 1.0,
            MatchTier::NameCityStateExact => 0.95,
            MatchTier::NameStateExact => 0.90,
            MatchTier::AggressiveState => 0.75,
            MatchTier::Probabilistic | MatchTier::TrigramFuzzy => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::EinExact => "EIN_EXACT",
            MatchTier::NameCityStateExact => "NAME_CITY_STATE_EXACT",
            MatchTier::NameStateExact => "NAME_STATE_EXACT",
            MatchTier::AggressiveState => "AGGRESSIVE_STATE",
            MatchTier::Probabilistic => "PROBABILISTIC",
            MatchTier::TrigramFuzzy => "TRIGRAM_FUZZY",
        }
    }
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse confidence classification derived from a numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            ConfidenceBand::High
        } else if score >= 0.70 {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "HIGH",
            ConfidenceBand::Medium => "MEDIUM",
            ConfidenceBand::Low => "LOW",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HIGH" => Some(ConfidenceBand::High),
            "MEDIUM" => Some(ConfidenceBand::Medium),
            "LOW" => Some(ConfidenceBand::Low),
            _ => None,
        }
    }
}

/// How a multi-candidate collision inside a tier was settled, if there was one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Direct,
    CityResolved,
    ProbabilisticResolved,
    Ambiguous,
}

impl Resolution {
    fn suffix(&self) -> &'static str {
        match self {
            Resolution::Direct => "",
            Resolution::CityResolved => "_CITY_RESOLVED",
            Resolution::ProbabilisticResolved => "_PROBABILISTIC_RESOLVED",
            Resolution::Ambiguous => "_AMBIGUOUS",
        }
    }
}

/// What a source record resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchTarget {
    None,
    Employer { employer_id: String, employer_name: String },
    Ambiguous,
}

impl MatchTarget {
    /// The value stored in the log's `target_id` column.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            MatchTarget::None => None,
            MatchTarget::Employer { employer_id, .. } => Some(employer_id.as_str()),
            MatchTarget::Ambiguous => Some(AMBIGUOUS_TARGET),
        }
    }

    pub fn is_employer(&self) -> bool {
        matches!(self, MatchTarget::Employer { .. })
    }
}

/// Field-level explanation of a collision resolved by the linkage model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilisticDecision {
    pub probability: f64,
    pub runner_up_probability: Option<f64>,
    pub name_similarity: f64,
    pub match_weight: f64,
    pub comparison_levels: BTreeMap<String, String>,
}

/// Per-tier evidence. Serialized to a plain JSON object only when written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchEvidence {
    EinExact {
        ein: String,
    },
    NameCityStateExact {
        name_standard: String,
        city: String,
        state: String,
        candidates_considered: usize,
    },
    NameStateExact {
        name_standard: String,
        state: String,
        candidates_considered: usize,
        resolved_city: Option<String>,
    },
    AggressiveState {
        name_aggressive: String,
        state: String,
        candidates_considered: usize,
        resolved_city: Option<String>,
    },
    CollisionResolvedByModel {
        tier: MatchTier,
        candidates_considered: usize,
        decision: ProbabilisticDecision,
    },
    Probabilistic {
        decision: ProbabilisticDecision,
        candidates_scored: usize,
    },
    Trigram {
        similarity: f64,
        source_name_fuzzy: String,
        target_name_fuzzy: String,
        state: String,
    },
    Ambiguous {
        tier: MatchTier,
        candidate_ids: Vec<String>,
        reason: String,
    },
    NoMatch {
        tiers_attempted: Vec<MatchTier>,
        tiers_unavailable: Vec<String>,
    },
}

impl MatchEvidence {
    /// Flattens the typed evidence into the generic key/value map stored in the log.
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// The engine's single output for one source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub source_id: String,
    pub target: MatchTarget,
    pub tier: Option<MatchTier>,
    pub resolution: Resolution,
    pub tier_rank: u8,
    pub confidence_band: ConfidenceBand,
    pub score: f64,
    pub evidence: MatchEvidence,
}

impl MatchResult {
    pub fn employer(
        source_id: &str,
        employer_id: &str,
        employer_name: &str,
        tier: MatchTier,
        resolution: Resolution,
        score: f64,
        evidence: MatchEvidence,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            target: MatchTarget::Employer {
                employer_id: employer_id.to_string(),
                employer_name: employer_name.to_string(),
            },
            tier: Some(tier),
            resolution,
            tier_rank: tier.rank(),
            confidence_band: ConfidenceBand::from_score(score),
            score,
            evidence,
        }
    }

    pub fn ambiguous(source_id: &str, tier: MatchTier, candidate_ids: Vec<String>, reason: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            target: MatchTarget::Ambiguous,
            tier: Some(tier),
            resolution: Resolution::Ambiguous,
            tier_rank: tier.rank(),
            confidence_band: ConfidenceBand::Low,
            score: 0.0,
            evidence: MatchEvidence::Ambiguous {
                tier,
                candidate_ids,
                reason: reason.to_string(),
            },
        }
    }

    pub fn no_match(source_id: &str, tiers_attempted: Vec<MatchTier>, tiers_unavailable: Vec<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            target: MatchTarget::None,
            tier: None,
            resolution: Resolution::Direct,
            tier_rank: 0,
            confidence_band: ConfidenceBand::Low,
            score: 0.0,
            evidence: MatchEvidence::NoMatch {
                tiers_attempted,
                tiers_unavailable,
            },
        }
    }

    /// Tier name plus collision suffix, e.g. `NAME_STATE_EXACT_CITY_RESOLVED`.
    pub fn method(&self) -> String {
        match self.tier {
            Some(tier) => format!("{}{}", tier.as_str(), self.resolution.suffix()),
            None => "NO_MATCH".to_string(),
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target.target_id()
    }

    pub fn is_match(&self) -> bool {
        self.target.is_employer()
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self.target, MatchTarget::Ambiguous)
    }

    /// Accepted matches feed downstream projections; LOW never does.
    pub fn is_accepted(&self) -> bool {
        self.is_match() && self.confidence_band != ConfidenceBand::Low
    }
}
