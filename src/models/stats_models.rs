// src/models/stats_models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::matching::{ConfidenceBand, MatchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

/// One execution of the engine against one source system.
///
/// Created when the run starts, counted as results arrive and frozen by
/// [`MatchRun::finalize`], or marked by [`MatchRun::fail`] when a step after
/// creation errors. A run left in `Running` was interrupted and is incomplete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRun {
    pub run_id: String,
    pub scenario: String,
    pub source_system: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub total_source: usize,
    pub total_matched: usize,
    pub total_ambiguous: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
    pub method_counts: BTreeMap<String, usize>,
    pub results_digest: Option<String>,
}

impl MatchRun {
    pub fn start(run_id: &str, scenario: &str, source_system: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            scenario: scenario.to_string(),
            source_system: source_system.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            total_source: 0,
            total_matched: 0,
            total_ambiguous: 0,
            high_count: 0,
            medium_count: 0,
            low_count: 0,
            method_counts: BTreeMap::new(),
            results_digest: None,
        }
    }

    /// Counts one result. Band counts only cover real decisions (matches and
    /// ambiguous collisions); plain misses only move `total_source`.
    pub fn record(&mut self, result: &MatchResult) {
        self.total_source += 1;
        *self.method_counts.entry(result.method()).or_insert(0) += 1;

        if result.is_ambiguous() {
            self.total_ambiguous += 1;
        }
        if result.is_match() {
            self.total_matched += 1;
        }
        if result.is_match() || result.is_ambiguous() {
            match result.confidence_band {
                ConfidenceBand::High => self.high_count += 1,
                ConfidenceBand::Medium => self.medium_count += 1,
                ConfidenceBand::Low => self.low_count += 1,
            }
        }
    }

    pub fn finalize(&mut self, results_digest: String) {
        self.completed_at = Some(Utc::now());
        self.status = RunStatus::Completed;
        self.results_digest = Some(results_digest);
    }

    /// Closes the run without a digest; its log rows must not be trusted.
    pub fn fail(&mut self) {
        self.completed_at = Some(Utc::now());
        self.status = RunStatus::Failed;
        self.results_digest = None;
    }

    pub fn match_rate(&self) -> f64 {
        if self.total_source == 0 {
            0.0
        } else {
            self.total_matched as f64 / self.total_source as f64
        }
    }
}

/// Counters collected by the cascade and fuzzy passes for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchingStats {
    pub records_processed: usize,
    pub cascade_matches: usize,
    pub probabilistic_matches: usize,
    pub trigram_matches: usize,
    pub collisions_resolved: usize,
    pub collisions_ambiguous: usize,
    pub tier_errors: usize,
    pub fuzzy_candidates: usize,
}

/// A cluster of reference rows believed to be one real-world employer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalGroup {
    pub group_id: i64,
    pub group_key: String,
    pub canonical_employer_id: String,
    pub canonical_name: String,
    pub member_ids: Vec<String>,
    pub member_count: usize,
    pub consolidated_workers: i64,
    pub is_cross_state: bool,
    pub states: Vec<String>,
    pub absorbed_by_fuzzy: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::matching::{MatchEvidence, MatchTier, Resolution};

    #[test]
    fn test_run_record_counts_bands_and_methods() {
        let mut run = MatchRun::start("run-1", "osha", "osha");
        run.record(&MatchResult::employer(
            "S1",
            "E1",
            "Acme",
            MatchTier::EinExact,
            Resolution::Direct,
            1.0,
            MatchEvidence::EinExact { ein: "123456789".into() },
        ));
        run.record(&MatchResult::ambiguous("S2", MatchTier::NameStateExact, vec!["E1".into(), "E2".into()], "tie"));
        run.record(&MatchResult::no_match("S3", vec![], vec![]));

        assert_eq!(run.total_source, 3);
        assert_eq!(run.total_matched, 1);
        assert_eq!(run.total_ambiguous, 1);
        assert_eq!(run.high_count, 1);
        assert_eq!(run.low_count, 1);
        assert_eq!(run.method_counts.get("EIN_EXACT"), Some(&1));
        assert_eq!(run.method_counts.get("NO_MATCH"), Some(&1));
        assert!((run.match_rate() - 1.0 / 3.0).abs() < 1e-9);

        run.finalize("abc".into());
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_failed_run_has_no_digest() {
        let mut run = MatchRun::start("run-2", "whd", "whd");
        run.fail();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
        assert!(run.results_digest.is_none());
        assert_eq!(RunStatus::parse(run.status.as_str()), RunStatus::Failed);
    }
}
