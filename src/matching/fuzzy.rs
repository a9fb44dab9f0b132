// src/matching/fuzzy.rs - Batched probabilistic and trigram passes for cascade misses
use log::{debug, info};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::matching::index::{MatcherContext, PreparedSource};
use crate::matching::name::{min_shared_trigrams, name_similarity, trigram_jaccard, trigram_set};
use crate::models::core::SourceRecord;
use crate::models::matching::{MatchEvidence, MatchResult, MatchTier, Resolution};
use crate::models::stats_models::MatchingStats;

/// Overlap a reference row needs before the linkage model scores it.
const PROBABILISTIC_MIN_SHARED_TRIGRAMS: usize = 2;

/// Best candidate seen so far; a tie at the top keeps the lowest employer id.
struct Best {
    idx: usize,
    score: f64,
}

fn better(context: &MatcherContext, candidate: usize, score: f64, current: Option<&Best>) -> bool {
    match current {
        None => true,
        Some(best) => match score.total_cmp(&best.score) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => context.employer(candidate).employer_id < context.employer(best.idx).employer_id,
        },
    }
}

pub struct FuzzyMatcher<'a> {
    context: &'a MatcherContext,
}

impl<'a> FuzzyMatcher<'a> {
    pub fn new(context: &'a MatcherContext) -> Self {
        Self { context }
    }

    /// Runs both passes over `records` chunk by chunk. The output is aligned
    /// with the input: `None` where neither pass found a target.
    pub fn match_records(&self, records: &[&SourceRecord], stats: &mut MatchingStats) -> Vec<Option<MatchResult>> {
        let batch_size = self.context.config().fuzzy_batch_size.max(1);
        let total_chunks = records.len().div_ceil(batch_size);
        let mut results = Vec::with_capacity(records.len());

        for (chunk_idx, chunk) in records.chunks(batch_size).enumerate() {
            stats.fuzzy_candidates += chunk.len();
            let before = results.len();
            for record in chunk {
                results.push(self.match_one(record, stats));
            }
            let found = results[before..].iter().filter(|r| r.is_some()).count();
            info!(
                "🔍 Fuzzy chunk {}/{}: {} of {} records matched",
                chunk_idx + 1,
                total_chunks,
                found,
                chunk.len()
            );
        }
        results
    }

    fn match_one(&self, record: &SourceRecord, stats: &mut MatchingStats) -> Option<MatchResult> {
        let source = PreparedSource::new(record);
        // Both passes compare within one state only, and only against rows
        // whose fuzzy name shares trigrams with the source.
        let state = source.state.clone()?;
        let source_trigrams = trigram_set(&source.name_fuzzy);
        let candidates = self.context.trigram_candidates(&state, &source_trigrams, 1);
        if candidates.is_empty() {
            return None;
        }

        if let Some(result) = self.probabilistic(&source, &candidates) {
            stats.probabilistic_matches += 1;
            return Some(result);
        }
        let result = self.trigram(&source, &state, &source_trigrams, &candidates)?;
        stats.trigram_matches += 1;
        Some(result)
    }

    fn probabilistic(&self, source: &PreparedSource<'_>, candidates: &[(usize, usize)]) -> Option<MatchResult> {
        let model = self.context.model()?;
        let config = self.context.config();

        let mut best: Option<Best> = None;
        let mut best_score = None;
        let mut runner_up: Option<f64> = None;
        let mut scored = 0usize;

        for &(idx, shared) in candidates {
            if shared < PROBABILISTIC_MIN_SHARED_TRIGRAMS {
                continue;
            }
            let employer = self.context.employer(idx);
            let name_sim = name_similarity(&source.name_standard, &employer.name_standard);
            if name_sim < config.probabilistic_name_floor {
                continue;
            }
            scored += 1;
            let score = model.score(source, employer);
            if better(self.context, idx, score.probability, best.as_ref()) {
                if let Some(previous) = &best {
                    runner_up = Some(runner_up.map_or(previous.score, |r: f64| r.max(previous.score)));
                }
                best = Some(Best {
                    idx,
                    score: score.probability,
                });
                best_score = Some((score, name_sim));
            } else {
                runner_up = Some(runner_up.map_or(score.probability, |r| r.max(score.probability)));
            }
        }

        let best = best?;
        let (score, name_sim) = best_score?;
        if score.probability < config.probabilistic_threshold {
            debug!(
                "Probabilistic best for {} at {:.3} is under threshold {:.2}",
                source.id(),
                score.probability,
                config.probabilistic_threshold
            );
            return None;
        }

        let employer = self.context.employer(best.idx);
        let probability = score.probability;
        Some(MatchResult::employer(
            source.id(),
            &employer.employer_id,
            &employer.employer_name,
            MatchTier::Probabilistic,
            Resolution::Direct,
            probability,
            MatchEvidence::Probabilistic {
                decision: score.into_decision(runner_up, name_sim),
                candidates_scored: scored,
            },
        ))
    }

    fn trigram(
        &self,
        source: &PreparedSource<'_>,
        state: &str,
        source_trigrams: &HashSet<String>,
        candidates: &[(usize, usize)],
    ) -> Option<MatchResult> {
        let threshold = self.context.config().trigram_threshold;
        let min_shared = min_shared_trigrams(threshold, source_trigrams.len());
        let mut best: Option<Best> = None;

        for &(idx, shared) in candidates {
            if shared < min_shared {
                continue;
            }
            let similarity = trigram_jaccard(shared, source_trigrams.len(), self.context.fuzzy_trigram_count(idx));
            if similarity >= threshold && better(self.context, idx, similarity, best.as_ref()) {
                best = Some(Best { idx, score: similarity });
            }
        }

        let best = best?;
        let employer = self.context.employer(best.idx);
        Some(MatchResult::employer(
            source.id(),
            &employer.employer_id,
            &employer.employer_name,
            MatchTier::TrigramFuzzy,
            Resolution::Direct,
            best.score,
            MatchEvidence::Trigram {
                similarity: best.score,
                source_name_fuzzy: source.name_fuzzy.clone(),
                target_name_fuzzy: employer.name_fuzzy.clone(),
                state: state.to_string(),
            },
        ))
    }
}
