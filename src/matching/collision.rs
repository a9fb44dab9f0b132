// src/matching/collision.rs - Settles multi-candidate hits inside one tier
use log::debug;

use crate::matching::index::{MatcherContext, PreparedSource};
use crate::matching::name::{name_similarity, normalize_location_key};
use crate::models::matching::ProbabilisticDecision;

/// How a collision ended. `Ambiguous` is a terminal outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Disambiguation {
    City {
        winner: usize,
        candidates_before: usize,
    },
    Probabilistic {
        winner: usize,
        candidates_scored: usize,
        decision: ProbabilisticDecision,
    },
    Ambiguous {
        candidate_ids: Vec<String>,
        reason: String,
    },
}

/// Resolves N >= 2 candidates: city narrowing first, then the linkage model
/// (2..=max candidates, clear margin over the runner-up, name floor), else ambiguity.
pub fn disambiguate(context: &MatcherContext, source: &PreparedSource<'_>, candidates: &[usize]) -> Disambiguation {
    let config = context.config();

    let narrowed: Vec<usize> = match &source.city {
        Some(city) => candidates
            .iter()
            .copied()
            .filter(|&idx| normalize_location_key(context.employer(idx).city.as_deref()).as_ref() == Some(city))
            .collect(),
        None => Vec::new(),
    };

    if narrowed.len() == 1 {
        return Disambiguation::City {
            winner: narrowed[0],
            candidates_before: candidates.len(),
        };
    }

    let pool: &[usize] = if narrowed.len() >= 2 { &narrowed } else { candidates };

    let reason = match context.model() {
        None => "no city winner and no linkage model loaded".to_string(),
        Some(_) if pool.len() > config.max_probabilistic_candidates => format!(
            "{} candidates exceed the probabilistic limit of {}",
            pool.len(),
            config.max_probabilistic_candidates
        ),
        Some(model) => {
            let mut scored: Vec<(usize, _)> = pool
                .iter()
                .map(|&idx| (idx, model.score(source, context.employer(idx))))
                .collect();
            scored.sort_by(|a, b| b.1.probability.total_cmp(&a.1.probability));

            let (winner, top) = scored[0].clone();
            let runner_up = scored[1].1.probability;
            let lead = top.probability - runner_up;
            let name_sim = name_similarity(&source.name_standard, &context.employer(winner).name_standard);

            if lead + f64::EPSILON < config.ambiguity_margin {
                format!(
                    "model too close to call: {:.3} vs {:.3} (margin {:.2})",
                    top.probability, runner_up, config.ambiguity_margin
                )
            } else if name_sim < config.disambiguation_name_floor {
                format!(
                    "model winner name similarity {:.3} below floor {:.2}",
                    name_sim, config.disambiguation_name_floor
                )
            } else {
                debug!(
                    "Collision for {} settled by model: {} at {:.3} (runner-up {:.3})",
                    source.id(),
                    context.employer(winner).employer_id,
                    top.probability,
                    runner_up
                );
                return Disambiguation::Probabilistic {
                    winner,
                    candidates_scored: scored.len(),
                    decision: top.into_decision(Some(runner_up), name_sim),
                };
            }
        }
    };

    Disambiguation::Ambiguous {
        candidate_ids: candidates
            .iter()
            .map(|&idx| context.employer(idx).employer_id.clone())
            .collect(),
        reason,
    }
}
