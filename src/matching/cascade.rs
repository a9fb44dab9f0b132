// src/matching/cascade.rs - Tiered "best match wins" resolution for one source record
use anyhow::Result;
use log::{debug, warn};

use crate::matching::collision::{disambiguate, Disambiguation};
use crate::matching::index::{MatcherContext, PreparedSource};
use crate::models::core::SourceRecord;
use crate::models::matching::{MatchEvidence, MatchResult, MatchTier, Resolution};
use crate::models::stats_models::MatchingStats;

/// What an index lookup produced for one tier.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    /// The record lacks a field this tier needs; not an error.
    Unavailable(&'static str),
    Hits(Vec<usize>),
}

pub type TierLookup = fn(&MatcherContext, &PreparedSource<'_>) -> Result<LookupOutcome>;

#[derive(Clone, Copy)]
pub struct TierSpec {
    pub tier: MatchTier,
    pub lookup: TierLookup,
}

fn lookup_ein(context: &MatcherContext, source: &PreparedSource<'_>) -> Result<LookupOutcome> {
    let Some(ein) = &source.ein else {
        return Ok(LookupOutcome::Unavailable("no EIN with at least 8 digits"));
    };
    Ok(LookupOutcome::Hits(context.lookup_ein(ein).into_iter().collect()))
}

fn lookup_name_city_state(context: &MatcherContext, source: &PreparedSource<'_>) -> Result<LookupOutcome> {
    match (&source.city, &source.state) {
        (Some(city), Some(state)) if !source.name_standard.is_empty() => Ok(LookupOutcome::Hits(
            context.lookup_name_city_state(&source.name_standard, city, state).to_vec(),
        )),
        _ => Ok(LookupOutcome::Unavailable("requires name, city and state")),
    }
}

fn lookup_name_state(context: &MatcherContext, source: &PreparedSource<'_>) -> Result<LookupOutcome> {
    match &source.state {
        Some(state) if !source.name_standard.is_empty() => Ok(LookupOutcome::Hits(
            context.lookup_name_state(&source.name_standard, state).to_vec(),
        )),
        _ => Ok(LookupOutcome::Unavailable("requires name and state")),
    }
}

fn lookup_aggressive_state(context: &MatcherContext, source: &PreparedSource<'_>) -> Result<LookupOutcome> {
    match &source.state {
        Some(state) if !source.name_aggressive.is_empty() => Ok(LookupOutcome::Hits(
            context.lookup_aggressive_state(&source.name_aggressive, state).to_vec(),
        )),
        _ => Ok(LookupOutcome::Unavailable("requires name and state")),
    }
}

/// The deterministic tiers, most specific first.
pub fn default_tiers() -> Vec<TierSpec> {
    MatchTier::CASCADE
        .iter()
        .map(|&tier| TierSpec {
            tier,
            lookup: match tier {
                MatchTier::EinExact => lookup_ein,
                MatchTier::NameCityStateExact => lookup_name_city_state,
                MatchTier::NameStateExact => lookup_name_state,
                _ => lookup_aggressive_state,
            },
        })
        .collect()
}

fn index_evidence(
    tier: MatchTier,
    source: &PreparedSource<'_>,
    candidates_considered: usize,
    resolved_city: Option<String>,
) -> MatchEvidence {
    let state = source.state.clone().unwrap_or_default();
    match tier {
        MatchTier::EinExact => MatchEvidence::EinExact {
            ein: source.ein.clone().unwrap_or_default(),
        },
        MatchTier::NameCityStateExact => MatchEvidence::NameCityStateExact {
            name_standard: source.name_standard.clone(),
            city: source.city.clone().unwrap_or_default(),
            state,
            candidates_considered,
        },
        MatchTier::NameStateExact => MatchEvidence::NameStateExact {
            name_standard: source.name_standard.clone(),
            state,
            candidates_considered,
            resolved_city,
        },
        _ => MatchEvidence::AggressiveState {
            name_aggressive: source.name_aggressive.clone(),
            state,
            candidates_considered,
            resolved_city,
        },
    }
}

fn outranks(candidate: &MatchResult, current: Option<&MatchResult>) -> bool {
    match current {
        None => true,
        Some(current) => {
            candidate.tier_rank > current.tier_rank
                || (candidate.tier_rank == current.tier_rank && candidate.score > current.score)
        }
    }
}

/// Evaluates every applicable tier for a record and keeps the most specific
/// outcome. Collisions go through the disambiguator; a tier whose collision
/// stays unresolved contributes nothing, so a lower tier can still win.
pub struct CascadeMatcher<'a> {
    context: &'a MatcherContext,
    tiers: Vec<TierSpec>,
}

impl<'a> CascadeMatcher<'a> {
    pub fn new(context: &'a MatcherContext) -> Self {
        Self::with_tiers(context, default_tiers())
    }

    pub fn with_tiers(context: &'a MatcherContext, tiers: Vec<TierSpec>) -> Self {
        Self { context, tiers }
    }

    /// Always returns exactly one result: a match, an ambiguous non-decision
    /// or a no-match carrying the tiers that were tried.
    pub fn match_record(&self, record: &SourceRecord, stats: &mut MatchingStats) -> MatchResult {
        let source = PreparedSource::new(record);
        stats.records_processed += 1;

        let mut best: Option<MatchResult> = None;
        let mut best_ambiguous: Option<MatchResult> = None;
        let mut attempted = Vec::new();
        let mut unavailable = Vec::new();

        for spec in &self.tiers {
            let hits = match (spec.lookup)(self.context, &source) {
                Err(e) => {
                    warn!("[{}] Tier failed for source {}; skipping tier: {:#}", spec.tier, source.id(), e);
                    stats.tier_errors += 1;
                    continue;
                }
                Ok(LookupOutcome::Unavailable(reason)) => {
                    unavailable.push(format!("{}: {}", spec.tier, reason));
                    continue;
                }
                Ok(LookupOutcome::Hits(hits)) => hits,
            };
            attempted.push(spec.tier);

            let hits = self.context.collapse_canonical(&hits);
            let outcome = match hits.len() {
                0 => continue,
                1 => {
                    let employer = self.context.employer(hits[0]);
                    MatchResult::employer(
                        source.id(),
                        &employer.employer_id,
                        &employer.employer_name,
                        spec.tier,
                        Resolution::Direct,
                        spec.tier.base_score(),
                        index_evidence(spec.tier, &source, 1, None),
                    )
                }
                n => match disambiguate(self.context, &source, &hits) {
                    Disambiguation::City { winner, .. } => {
                        stats.collisions_resolved += 1;
                        let employer = self.context.employer(winner);
                        MatchResult::employer(
                            source.id(),
                            &employer.employer_id,
                            &employer.employer_name,
                            spec.tier,
                            Resolution::CityResolved,
                            spec.tier.base_score(),
                            index_evidence(spec.tier, &source, n, source.city.clone()),
                        )
                    }
                    Disambiguation::Probabilistic {
                        winner,
                        candidates_scored,
                        decision,
                    } => {
                        stats.collisions_resolved += 1;
                        let employer = self.context.employer(winner);
                        let probability = decision.probability;
                        MatchResult::employer(
                            source.id(),
                            &employer.employer_id,
                            &employer.employer_name,
                            spec.tier,
                            Resolution::ProbabilisticResolved,
                            probability,
                            MatchEvidence::CollisionResolvedByModel {
                                tier: spec.tier,
                                candidates_considered: candidates_scored,
                                decision,
                            },
                        )
                    }
                    Disambiguation::Ambiguous { candidate_ids, reason } => {
                        stats.collisions_ambiguous += 1;
                        debug!("[{}] {} candidates for {} left ambiguous: {}", spec.tier, n, source.id(), reason);
                        let ambiguous = MatchResult::ambiguous(source.id(), spec.tier, candidate_ids, &reason);
                        if outranks(&ambiguous, best_ambiguous.as_ref()) {
                            best_ambiguous = Some(ambiguous);
                        }
                        continue;
                    }
                },
            };

            if outranks(&outcome, best.as_ref()) {
                best = Some(outcome);
            }
        }

        if let Some(result) = best {
            stats.cascade_matches += 1;
            return result;
        }
        if let Some(ambiguous) = best_ambiguous {
            return ambiguous;
        }
        MatchResult::no_match(source.id(), attempted, unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::ReferenceEmployer;
    use crate::models::matching::{ConfidenceBand, MatchTarget, AMBIGUOUS_TARGET};
    use crate::utils::match_config::MatchConfig;
    use anyhow::anyhow;

    fn reference() -> Vec<ReferenceEmployer> {
        let mut ein_holder = ReferenceEmployer::new("R-EIN", "Zenith Holdings", Some("TX"), Some("Austin"));
        ein_holder.ein = Some("12-3456789".into());
        vec![
            ein_holder,
            ReferenceEmployer::new("R-SF", "Acme", Some("CA"), Some("San Francisco")),
            ReferenceEmployer::new("R-SJ", "Acme", Some("CA"), Some("San Jose")),
            ReferenceEmployer::new("R-GLOBEX", "Globex Corporation", Some("NY"), Some("Albany")),
            ReferenceEmployer::new("R-ST1", "St. Mary's Hospital", Some("MN"), Some("Rochester")),
            ReferenceEmployer::new("R-ST2", "Saint Mary Hosp", Some("MN"), Some("Duluth")),
            ReferenceEmployer::new("R-INITECH", "Initech", Some("OR"), Some("Portland")),
            ReferenceEmployer::new("R-INITECH2", "Initech", Some("OR"), Some("Salem")),
        ]
    }

    fn context() -> MatcherContext {
        MatcherContext::build(reference(), None, MatchConfig::default())
    }

    fn target_id(result: &MatchResult) -> Option<&str> {
        result.target_id()
    }

    #[test]
    fn test_ein_collision_scenario() {
        let ctx = context();
        let matcher = CascadeMatcher::new(&ctx);
        let mut stats = MatchingStats::default();

        let first = SourceRecord::new("S1", "Some Other Name").with_ein("123456789");
        let second = SourceRecord::new("S2", "Zenith").with_ein("12-3456789").with_state("TX");

        let r1 = matcher.match_record(&first, &mut stats);
        let r2 = matcher.match_record(&second, &mut stats);
        for result in [&r1, &r2] {
            assert_eq!(target_id(result), Some("R-EIN"));
            assert_eq!(result.tier, Some(MatchTier::EinExact));
            assert_eq!(result.score, 1.0);
            assert_eq!(result.method(), "EIN_EXACT");
        }
    }

    #[test]
    fn test_ein_beats_name_regardless_of_tier_order() {
        let ctx = context();
        let mut reversed = default_tiers();
        reversed.reverse();
        let matcher = CascadeMatcher::with_tiers(&ctx, reversed);
        let mut stats = MatchingStats::default();

        // Name+city+state points at Globex, EIN points at Zenith.
        let record = SourceRecord::new("S1", "Globex Corp")
            .with_state("NY")
            .with_city("Albany")
            .with_ein("123456789");
        let result = matcher.match_record(&record, &mut stats);
        assert_eq!(target_id(&result), Some("R-EIN"));
        assert_eq!(result.tier_rank, 100);
    }

    #[test]
    fn test_city_disambiguation_scenario() {
        let ctx = context();
        let matcher = CascadeMatcher::new(&ctx);
        let mut stats = MatchingStats::default();

        let record = SourceRecord::new("S1", "Acme").with_state("CA").with_city("San Jose");
        let result = matcher.match_record(&record, &mut stats);

        // Name+city+state hits the San Jose row directly.
        assert_eq!(target_id(&result), Some("R-SJ"));
        assert_eq!(result.method(), "NAME_CITY_STATE_EXACT");

        // Without the city tier, name+state collides and city narrowing resolves it.
        let tiers: Vec<TierSpec> = default_tiers()
            .into_iter()
            .filter(|spec| spec.tier != MatchTier::NameCityStateExact)
            .collect();
        let matcher = CascadeMatcher::with_tiers(&ctx, tiers);
        let mut stats = MatchingStats::default();
        let result = matcher.match_record(&record, &mut stats);
        assert_eq!(target_id(&result), Some("R-SJ"));
        assert_eq!(result.method(), "NAME_STATE_EXACT_CITY_RESOLVED");
        assert_eq!(result.score, 0.90);
        assert_eq!(result.confidence_band, ConfidenceBand::High);
        assert_eq!(stats.collisions_resolved, 2);
    }

    #[test]
    fn test_no_silent_tie() {
        let ctx = context();
        let matcher = CascadeMatcher::new(&ctx);
        let mut stats = MatchingStats::default();

        let record = SourceRecord::new("S1", "Acme").with_state("CA");
        let result = matcher.match_record(&record, &mut stats);
        assert_eq!(result.target, MatchTarget::Ambiguous);
        assert_eq!(target_id(&result), Some(AMBIGUOUS_TARGET));
        assert_eq!(result.confidence_band, ConfidenceBand::Low);
        assert_eq!(result.method(), "NAME_STATE_EXACT_AMBIGUOUS");
        match &result.evidence {
            MatchEvidence::Ambiguous { candidate_ids, .. } => {
                assert_eq!(candidate_ids, &vec!["R-SF".to_string(), "R-SJ".to_string()]);
            }
            other => panic!("unexpected evidence {:?}", other),
        }
        assert_eq!(stats.collisions_ambiguous, 2);
        assert_eq!(stats.cascade_matches, 0);
    }

    #[test]
    fn test_unique_hit_beats_ambiguous_lower_tier() {
        let mut employers = reference();
        employers.push(ReferenceEmployer::new("R-WIDGET", "The Widget Works Co", Some("WA"), Some("Seattle")));
        employers.push(ReferenceEmployer::new("R-WIDGET-A", "Widget Works", Some("WA"), Some("Tacoma")));
        employers.push(ReferenceEmployer::new("R-WIDGET-B", "Widget Works", Some("WA"), Some("Spokane")));
        let ctx = MatcherContext::build(employers, None, MatchConfig::default());
        let matcher = CascadeMatcher::new(&ctx);
        let mut stats = MatchingStats::default();

        // name_standard "widget works" collides in WA; aggressive "widget works" has three rows.
        let record = SourceRecord::new("S1", "Widget Works").with_state("WA");
        let result = matcher.match_record(&record, &mut stats);
        assert!(result.is_ambiguous());

        // "the widget works" has a unique standard form, so name+state wins outright.
        let record = SourceRecord::new("S2", "The Widget Works").with_state("WA");
        let result = matcher.match_record(&record, &mut stats);
        assert_eq!(target_id(&result), Some("R-WIDGET"));
        assert_eq!(result.tier, Some(MatchTier::NameStateExact));
    }

    #[test]
    fn test_aggressive_tier_match() {
        let ctx = context();
        let matcher = CascadeMatcher::new(&ctx);
        let mut stats = MatchingStats::default();

        let record = SourceRecord::new("S1", "Globex Corp.").with_state("ny");
        let result = matcher.match_record(&record, &mut stats);
        assert_eq!(target_id(&result), Some("R-GLOBEX"));
        assert_eq!(result.tier, Some(MatchTier::NameStateExact));

        let record = SourceRecord::new("S2", "The Globex Co").with_state("NY");
        let result = matcher.match_record(&record, &mut stats);
        assert_eq!(target_id(&result), Some("R-GLOBEX"));
        assert_eq!(result.tier, Some(MatchTier::AggressiveState));
        assert_eq!(result.score, 0.75);
        assert_eq!(result.confidence_band, ConfidenceBand::Medium);
    }

    #[test]
    fn test_no_match_lists_tiers() {
        let ctx = context();
        let matcher = CascadeMatcher::new(&ctx);
        let mut stats = MatchingStats::default();

        let record = SourceRecord::new("S1", "Nobody Here").with_state("CA");
        let result = matcher.match_record(&record, &mut stats);
        assert_eq!(result.target, MatchTarget::None);
        match result.evidence {
            MatchEvidence::NoMatch {
                tiers_attempted,
                tiers_unavailable,
            } => {
                assert_eq!(tiers_attempted, vec![MatchTier::NameStateExact, MatchTier::AggressiveState]);
                assert_eq!(tiers_unavailable.len(), 2);
            }
            other => panic!("unexpected evidence {:?}", other),
        }
    }

    #[test]
    fn test_failing_tier_is_skipped() {
        let ctx = context();
        let mut tiers = default_tiers();
        tiers[0].lookup = |_, _| Err(anyhow!("transient lookup failure"));
        let matcher = CascadeMatcher::with_tiers(&ctx, tiers);
        let mut stats = MatchingStats::default();

        let record = SourceRecord::new("S1", "Globex").with_state("NY").with_ein("123456789");
        let result = matcher.match_record(&record, &mut stats);
        assert_eq!(stats.tier_errors, 1);
        assert_eq!(target_id(&result), Some("R-GLOBEX"));
    }

    #[test]
    fn test_canonical_group_members_do_not_collide() {
        let mut employers = reference();
        for employer in employers.iter_mut() {
            if employer.employer_id.starts_with("R-INITECH") {
                employer.canonical_group_id = Some(1);
                employer.is_canonical_rep = employer.employer_id == "R-INITECH2";
            }
        }
        let ctx = MatcherContext::build(employers, None, MatchConfig::default());
        let matcher = CascadeMatcher::new(&ctx);
        let mut stats = MatchingStats::default();

        let record = SourceRecord::new("S1", "Initech").with_state("OR");
        let result = matcher.match_record(&record, &mut stats);
        assert_eq!(target_id(&result), Some("R-INITECH2"));
        assert_eq!(result.method(), "NAME_STATE_EXACT");
        assert_eq!(stats.collisions_ambiguous, 0);
    }

    #[test]
    fn test_matching_is_idempotent() {
        let ctx = context();
        let matcher = CascadeMatcher::new(&ctx);
        let records = vec![
            SourceRecord::new("S1", "Acme").with_state("CA"),
            SourceRecord::new("S2", "Acme").with_state("CA").with_city("San Jose"),
            SourceRecord::new("S3", "Initech").with_state("OR"),
        ];
        let run = |matcher: &CascadeMatcher| {
            let mut stats = MatchingStats::default();
            records
                .iter()
                .map(|r| matcher.match_record(r, &mut stats))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(&matcher), run(&matcher));
    }
}
