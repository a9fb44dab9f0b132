// src/clustering/canonical_groups.rs - Collapses duplicate reference rows into canonical groups
use chrono::{Months, NaiveDate, Utc};
use log::{debug, info};
use petgraph::unionfind::UnionFind;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;

use crate::matching::name::{is_signatory_pattern, normalize_location_key, token_set_ratio};
use crate::models::core::ReferenceEmployer;
use crate::models::stats_models::CanonicalGroup;

const DEFAULT_MIN_STATES: usize = 2;
const DEFAULT_FUZZY_MERGE_RATIO: f64 = 90.0;
const DEFAULT_RECENT_NOTICE_YEARS: u32 = 3;
/// Names at or below this many characters are too generic for the fuzzy post-merge.
const FUZZY_MIN_NAME_CHARS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct GrouperConfig {
    /// Distinct states a name needs before it may form a cross-state group.
    pub min_states: usize,
    /// Token-set ratio (0-100) an ungrouped row needs to join a group.
    pub fuzzy_merge_ratio: f64,
    pub recent_notice_years: u32,
    /// Reference date for the "recent notice" bonus.
    pub as_of: NaiveDate,
}

impl Default for GrouperConfig {
    fn default() -> Self {
        Self {
            min_states: DEFAULT_MIN_STATES,
            fuzzy_merge_ratio: DEFAULT_FUZZY_MERGE_RATIO,
            recent_notice_years: DEFAULT_RECENT_NOTICE_YEARS,
            as_of: Utc::now().date_naive(),
        }
    }
}

impl GrouperConfig {
    /// Reads `GROUPER_MIN_STATES`, `GROUPER_FUZZY_RATIO`,
    /// `GROUPER_RECENT_NOTICE_YEARS` and `GROUPER_AS_OF` (YYYY-MM-DD).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_states: env::var("GROUPER_MIN_STATES")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.min_states)
                .max(2),
            fuzzy_merge_ratio: env::var("GROUPER_FUZZY_RATIO")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.fuzzy_merge_ratio),
            recent_notice_years: env::var("GROUPER_RECENT_NOTICE_YEARS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.recent_notice_years),
            as_of: env::var("GROUPER_AS_OF")
                .ok()
                .and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok())
                .unwrap_or(defaults.as_of),
        }
    }

    pub fn log_config(&self) {
        info!("🧩 Canonical grouper configuration:");
        info!("   • min states for cross-state merge: {}", self.min_states);
        info!("   • fuzzy merge ratio: {:.1}", self.fuzzy_merge_ratio);
        info!(
            "   • recent notice window: {} years before {}",
            self.recent_notice_years, self.as_of
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupingStats {
    pub rows_considered: usize,
    pub signatory_excluded: usize,
    pub cross_state_groups: usize,
    pub single_state_groups: usize,
    pub fuzzy_absorbed: usize,
    pub grouped_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupingOutcome {
    pub groups: Vec<CanonicalGroup>,
    pub stats: GroupingStats,
}

impl GroupingOutcome {
    /// `employer_id -> (group_id, is_canonical_rep)` for every grouped row.
    pub fn assignments(&self) -> BTreeMap<&str, (i64, bool)> {
        let mut assignments = BTreeMap::new();
        for group in &self.groups {
            for member in &group.member_ids {
                assignments.insert(
                    member.as_str(),
                    (group.group_id, *member == group.canonical_employer_id),
                );
            }
        }
        assignments
    }
}

/// A group under construction: positions into the employer slice.
struct Draft {
    key: String,
    root: usize,
    absorbed: usize,
}

fn affiliation_key(employer: &ReferenceEmployer) -> Option<String> {
    employer
        .affiliation_code
        .as_deref()
        .map(|code| code.trim().to_uppercase())
        .filter(|code| !code.is_empty())
}

fn representative_score(employer: &ReferenceEmployer, config: &GrouperConfig) -> f64 {
    let mut score = 0.0;
    if !employer.is_historical {
        score += 100.0;
    }
    if !employer.exclude_from_counts {
        score += 50.0;
    }
    score += employer.unit_size.unwrap_or(0).max(0) as f64 / 100.0;

    let window_start = config
        .as_of
        .checked_sub_months(Months::new(config.recent_notice_years * 12))
        .unwrap_or(NaiveDate::MIN);
    if let Some(notice) = employer.latest_notice_date {
        if notice >= window_start && notice <= config.as_of {
            score += 10.0;
        }
    }
    score
}

/// Highest score wins; ties go to the earliest member.
fn pick_representative(members: &[usize], employers: &[ReferenceEmployer], config: &GrouperConfig) -> usize {
    let mut best = members[0];
    let mut best_score = representative_score(&employers[best], config);
    for &idx in &members[1..] {
        let score = representative_score(&employers[idx], config);
        if score > best_score {
            best = idx;
            best_score = score;
        }
    }
    best
}

/// Max unit size per affiliation (missing affiliation is its own bucket), summed.
pub fn consolidated_workers(members: &[&ReferenceEmployer]) -> i64 {
    let mut per_affiliation: HashMap<Option<String>, i64> = HashMap::new();
    for member in members {
        let size = member.unit_size.unwrap_or(0).max(0);
        let slot = per_affiliation.entry(affiliation_key(member)).or_insert(0);
        *slot = (*slot).max(size);
    }
    per_affiliation.values().sum()
}

fn states_of(members: &[usize], employers: &[ReferenceEmployer]) -> Vec<String> {
    members
        .iter()
        .filter_map(|&idx| normalize_location_key(employers[idx].state.as_deref()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Members of each draft in input order. Absorption only ever joins a
/// singleton to one draft, so each draft stays its own component.
fn draft_members(union_find: &UnionFind<usize>, drafts: &[Draft], len: usize) -> Vec<Vec<usize>> {
    let draft_of_root: HashMap<usize, usize> = drafts
        .iter()
        .enumerate()
        .map(|(draft_idx, draft)| (union_find.find(draft.root), draft_idx))
        .collect();
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); drafts.len()];
    for idx in 0..len {
        if let Some(&draft_idx) = draft_of_root.get(&union_find.find(idx)) {
            members[draft_idx].push(idx);
        }
    }
    members
}

/// Full rebuild over the reference population. Input order defines "earliest member".
pub fn build_canonical_groups(employers: &[ReferenceEmployer], config: &GrouperConfig) -> GroupingOutcome {
    let mut stats = GroupingStats {
        rows_considered: employers.len(),
        ..Default::default()
    };
    let employers: Vec<ReferenceEmployer> = employers
        .iter()
        .cloned()
        .map(|mut employer| {
            employer.ensure_normalized();
            employer
        })
        .collect();

    let mut by_name: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, employer) in employers.iter().enumerate() {
        if employer.is_signatory_pattern || is_signatory_pattern(&employer.employer_name) {
            stats.signatory_excluded += 1;
            continue;
        }
        if employer.name_aggressive.is_empty() {
            continue;
        }
        by_name.entry(employer.name_aggressive.as_str()).or_default().push(idx);
    }

    let mut union_find: UnionFind<usize> = UnionFind::new(employers.len());
    let mut drafts: Vec<Draft> = Vec::new();

    for (name, members) in &by_name {
        let states = states_of(members, &employers);
        let affiliations: BTreeSet<Option<String>> =
            members.iter().map(|&idx| affiliation_key(&employers[idx])).collect();
        let single_affiliation = affiliations.len() == 1 && affiliations.iter().all(Option::is_some);

        if states.len() >= config.min_states && single_affiliation {
            for &idx in &members[1..] {
                union_find.union(members[0], idx);
            }
            stats.cross_state_groups += 1;
            drafts.push(Draft {
                key: name.to_string(),
                root: members[0],
                absorbed: 0,
            });
            continue;
        }

        let mut by_state: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for &idx in members {
            if let Some(state) = normalize_location_key(employers[idx].state.as_deref()) {
                by_state.entry(state).or_default().push(idx);
            }
        }
        for bucket in by_state.values().filter(|bucket| bucket.len() >= 2) {
            for &idx in &bucket[1..] {
                union_find.union(bucket[0], idx);
            }
            stats.single_state_groups += 1;
            drafts.push(Draft {
                key: name.to_string(),
                root: bucket[0],
                absorbed: 0,
            });
        }
    }

    let pre_merge = draft_members(&union_find, &drafts, employers.len());
    let grouped: Vec<bool> = {
        let mut grouped = vec![false; employers.len()];
        for idx in pre_merge.iter().flatten() {
            grouped[*idx] = true;
        }
        grouped
    };

    // Fuzzy post-merge against the representatives as they stood before absorption.
    let targets: Vec<(usize, usize, Vec<String>)> = pre_merge
        .iter()
        .enumerate()
        .map(|(draft_idx, members)| {
            (
                draft_idx,
                pick_representative(members, &employers, config),
                states_of(members, &employers),
            )
        })
        .collect();
    for names in by_name.values() {
        for &idx in names {
            if grouped[idx] {
                continue;
            }
            let employer = &employers[idx];
            if employer.name_aggressive.chars().count() <= FUZZY_MIN_NAME_CHARS {
                continue;
            }
            let Some(state) = normalize_location_key(employer.state.as_deref()) else {
                continue;
            };

            let mut best: Option<(usize, f64)> = None;
            for (draft_idx, rep, states) in &targets {
                if !states.contains(&state) {
                    continue;
                }
                let score = token_set_ratio(&employer.name_aggressive, &employers[*rep].name_aggressive);
                if score >= config.fuzzy_merge_ratio && best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((*draft_idx, score));
                }
            }
            if let Some((draft_idx, score)) = best {
                debug!(
                    "Fuzzy-absorbed {} ('{}') into group '{}' at ratio {:.1}",
                    employer.employer_id, employer.name_aggressive, drafts[draft_idx].key, score
                );
                union_find.union(drafts[draft_idx].root, idx);
                drafts[draft_idx].absorbed += 1;
                stats.fuzzy_absorbed += 1;
            }
        }
    }

    let final_members = draft_members(&union_find, &drafts, employers.len());

    let mut groups: Vec<CanonicalGroup> = drafts
        .iter()
        .zip(final_members.iter())
        .map(|(draft, members)| {
            let rep = pick_representative(members, &employers, config);
            let states = states_of(members, &employers);
            let member_refs: Vec<&ReferenceEmployer> = members.iter().map(|&idx| &employers[idx]).collect();
            CanonicalGroup {
                group_id: 0,
                group_key: draft.key.clone(),
                canonical_employer_id: employers[rep].employer_id.clone(),
                canonical_name: employers[rep].employer_name.clone(),
                member_ids: members.iter().map(|&idx| employers[idx].employer_id.clone()).collect(),
                member_count: members.len(),
                consolidated_workers: consolidated_workers(&member_refs),
                is_cross_state: states.len() > 1,
                states,
                absorbed_by_fuzzy: draft.absorbed,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        a.group_key
            .cmp(&b.group_key)
            .then_with(|| a.states.first().cmp(&b.states.first()))
    });
    for (position, group) in groups.iter_mut().enumerate() {
        group.group_id = position as i64 + 1;
    }
    stats.grouped_rows = groups.iter().map(|group| group.member_count).sum();

    info!(
        "🧩 Canonical grouping: {} groups ({} cross-state, {} single-state), {} rows grouped, {} fuzzy-absorbed, {} signatory rows excluded",
        groups.len(),
        stats.cross_state_groups,
        stats.single_state_groups,
        stats.grouped_rows,
        stats.fuzzy_absorbed,
        stats.signatory_excluded
    );

    GroupingOutcome { groups, stats }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, name: &str, state: &str, affiliation: Option<&str>, size: i64) -> ReferenceEmployer {
        let mut employer = ReferenceEmployer::new(id, name, Some(state), None);
        employer.affiliation_code = affiliation.map(str::to_string);
        employer.unit_size = Some(size);
        employer
    }

    fn config() -> GrouperConfig {
        GrouperConfig {
            as_of: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            ..GrouperConfig::default()
        }
    }

    fn assert_group_invariant(outcome: &GroupingOutcome) {
        let mut seen = BTreeSet::new();
        for group in &outcome.groups {
            assert!(group.member_ids.contains(&group.canonical_employer_id));
            assert_eq!(group.member_ids.len(), group.member_count);
            for member in &group.member_ids {
                assert!(seen.insert(member.clone()), "{} is in two groups", member);
            }
        }
        let reps = outcome.assignments().values().filter(|(_, is_rep)| *is_rep).count();
        assert_eq!(reps, outcome.groups.len());
    }

    #[test]
    fn test_consolidated_size_takes_max_per_affiliation() {
        let a1 = row("E1", "Acme", "CA", Some("A"), 50);
        let a2 = row("E2", "Acme", "CA", Some("A"), 80);
        let b = row("E3", "Acme", "CA", Some("B"), 30);
        assert_eq!(consolidated_workers(&[&a1, &a2, &b]), 110);

        let unaffiliated = row("E4", "Acme", "CA", None, 25);
        assert_eq!(consolidated_workers(&[&a1, &a2, &b, &unaffiliated]), 135);
    }

    #[test]
    fn test_cross_state_group() {
        let employers = vec![
            row("E1", "Acme Foods", "NY", Some("IBT"), 40),
            row("E2", "Acme Foods Inc", "NJ", Some("IBT"), 60),
            row("E3", "ACME FOODS", "CT", Some("ibt"), 10),
        ];
        let outcome = build_canonical_groups(&employers, &config());
        assert_eq!(outcome.groups.len(), 1);
        let group = &outcome.groups[0];
        assert_eq!(group.states, vec!["CT", "NJ", "NY"]);
        assert!(group.is_cross_state);
        assert_eq!(group.member_count, 3);
        assert_eq!(group.consolidated_workers, 60);
        assert_eq!(group.canonical_employer_id, "E2");
        assert_eq!(group.group_id, 1);
        assert_group_invariant(&outcome);
    }

    #[test]
    fn test_mixed_affiliations_stay_per_state() {
        let employers = vec![
            row("E1", "Acme Foods", "NY", Some("IBT"), 40),
            row("E2", "Acme Foods", "NY", Some("UFCW"), 20),
            row("E3", "Acme Foods", "NJ", Some("IBT"), 60),
        ];
        let outcome = build_canonical_groups(&employers, &config());
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(outcome.groups[0].states, vec!["NY"]);
        assert_eq!(outcome.groups[0].member_ids, vec!["E1", "E2"]);
        assert!(!outcome.groups[0].is_cross_state);
        assert_eq!(outcome.groups[0].consolidated_workers, 60);
        assert_group_invariant(&outcome);
    }

    #[test]
    fn test_representative_scoring() {
        let mut historical = row("E1", "Globex", "TX", None, 5_000);
        historical.is_historical = true;
        let mut excluded = row("E2", "Globex", "TX", None, 10);
        excluded.exclude_from_counts = true;
        let plain = row("E3", "Globex", "TX", None, 10);
        let mut recent = row("E4", "Globex", "TX", None, 10);
        recent.latest_notice_date = NaiveDate::from_ymd_opt(2023, 1, 15);

        let outcome = build_canonical_groups(&[historical, excluded, plain.clone(), recent], &config());
        assert_eq!(outcome.groups[0].canonical_employer_id, "E4");

        let twin = row("E5", "Globex", "TX", None, 10);
        let outcome = build_canonical_groups(&[plain, twin], &config());
        assert_eq!(outcome.groups[0].canonical_employer_id, "E3");
    }

    #[test]
    fn test_old_notice_earns_no_bonus() {
        let mut stale = row("E1", "Initech", "OR", None, 10);
        stale.latest_notice_date = NaiveDate::from_ymd_opt(2015, 1, 1);
        let bigger = row("E2", "Initech", "OR", None, 500);
        let outcome = build_canonical_groups(&[stale, bigger], &config());
        assert_eq!(outcome.groups[0].canonical_employer_id, "E2");
    }

    #[test]
    fn test_signatory_rows_are_excluded() {
        let mut flagged = row("E1", "Acme", "CA", None, 10);
        flagged.is_signatory_pattern = true;
        let employers = vec![
            flagged,
            row("E2", "Acme", "CA", None, 10),
            row("E3", "All Signatory Contractors", "CA", None, 10),
            row("E4", "All Signatory Contractors", "CA", None, 10),
        ];
        let outcome = build_canonical_groups(&employers, &config());
        assert!(outcome.groups.is_empty());
        assert_eq!(outcome.stats.signatory_excluded, 3);
    }

    #[test]
    fn test_fuzzy_post_merge_threshold() {
        let employers = vec![
            row("E1", "Riverside Medical Center", "NY", None, 100),
            row("E2", "Riverside Medical Center", "NY", None, 50),
            row("E3", "Riverside Medical Center East", "NY", None, 20),
            row("E4", "Riverside Medical Center East", "NJ", None, 20),
            row("E5", "Riverside Dental", "NY", None, 5),
        ];
        let outcome = build_canonical_groups(&employers, &config());
        assert_eq!(outcome.groups.len(), 1);
        let group = &outcome.groups[0];
        assert_eq!(group.member_ids, vec!["E1", "E2", "E3"]);
        assert_eq!(group.absorbed_by_fuzzy, 1);
        assert_eq!(group.consolidated_workers, 100);

        let strict = GrouperConfig {
            fuzzy_merge_ratio: 101.0,
            ..config()
        };
        let outcome = build_canonical_groups(&employers, &strict);
        assert_eq!(outcome.groups[0].member_ids, vec!["E1", "E2"]);
        assert_eq!(outcome.stats.fuzzy_absorbed, 0);
    }

    #[test]
    fn test_group_ids_follow_key_then_state() {
        let employers = vec![
            row("E1", "Zeta Works", "WA", None, 1),
            row("E2", "Zeta Works", "WA", None, 1),
            row("E3", "Alpha Works", "TX", None, 1),
            row("E4", "Alpha Works", "TX", None, 1),
            row("E5", "Alpha Works", "AK", None, 1),
            row("E6", "Alpha Works", "AK", None, 1),
        ];
        let outcome = build_canonical_groups(&employers, &config());
        let keys: Vec<(i64, &str, &str)> = outcome
            .groups
            .iter()
            .map(|g| (g.group_id, g.group_key.as_str(), g.states[0].as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![(1, "alpha works", "AK"), (2, "alpha works", "TX"), (3, "zeta works", "WA")]
        );
        assert_group_invariant(&outcome);
        assert_eq!(build_canonical_groups(&employers, &config()), outcome);
    }
}
