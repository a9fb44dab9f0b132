// src/matching/index.rs - In-memory lookup tables over the reference population
use log::{debug, info};
use std::collections::{HashMap, HashSet};

use crate::matching::name::{
    normalize_address, normalize_aggressive, normalize_ein, normalize_fuzzy, normalize_location_key,
    normalize_naics, normalize_standard, normalize_zip, trigram_set,
};
use crate::matching::probabilistic::LinkageModel;
use crate::models::core::{ReferenceEmployer, SourceRecord};
use crate::utils::match_config::MatchConfig;

/// A source record with every key the tiers look up, computed once.
#[derive(Debug, Clone)]
pub struct PreparedSource<'a> {
    pub record: &'a SourceRecord,
    pub name_standard: String,
    pub name_aggressive: String,
    pub name_fuzzy: String,
    pub state: Option<String>,
    pub city: Option<String>,
    pub ein: Option<String>,
    pub zip: Option<String>,
    pub naics: Option<String>,
    pub address: Option<String>,
}

impl<'a> PreparedSource<'a> {
    pub fn new(record: &'a SourceRecord) -> Self {
        Self {
            record,
            name_standard: normalize_standard(&record.name),
            name_aggressive: normalize_aggressive(&record.name),
            name_fuzzy: normalize_fuzzy(&record.name),
            state: normalize_location_key(record.state.as_deref()),
            city: normalize_location_key(record.city.as_deref()),
            ein: normalize_ein(record.ein.as_deref()),
            zip: normalize_zip(record.zip.as_deref()),
            naics: normalize_naics(record.naics.as_deref()),
            address: normalize_address(record.street_address.as_deref()),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }
}

/// Key and collision counts per index; diagnostic only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStats {
    pub employers: usize,
    pub ein_keys: usize,
    pub ein_collisions: usize,
    pub name_state_keys: usize,
    pub name_state_collisions: usize,
    pub name_city_state_keys: usize,
    pub name_city_state_collisions: usize,
    pub aggressive_state_keys: usize,
    pub aggressive_state_collisions: usize,
    pub trigram_keys: usize,
    pub grouped_employers: usize,
}

impl IndexStats {
    pub fn log_summary(&self) {
        info!("🗂️  Reference indexes built over {} employers ({} in canonical groups)", self.employers, self.grouped_employers);
        info!("   • ein_index: {} keys, {} duplicate EINs ignored", self.ein_keys, self.ein_collisions);
        info!(
            "   • name_state_index: {} keys, {} with collisions",
            self.name_state_keys, self.name_state_collisions
        );
        info!(
            "   • name_city_state_index: {} keys, {} with collisions",
            self.name_city_state_keys, self.name_city_state_collisions
        );
        info!(
            "   • aggressive_state_index: {} keys, {} with collisions",
            self.aggressive_state_keys, self.aggressive_state_collisions
        );
        info!("   • trigram_index: {} (state, trigram) posting lists", self.trigram_keys);
    }
}

fn count_collisions<K>(index: &HashMap<K, Vec<usize>>) -> usize {
    index.values().filter(|hits| hits.len() > 1).count()
}

/// Everything one run needs to match records: the reference population, the
/// exact lookup indexes, the per-state trigram postings, the optional linkage
/// model and the thresholds.
///
/// Built once per run and only read afterwards; index values are positions
/// into `employers`.
pub struct MatcherContext {
    employers: Vec<ReferenceEmployer>,
    fuzzy_trigram_counts: Vec<usize>,
    ein_index: HashMap<String, usize>,
    name_state_index: HashMap<(String, String), Vec<usize>>,
    name_city_state_index: HashMap<(String, String, String), Vec<usize>>,
    aggressive_state_index: HashMap<(String, String), Vec<usize>>,
    /// state -> fuzzy-name trigram -> employers carrying it.
    trigram_index: HashMap<String, HashMap<String, Vec<usize>>>,
    group_representatives: HashMap<i64, usize>,
    model: Option<LinkageModel>,
    config: MatchConfig,
    stats: IndexStats,
}

impl MatcherContext {
    pub fn build(mut employers: Vec<ReferenceEmployer>, model: Option<LinkageModel>, config: MatchConfig) -> Self {
        let mut ein_index: HashMap<String, usize> = HashMap::new();
        let mut name_state_index: HashMap<(String, String), Vec<usize>> = HashMap::new();
        let mut name_city_state_index: HashMap<(String, String, String), Vec<usize>> = HashMap::new();
        let mut aggressive_state_index: HashMap<(String, String), Vec<usize>> = HashMap::new();
        let mut trigram_index: HashMap<String, HashMap<String, Vec<usize>>> = HashMap::new();
        let mut group_representatives: HashMap<i64, usize> = HashMap::new();
        let mut fuzzy_trigram_counts = Vec::with_capacity(employers.len());
        let mut stats = IndexStats {
            employers: employers.len(),
            ..Default::default()
        };

        for (idx, employer) in employers.iter_mut().enumerate() {
            employer.ensure_normalized();
            let trigrams = trigram_set(&employer.name_fuzzy);
            fuzzy_trigram_counts.push(trigrams.len());

            if let Some(ein) = normalize_ein(employer.ein.as_deref()) {
                if ein_index.contains_key(&ein) {
                    stats.ein_collisions += 1;
                    debug!("Duplicate EIN {} on employer {}; keeping first writer", ein, employer.employer_id);
                } else {
                    ein_index.insert(ein, idx);
                }
            }

            if let Some(group_id) = employer.canonical_group_id {
                stats.grouped_employers += 1;
                if employer.is_canonical_rep {
                    group_representatives.insert(group_id, idx);
                }
            }

            let Some(state) = normalize_location_key(employer.state.as_deref()) else {
                continue;
            };
            let postings = trigram_index.entry(state.clone()).or_default();
            for trigram in trigrams {
                postings.entry(trigram).or_default().push(idx);
            }

            if !employer.name_standard.is_empty() {
                name_state_index
                    .entry((employer.name_standard.clone(), state.clone()))
                    .or_default()
                    .push(idx);
                if let Some(city) = normalize_location_key(employer.city.as_deref()) {
                    name_city_state_index
                        .entry((employer.name_standard.clone(), city, state.clone()))
                        .or_default()
                        .push(idx);
                }
            }
            if !employer.name_aggressive.is_empty() {
                aggressive_state_index
                    .entry((employer.name_aggressive.clone(), state))
                    .or_default()
                    .push(idx);
            }
        }

        stats.ein_keys = ein_index.len();
        stats.name_state_keys = name_state_index.len();
        stats.name_state_collisions = count_collisions(&name_state_index);
        stats.name_city_state_keys = name_city_state_index.len();
        stats.name_city_state_collisions = count_collisions(&name_city_state_index);
        stats.aggressive_state_keys = aggressive_state_index.len();
        stats.aggressive_state_collisions = count_collisions(&aggressive_state_index);
        stats.trigram_keys = trigram_index.values().map(HashMap::len).sum();

        Self {
            employers,
            fuzzy_trigram_counts,
            ein_index,
            name_state_index,
            name_city_state_index,
            aggressive_state_index,
            trigram_index,
            group_representatives,
            model,
            config,
            stats,
        }
    }

    pub fn employer(&self, idx: usize) -> &ReferenceEmployer {
        &self.employers[idx]
    }

    pub fn fuzzy_trigram_count(&self, idx: usize) -> usize {
        self.fuzzy_trigram_counts[idx]
    }

    pub fn model(&self) -> Option<&LinkageModel> {
        self.model.as_ref()
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    pub fn lookup_ein(&self, ein: &str) -> Option<usize> {
        self.ein_index.get(ein).copied()
    }

    pub fn lookup_name_city_state(&self, name_standard: &str, city: &str, state: &str) -> &[usize] {
        self.name_city_state_index
            .get(&(name_standard.to_string(), city.to_string(), state.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn lookup_name_state(&self, name_standard: &str, state: &str) -> &[usize] {
        self.name_state_index
            .get(&(name_standard.to_string(), state.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn lookup_aggressive_state(&self, name_aggressive: &str, state: &str) -> &[usize] {
        self.aggressive_state_index
            .get(&(name_aggressive.to_string(), state.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Employers in `state` sharing at least `min_shared` of `trigrams`, as
    /// `(position, shared count)` pairs in position order. Employers sharing
    /// nothing are never visited.
    pub fn trigram_candidates(&self, state: &str, trigrams: &HashSet<String>, min_shared: usize) -> Vec<(usize, usize)> {
        let Some(postings) = self.trigram_index.get(state) else {
            return Vec::new();
        };
        let mut shared: HashMap<usize, usize> = HashMap::new();
        for trigram in trigrams {
            if let Some(hits) = postings.get(trigram) {
                for &idx in hits {
                    *shared.entry(idx).or_insert(0) += 1;
                }
            }
        }
        let min_shared = min_shared.max(1);
        let mut candidates: Vec<(usize, usize)> = shared.into_iter().filter(|&(_, count)| count >= min_shared).collect();
        candidates.sort_unstable();
        candidates
    }

    /// Members of one canonical group are one employer, so several hits from
    /// the same group are reduced to a single entry: the group's
    /// representative when it is among the hits, otherwise the first member hit.
    /// Ungrouped rows and rows of different groups are kept as they are.
    pub fn collapse_canonical(&self, hits: &[usize]) -> Vec<usize> {
        if hits.len() < 2 {
            return hits.to_vec();
        }

        let mut collapsed: Vec<usize> = Vec::with_capacity(hits.len());
        let mut slot_for_group: HashMap<i64, usize> = HashMap::new();

        for &idx in hits {
            match self.employers[idx].canonical_group_id {
                None => collapsed.push(idx),
                Some(group_id) => match slot_for_group.get(&group_id) {
                    None => {
                        slot_for_group.insert(group_id, collapsed.len());
                        collapsed.push(idx);
                    }
                    Some(&slot) => {
                        if self.group_representatives.get(&group_id) == Some(&idx) {
                            collapsed[slot] = idx;
                        }
                    }
                },
            }
        }
        collapsed
    }
}
