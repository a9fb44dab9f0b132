// src/sources/mod.rs - Per-dataset adapters feeding source records to the matcher
pub mod db;

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::Mutex;

use crate::models::core::SourceRecord;
use crate::models::matching::MatchResult;

/// What the engine needs from one external dataset.
#[allow(async_fn_in_trait)]
pub trait SourceAdapter {
    fn source_system(&self) -> &str;

    /// Records without an active match in the log.
    async fn load_unmatched(&self, limit: Option<usize>) -> Result<Vec<SourceRecord>>;

    async fn load_all(&self, limit: Option<usize>) -> Result<Vec<SourceRecord>>;

    /// Upserts accepted matches into the dataset's legacy projection, keyed by
    /// the natural id. LOW-band and non-employer results are skipped.
    async fn write_legacy(&self, matches: &[MatchResult]) -> Result<usize>;
}

/// Declarative description of one dataset: where its rows live and which
/// columns map to the record fields. `None` columns are absent from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioDefinition {
    pub name: &'static str,
    pub source_system: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub name_column: &'static str,
    pub state_column: Option<&'static str>,
    pub city_column: Option<&'static str>,
    pub zip_column: Option<&'static str>,
    pub naics_column: Option<&'static str>,
    pub ein_column: Option<&'static str>,
    pub address_column: Option<&'static str>,
    pub legacy_table: &'static str,
    pub legacy_id_column: &'static str,
}

pub static SCENARIOS: [ScenarioDefinition; 6] = [
    ScenarioDefinition {
        name: "osha",
        source_system: "osha",
        table: "osha_establishments",
        id_column: "establishment_id",
        name_column: "estab_name",
        state_column: Some("site_state"),
        city_column: Some("site_city"),
        zip_column: Some("site_zip"),
        naics_column: Some("naics_code"),
        ein_column: None,
        address_column: Some("site_address"),
        legacy_table: "osha_employer_matches",
        legacy_id_column: "establishment_id",
    },
    ScenarioDefinition {
        name: "whd",
        source_system: "whd",
        table: "whd_cases",
        id_column: "case_id",
        name_column: "legal_name",
        state_column: Some("state"),
        city_column: Some("city"),
        zip_column: Some("zip_code"),
        naics_column: Some("naics_code"),
        ein_column: None,
        address_column: Some("street_address"),
        legacy_table: "whd_employer_matches",
        legacy_id_column: "case_id",
    },
    ScenarioDefinition {
        name: "990",
        source_system: "form_990",
        table: "form_990_filers",
        id_column: "filer_id",
        name_column: "business_name",
        state_column: Some("state"),
        city_column: Some("city"),
        zip_column: Some("zip_code"),
        naics_column: None,
        ein_column: Some("ein"),
        address_column: Some("address_line_1"),
        legacy_table: "form_990_employer_matches",
        legacy_id_column: "filer_id",
    },
    ScenarioDefinition {
        name: "sam",
        source_system: "sam",
        table: "sam_entities",
        id_column: "uei",
        name_column: "legal_business_name",
        state_column: Some("physical_state"),
        city_column: Some("physical_city"),
        zip_column: Some("physical_zip"),
        naics_column: Some("naics_primary"),
        ein_column: None,
        address_column: Some("physical_address"),
        legacy_table: "sam_employer_matches",
        legacy_id_column: "uei",
    },
    ScenarioDefinition {
        name: "sec",
        source_system: "sec",
        table: "sec_companies",
        id_column: "cik",
        name_column: "company_name",
        state_column: Some("state"),
        city_column: Some("city"),
        zip_column: Some("zip_code"),
        naics_column: None,
        ein_column: Some("ein"),
        address_column: None,
        legacy_table: "sec_employer_matches",
        legacy_id_column: "cik",
    },
    ScenarioDefinition {
        name: "bmf",
        source_system: "bmf",
        table: "irs_bmf",
        id_column: "ein",
        name_column: "org_name",
        state_column: Some("state"),
        city_column: Some("city"),
        zip_column: Some("zip_code"),
        naics_column: None,
        ein_column: Some("ein"),
        address_column: Some("street"),
        legacy_table: "bmf_employer_matches",
        legacy_id_column: "ein",
    },
];

pub fn scenario(name: &str) -> Option<&'static ScenarioDefinition> {
    SCENARIOS.iter().find(|definition| definition.name == name)
}

pub fn scenario_names() -> Vec<&'static str> {
    SCENARIOS.iter().map(|definition| definition.name).collect()
}

/// Records held in memory. `write_legacy` keeps the projection in a map so
/// upserts can be inspected.
pub struct InMemorySourceAdapter {
    source_system: String,
    records: Vec<SourceRecord>,
    matched_ids: HashSet<String>,
    legacy: Mutex<BTreeMap<String, String>>,
}

impl InMemorySourceAdapter {
    pub fn new(source_system: &str, records: Vec<SourceRecord>) -> Self {
        Self {
            source_system: source_system.to_string(),
            records,
            matched_ids: HashSet::new(),
            legacy: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_matched(mut self, ids: &[&str]) -> Self {
        self.matched_ids = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    /// Legacy projection: source id to target employer id.
    pub async fn legacy_rows(&self) -> BTreeMap<String, String> {
        self.legacy.lock().await.clone()
    }
}

fn take(records: impl Iterator<Item = SourceRecord>, limit: Option<usize>) -> Vec<SourceRecord> {
    match limit {
        Some(limit) => records.take(limit).collect(),
        None => records.collect(),
    }
}

impl SourceAdapter for InMemorySourceAdapter {
    fn source_system(&self) -> &str {
        &self.source_system
    }

    async fn load_unmatched(&self, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
        let unmatched = self
            .records
            .iter()
            .filter(|record| !self.matched_ids.contains(&record.id))
            .cloned();
        Ok(take(unmatched, limit))
    }

    async fn load_all(&self, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
        Ok(take(self.records.iter().cloned(), limit))
    }

    async fn write_legacy(&self, matches: &[MatchResult]) -> Result<usize> {
        let mut legacy = self.legacy.lock().await;
        let mut written = 0;
        for result in matches.iter().filter(|result| result.is_accepted()) {
            if let Some(target_id) = result.target_id() {
                legacy.insert(result.source_id.clone(), target_id.to_string());
                written += 1;
            }
        }
        Ok(written)
    }
}
