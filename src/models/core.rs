// src/models/core.rs

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::matching::name::{normalize_aggressive, normalize_fuzzy, normalize_standard};

/// One record from an external dataset awaiting resolution.
///
/// Only `id` and `name` are guaranteed; every other field is whatever the
/// source adapter could find for the row. Lives only for the duration of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub name: String,
    pub state: Option<String>,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub naics: Option<String>,
    pub ein: Option<String>,
    pub street_address: Option<String>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }

    pub fn with_city(mut self, city: &str) -> Self {
        self.city = Some(city.to_string());
        self
    }

    pub fn with_ein(mut self, ein: &str) -> Self {
        self.ein = Some(ein.to_string());
        self
    }

    pub fn with_zip(mut self, zip: &str) -> Self {
        self.zip = Some(zip.to_string());
        self
    }
}

/// A row of the authoritative employer population.
///
/// The three normalized name columns are precomputed upstream; rows that
/// arrive without them are filled in by [`ReferenceEmployer::ensure_normalized`].
/// `canonical_group_id` and `is_canonical_rep` are owned by the canonical grouper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEmployer {
    pub employer_id: String,
    pub employer_name: String,
    pub name_standard: String,
    pub name_aggressive: String,
    pub name_fuzzy: String,
    pub state: Option<String>,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub naics: Option<String>,
    pub street_address: Option<String>,
    pub ein: Option<String>,
    pub canonical_group_id: Option<i64>,
    pub is_canonical_rep: bool,

    // Grouping attributes
    pub affiliation_code: Option<String>,
    pub unit_size: Option<i64>,
    pub is_historical: bool,
    pub exclude_from_counts: bool,
    pub latest_notice_date: Option<NaiveDate>,
    pub is_signatory_pattern: bool,
}

impl ReferenceEmployer {
    /// Builds a row with derived name forms. Mostly used by tests and the
    /// `test` CLI command; database rows come through `reference::db`.
    pub fn new(employer_id: &str, employer_name: &str, state: Option<&str>, city: Option<&str>) -> Self {
        let mut employer = Self {
            employer_id: employer_id.to_string(),
            employer_name: employer_name.to_string(),
            state: state.map(str::to_string),
            city: city.map(str::to_string),
            ..Default::default()
        };
        employer.ensure_normalized();
        employer
    }

    /// Fills any empty normalized-name column from `employer_name`.
    pub fn ensure_normalized(&mut self) {
        if self.name_standard.is_empty() {
            self.name_standard = normalize_standard(&self.employer_name);
        }
        if self.name_aggressive.is_empty() {
            self.name_aggressive = normalize_aggressive(&self.employer_name);
        }
        if self.name_fuzzy.is_empty() {
            self.name_fuzzy = normalize_fuzzy(&self.employer_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_new_derives_name_forms() {
        let employer = ReferenceEmployer::new("E1", "The Acme Foods, Inc.", Some("ny"), None);
        assert_eq!(employer.name_standard, "the acme foods");
        assert_eq!(employer.name_aggressive, "acme foods");
        assert_eq!(employer.name_fuzzy, "acme foods");
    }

    #[test]
    fn test_ensure_normalized_keeps_precomputed_columns() {
        let mut employer = ReferenceEmployer {
            employer_id: "E2".to_string(),
            employer_name: "Acme Inc".to_string(),
            name_standard: "precomputed".to_string(),
            ..Default::default()
        };
        employer.ensure_normalized();
        assert_eq!(employer.name_standard, "precomputed");
        assert_eq!(employer.name_aggressive, "acme");
    }
}
