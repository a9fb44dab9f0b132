// src/reference/mod.rs - Access to the authoritative employer population
pub mod db;

use anyhow::Result;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::clustering::canonical_groups::GroupingOutcome;
use crate::models::core::ReferenceEmployer;
use crate::models::stats_models::CanonicalGroup;

#[allow(async_fn_in_trait)]
pub trait ReferenceStore {
    /// Whole population, normalized name forms filled in, ordered by employer id.
    async fn load_reference(&self) -> Result<Vec<ReferenceEmployer>>;

    /// Clears every existing assignment and writes the new groups. Must be
    /// all-or-nothing. Returns the number of rows assigned to a group.
    async fn replace_canonical_groups(&self, outcome: &GroupingOutcome) -> Result<usize>;
}

/// Reference rows held in memory, used for dry runs and tests.
pub struct InMemoryReferenceStore {
    employers: Mutex<Vec<ReferenceEmployer>>,
    groups: Mutex<Vec<CanonicalGroup>>,
}

impl InMemoryReferenceStore {
    pub fn new(employers: Vec<ReferenceEmployer>) -> Self {
        Self {
            employers: Mutex::new(employers),
            groups: Mutex::new(Vec::new()),
        }
    }

    pub async fn groups(&self) -> Vec<CanonicalGroup> {
        self.groups.lock().await.clone()
    }
}

impl ReferenceStore for InMemoryReferenceStore {
    async fn load_reference(&self) -> Result<Vec<ReferenceEmployer>> {
        let mut employers = self.employers.lock().await.clone();
        for employer in employers.iter_mut() {
            employer.ensure_normalized();
        }
        employers.sort_by(|a, b| a.employer_id.cmp(&b.employer_id));
        Ok(employers)
    }

    async fn replace_canonical_groups(&self, outcome: &GroupingOutcome) -> Result<usize> {
        let assignments: BTreeMap<&str, (i64, bool)> = outcome.assignments();
        let mut employers = self.employers.lock().await;
        let mut assigned = 0;
        for employer in employers.iter_mut() {
            match assignments.get(employer.employer_id.as_str()) {
                Some(&(group_id, is_rep)) => {
                    employer.canonical_group_id = Some(group_id);
                    employer.is_canonical_rep = is_rep;
                    assigned += 1;
                }
                None => {
                    employer.canonical_group_id = None;
                    employer.is_canonical_rep = false;
                }
            }
        }
        *self.groups.lock().await = outcome.groups.clone();
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::canonical_groups::{build_canonical_groups, GrouperConfig};

    #[tokio::test]
    async fn test_replace_clears_stale_assignments() {
        let mut stale = ReferenceEmployer::new("E9", "Old Group Member", Some("TX"), None);
        stale.canonical_group_id = Some(42);
        stale.is_canonical_rep = true;
        let store = InMemoryReferenceStore::new(vec![
            ReferenceEmployer::new("E2", "Acme", Some("CA"), None),
            ReferenceEmployer::new("E1", "Acme", Some("CA"), None),
            stale,
        ]);

        let employers = store.load_reference().await.unwrap();
        assert_eq!(employers[0].employer_id, "E1");
        let outcome = build_canonical_groups(&employers, &GrouperConfig::default());
        assert_eq!(store.replace_canonical_groups(&outcome).await.unwrap(), 2);

        let after = store.load_reference().await.unwrap();
        let reps: Vec<&str> = after
            .iter()
            .filter(|e| e.is_canonical_rep)
            .map(|e| e.employer_id.as_str())
            .collect();
        assert_eq!(reps, vec!["E1"]);
        assert_eq!(after[2].canonical_group_id, None);
        assert_eq!(store.groups().await.len(), 1);
    }
}
