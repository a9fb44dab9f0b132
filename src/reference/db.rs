// src/reference/db.rs - PostgreSQL reference table and canonical group write-back
use anyhow::{Context, Result};
use log::{info, warn};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Row, Transaction};

use crate::clustering::canonical_groups::GroupingOutcome;
use crate::models::core::ReferenceEmployer;
use crate::reference::ReferenceStore;
use crate::utils::db_connect::PgPool;

const GROUP_COLUMNS: usize = 9;
const GROUP_BATCH_SIZE: usize = 1_000;
const ASSIGNMENT_BATCH_SIZE: usize = 5_000;

pub struct PgReferenceStore {
    pool: PgPool,
}

fn employer_from_row(row: &Row) -> ReferenceEmployer {
    let mut employer = ReferenceEmployer {
        employer_id: row.get("employer_id"),
        employer_name: row.get::<_, Option<String>>("employer_name").unwrap_or_default(),
        name_standard: row.get::<_, Option<String>>("name_standard").unwrap_or_default(),
        name_aggressive: row.get::<_, Option<String>>("name_aggressive").unwrap_or_default(),
        name_fuzzy: row.get::<_, Option<String>>("name_fuzzy").unwrap_or_default(),
        state: row.get("state"),
        city: row.get("city"),
        zip: row.get("zip"),
        naics: row.get("naics"),
        street_address: row.get("street_address"),
        ein: row.get("ein"),
        canonical_group_id: row.get("canonical_group_id"),
        is_canonical_rep: row.get::<_, Option<bool>>("is_canonical_rep").unwrap_or(false),
        affiliation_code: row.get("affiliation_code"),
        unit_size: row.get("unit_size"),
        is_historical: row.get::<_, Option<bool>>("is_historical").unwrap_or(false),
        exclude_from_counts: row.get::<_, Option<bool>>("exclude_from_counts").unwrap_or(false),
        latest_notice_date: row.get("latest_notice_date"),
        is_signatory_pattern: row.get::<_, Option<bool>>("is_signatory_pattern").unwrap_or(false),
    };
    employer.ensure_normalized();
    employer
}

impl PgReferenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_groups(transaction: &Transaction<'_>, outcome: &GroupingOutcome) -> Result<()> {
        for chunk in outcome.groups.chunks(GROUP_BATCH_SIZE) {
            let mut values_clause_parts = Vec::with_capacity(chunk.len());
            let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(chunk.len() * GROUP_COLUMNS);

            for (row_idx, group) in chunk.iter().enumerate() {
                let base = row_idx * GROUP_COLUMNS;
                let placeholders: Vec<String> = (1..=GROUP_COLUMNS).map(|offset| format!("${}", base + offset)).collect();
                values_clause_parts.push(format!("({}, CURRENT_TIMESTAMP)", placeholders.join(", ")));

                params.push(Box::new(group.group_id));
                params.push(Box::new(group.group_key.clone()));
                params.push(Box::new(group.canonical_employer_id.clone()));
                params.push(Box::new(group.canonical_name.clone()));
                params.push(Box::new(group.member_count as i32));
                params.push(Box::new(group.consolidated_workers));
                params.push(Box::new(group.is_cross_state));
                params.push(Box::new(group.states.clone()));
                params.push(Box::new(group.absorbed_by_fuzzy as i32));
            }

            let query = format!(
                "INSERT INTO canonical_groups (
                    group_id, group_key, canonical_employer_id, canonical_name, member_count,
                    consolidated_workers, is_cross_state, states, absorbed_by_fuzzy, created_at
                 )
                 VALUES {}",
                values_clause_parts.join(", ")
            );
            let params_slice: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|param| param.as_ref() as &(dyn ToSql + Sync)).collect();
            transaction
                .execute(query.as_str(), &params_slice[..])
                .await
                .context("Batch insert into canonical_groups failed")?;
        }
        Ok(())
    }

    /// Membership is written as parallel arrays so one statement covers a whole chunk.
    async fn assign_members(transaction: &Transaction<'_>, outcome: &GroupingOutcome) -> Result<u64> {
        let assignments: Vec<(String, i64, bool)> = outcome
            .assignments()
            .into_iter()
            .map(|(employer_id, (group_id, is_rep))| (employer_id.to_string(), group_id, is_rep))
            .collect();

        let mut assigned = 0u64;
        for chunk in assignments.chunks(ASSIGNMENT_BATCH_SIZE) {
            let ids: Vec<String> = chunk.iter().map(|(id, _, _)| id.clone()).collect();
            let group_ids: Vec<i64> = chunk.iter().map(|(_, group_id, _)| *group_id).collect();
            let reps: Vec<bool> = chunk.iter().map(|(_, _, is_rep)| *is_rep).collect();
            assigned += transaction
                .execute(
                    "UPDATE reference_employers r
                     SET canonical_group_id = a.group_id, is_canonical_rep = a.is_rep
                     FROM UNNEST($1::text[], $2::bigint[], $3::bool[]) AS a(employer_id, group_id, is_rep)
                     WHERE r.employer_id = a.employer_id",
                    &[&ids, &group_ids, &reps],
                )
                .await
                .context("Failed to assign canonical group membership")?;
        }
        Ok(assigned)
    }
}

impl ReferenceStore for PgReferenceStore {
    async fn load_reference(&self) -> Result<Vec<ReferenceEmployer>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for reference load")?;
        let rows = conn
            .query(
                "SELECT r.employer_id, r.employer_name, r.name_standard, r.name_aggressive, r.name_fuzzy,
                        r.state, r.city, r.zip, r.naics, r.street_address,
                        (SELECT MIN(i.id_value) FROM employer_identifiers i
                          WHERE i.employer_id = r.employer_id AND i.id_type = 'EIN') AS ein,
                        r.canonical_group_id, r.is_canonical_rep, r.affiliation_code, r.unit_size,
                        r.is_historical, r.exclude_from_counts, r.latest_notice_date, r.is_signatory_pattern
                 FROM reference_employers r
                 WHERE r.employer_name IS NOT NULL
                 ORDER BY r.employer_id",
                &[],
            )
            .await
            .context("Failed to load reference employers")?;
        info!("Loaded {} reference employers", rows.len());
        Ok(rows.iter().map(employer_from_row).collect())
    }

    async fn replace_canonical_groups(&self, outcome: &GroupingOutcome) -> Result<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for canonical group rebuild")?;
        let transaction = conn
            .transaction()
            .await
            .context("Failed to start transaction for canonical group rebuild")?;

        let result: Result<u64> = async {
            let cleared = transaction
                .execute(
                    "UPDATE reference_employers SET canonical_group_id = NULL, is_canonical_rep = FALSE
                     WHERE canonical_group_id IS NOT NULL OR is_canonical_rep",
                    &[],
                )
                .await
                .context("Failed to clear canonical assignments")?;
            transaction
                .execute("DELETE FROM canonical_groups", &[])
                .await
                .context("Failed to delete canonical groups")?;
            info!("Cleared {} previous canonical assignments", cleared);

            Self::insert_groups(&transaction, outcome).await?;
            Self::assign_members(&transaction, outcome).await
        }
        .await;

        match result {
            Ok(assigned) => {
                transaction
                    .commit()
                    .await
                    .context("Failed to commit canonical group rebuild")?;
                info!(
                    "✅ Wrote {} canonical groups, {} reference rows assigned",
                    outcome.groups.len(),
                    assigned
                );
                Ok(assigned as usize)
            }
            Err(e) => {
                warn!("Canonical group rebuild failed, rolling back: {}", e);
                transaction
                    .rollback()
                    .await
                    .context("Failed to roll back canonical group rebuild")?;
                Err(e)
            }
        }
    }
}
