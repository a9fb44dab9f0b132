// src/sources/db.rs - PostgreSQL adapter driven by a ScenarioDefinition
use anyhow::{Context, Result};
use log::{debug, info};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::match_log::REFERENCE_TARGET_SYSTEM;
use crate::models::core::SourceRecord;
use crate::models::matching::MatchResult;
use crate::sources::{ScenarioDefinition, SourceAdapter};
use crate::utils::db_connect::PgPool;

const LEGACY_COLUMNS: usize = 5;
const LEGACY_BATCH_SIZE: usize = 1_000;

pub struct PgSourceAdapter {
    pool: PgPool,
    definition: &'static ScenarioDefinition,
}

fn text_column(column: Option<&str>, alias: &str) -> String {
    match column {
        Some(column) => format!("NULLIF(TRIM(CAST(s.{} AS TEXT)), '') AS {}", column, alias),
        None => format!("NULL::text AS {}", alias),
    }
}

fn record_from_row(row: &Row) -> SourceRecord {
    SourceRecord {
        id: row.get("source_id"),
        name: row.get::<_, Option<String>>("name").unwrap_or_default(),
        state: row.get("state"),
        city: row.get("city"),
        zip: row.get("zip"),
        naics: row.get("naics"),
        ein: row.get("ein"),
        street_address: row.get("street_address"),
    }
}

impl PgSourceAdapter {
    pub fn new(pool: PgPool, definition: &'static ScenarioDefinition) -> Self {
        Self { pool, definition }
    }

    async fn load(&self, unmatched_only: bool, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for source load")?;

        let mut sql = select_sql(self.definition, unmatched_only);
        let limit = limit.map(|value| value as i64);
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if unmatched_only {
            params.push(&self.definition.source_system);
        }
        if let Some(limit) = limit.as_ref() {
            params.push(limit);
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }

        debug!("[{}] Source query: {}", self.definition.name, sql);
        let rows = conn
            .query(sql.as_str(), &params)
            .await
            .with_context(|| format!("Failed to load source records from {}", self.definition.table))?;
        info!(
            "[{}] Loaded {} source records from {}{}",
            self.definition.name,
            rows.len(),
            self.definition.table,
            if unmatched_only { " (unmatched only)" } else { "" }
        );
        Ok(rows.iter().map(record_from_row).collect())
    }
}

/// Selects every mapped column as text. The unmatched variant binds the
/// source system as `$1` and skips records with an active log row.
fn select_sql(d: &ScenarioDefinition, unmatched_only: bool) -> String {
    let mut sql = format!(
        "SELECT CAST(s.{id} AS TEXT) AS source_id, CAST(s.{name} AS TEXT) AS name, {state}, {city}, {zip}, {naics}, {ein}, {address}
         FROM {table} s
         WHERE s.{name} IS NOT NULL",
        id = d.id_column,
        name = d.name_column,
        state = text_column(d.state_column, "state"),
        city = text_column(d.city_column, "city"),
        zip = text_column(d.zip_column, "zip"),
        naics = text_column(d.naics_column, "naics"),
        ein = text_column(d.ein_column, "ein"),
        address = text_column(d.address_column, "street_address"),
        table = d.table,
    );
    if unmatched_only {
        sql.push_str(&format!(
            " AND NOT EXISTS (
                SELECT 1 FROM match_log ml
                WHERE ml.source_system = $1
                  AND ml.source_id = CAST(s.{id} AS TEXT)
                  AND ml.status = 'active'
             )",
            id = d.id_column
        ));
    }
    sql.push_str(&format!(" ORDER BY s.{}", d.id_column));
    sql
}

impl SourceAdapter for PgSourceAdapter {
    fn source_system(&self) -> &str {
        self.definition.source_system
    }

    async fn load_unmatched(&self, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
        self.load(true, limit).await
    }

    async fn load_all(&self, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
        self.load(false, limit).await
    }

    async fn write_legacy(&self, matches: &[MatchResult]) -> Result<usize> {
        let accepted: Vec<&MatchResult> = matches.iter().filter(|result| result.is_accepted()).collect();
        if accepted.is_empty() {
            return Ok(0);
        }

        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for legacy upsert")?;
        let transaction = conn
            .transaction()
            .await
            .context("Failed to start transaction for legacy upsert")?;

        let mut written = 0usize;
        for chunk in accepted.chunks(LEGACY_BATCH_SIZE) {
            let mut values_clause_parts = Vec::with_capacity(chunk.len());
            let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(chunk.len() * LEGACY_COLUMNS);

            for (row_idx, result) in chunk.iter().enumerate() {
                let base = row_idx * LEGACY_COLUMNS;
                values_clause_parts.push(format!(
                    "(${}, ${}, ${}, ${}, ${}, '{}', CURRENT_TIMESTAMP)",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5,
                    REFERENCE_TARGET_SYSTEM
                ));
                params.push(Box::new(result.source_id.clone()));
                params.push(Box::new(result.target_id().unwrap_or_default().to_string()));
                params.push(Box::new(result.method()));
                params.push(Box::new(result.confidence_band.as_str().to_string()));
                params.push(Box::new(result.score));
            }

            let query = format!(
                "INSERT INTO {table} ({id}, employer_id, match_method, confidence_band, match_score, target_system, updated_at)
                 VALUES {values}
                 ON CONFLICT ({id}) DO UPDATE SET
                    employer_id = EXCLUDED.employer_id,
                    match_method = EXCLUDED.match_method,
                    confidence_band = EXCLUDED.confidence_band,
                    match_score = EXCLUDED.match_score,
                    updated_at = EXCLUDED.updated_at",
                table = self.definition.legacy_table,
                id = self.definition.legacy_id_column,
                values = values_clause_parts.join(", ")
            );
            let params_slice: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|param| param.as_ref() as &(dyn ToSql + Sync)).collect();
            written += transaction
                .execute(query.as_str(), &params_slice[..])
                .await
                .with_context(|| format!("Legacy upsert into {} failed", self.definition.legacy_table))?
                as usize;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit legacy upsert")?;
        info!(
            "[{}] Upserted {} accepted matches into {}",
            self.definition.name, written, self.definition.legacy_table
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::scenario;

    #[test]
    fn test_missing_columns_select_null() {
        assert_eq!(text_column(None, "ein"), "NULL::text AS ein");
        assert_eq!(
            text_column(Some("site_state"), "state"),
            "NULLIF(TRIM(CAST(s.site_state AS TEXT)), '') AS state"
        );
    }

    #[test]
    fn test_select_sql_shapes() {
        let osha = scenario("osha").unwrap();
        let all = select_sql(osha, false);
        assert!(all.contains("FROM osha_establishments s"));
        assert!(all.contains("NULL::text AS ein"));
        assert!(all.ends_with("ORDER BY s.establishment_id"));
        assert!(!all.contains("$1"));

        let unmatched = select_sql(scenario("bmf").unwrap(), true);
        assert!(unmatched.contains("NOT EXISTS"));
        assert!(unmatched.contains("ml.source_system = $1"));
        assert!(unmatched.contains("NULLIF(TRIM(CAST(s.ein AS TEXT)), '') AS ein"));
    }
}
