// src/match_log/db.rs - PostgreSQL match log, run table and per-source advisory lock
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use crate::match_log::{LogStatus, MatchLogEntry, MatchLogStore};
use crate::models::matching::ConfidenceBand;
use crate::models::stats_models::{MatchRun, RunStatus};
use crate::utils::db_connect::PgPool;

/// Columns per log row in the batch insert.
const LOG_COLUMNS: usize = 12;
/// Keeps a single INSERT well under the 65535 bind-parameter limit.
const MAX_ROWS_PER_STATEMENT: usize = 2_000;
/// Source ids bound into one `ANY($3)` array per supersede statement.
const SUPERSEDE_CHUNK_SIZE: usize = 10_000;
/// First half of the two-key advisory lock; the second half is the source system hash.
const ADVISORY_LOCK_NAMESPACE: i32 = 7_341;

pub struct PgMatchLog {
    pool: PgPool,
}

/// Session-level advisory lock on one source system, held on a dedicated
/// connection. Dropping it closes the session, which also releases the lock.
pub struct SourceLock {
    client: Client,
    source_system: String,
}

impl SourceLock {
    pub async fn release(self) -> Result<()> {
        self.client
            .execute(
                "SELECT pg_advisory_unlock($1, hashtext($2))",
                &[&ADVISORY_LOCK_NAMESPACE, &self.source_system],
            )
            .await
            .with_context(|| format!("Failed to release advisory lock for {}", self.source_system))?;
        debug!("Released advisory lock for source system {}", self.source_system);
        Ok(())
    }
}

fn count(row: &Row, column: &str) -> usize {
    row.get::<_, i64>(column).max(0) as usize
}

fn run_from_row(row: &Row) -> Result<MatchRun> {
    let method_counts: JsonValue = row.get("method_counts");
    let method_counts: BTreeMap<String, usize> =
        serde_json::from_value(method_counts).context("Failed to decode method_counts")?;
    let status: String = row.get("status");

    Ok(MatchRun {
        run_id: row.get("run_id"),
        scenario: row.get("scenario"),
        source_system: row.get("source_system"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        status: RunStatus::parse(&status),
        total_source: count(row, "total_source"),
        total_matched: count(row, "total_matched"),
        total_ambiguous: count(row, "total_ambiguous"),
        high_count: count(row, "high_count"),
        medium_count: count(row, "medium_count"),
        low_count: count(row, "low_count"),
        method_counts,
        results_digest: row.get("results_digest"),
    })
}

fn entry_from_row(row: &Row) -> Result<MatchLogEntry> {
    let band: String = row.get("confidence_band");
    let status: String = row.get("status");
    Ok(MatchLogEntry {
        run_id: row.get("run_id"),
        source_system: row.get("source_system"),
        source_id: row.get("source_id"),
        target_system: row.get("target_system"),
        target_id: row.get("target_id"),
        method: row.get("method"),
        tier_rank: row.get("tier_rank"),
        confidence_band: ConfidenceBand::parse(&band)
            .ok_or_else(|| anyhow!("Unknown confidence band '{}' in match_log", band))?,
        score: row.get("score"),
        evidence: row.get("evidence"),
        status: LogStatus::parse(&status).ok_or_else(|| anyhow!("Unknown log status '{}' in match_log", status))?,
        created_at: row.get("created_at"),
    })
}

impl PgMatchLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Takes the per-source lock without waiting. Fails when another writer
    /// for the same source system holds it.
    pub async fn try_lock_source(&self, source_system: &str) -> Result<SourceLock> {
        let client = self
            .pool
            .dedicated_connection()
            .await
            .context("Failed to open dedicated connection for advisory lock")?;
        let row = client
            .query_one(
                "SELECT pg_try_advisory_lock($1, hashtext($2)) AS locked",
                &[&ADVISORY_LOCK_NAMESPACE, &source_system],
            )
            .await
            .context("Failed to request advisory lock")?;
        let locked: bool = row.get("locked");
        if !locked {
            bail!(
                "Another run for source system '{}' is currently saving; refusing to run concurrently",
                source_system
            );
        }
        info!("🔒 Acquired advisory lock for source system {}", source_system);
        Ok(SourceLock {
            client,
            source_system: source_system.to_string(),
        })
    }

    async fn upsert_run(&self, run: &MatchRun) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for match_runs upsert")?;
        let method_counts = serde_json::to_value(&run.method_counts).context("Failed to serialize method counts")?;
        let counts: Vec<i64> = [
            run.total_source,
            run.total_matched,
            run.total_ambiguous,
            run.high_count,
            run.medium_count,
            run.low_count,
        ]
        .iter()
        .map(|&value| value as i64)
        .collect();

        conn.execute(
            "INSERT INTO match_runs (
                run_id, scenario, source_system, started_at, completed_at, status,
                total_source, total_matched, total_ambiguous, high_count, medium_count, low_count,
                method_counts, results_digest
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (run_id) DO UPDATE SET
                completed_at = EXCLUDED.completed_at,
                status = EXCLUDED.status,
                total_source = EXCLUDED.total_source,
                total_matched = EXCLUDED.total_matched,
                total_ambiguous = EXCLUDED.total_ambiguous,
                high_count = EXCLUDED.high_count,
                medium_count = EXCLUDED.medium_count,
                low_count = EXCLUDED.low_count,
                method_counts = EXCLUDED.method_counts,
                results_digest = EXCLUDED.results_digest",
            &[
                &run.run_id,
                &run.scenario,
                &run.source_system,
                &run.started_at,
                &run.completed_at,
                &run.status.as_str(),
                &counts[0],
                &counts[1],
                &counts[2],
                &counts[3],
                &counts[4],
                &counts[5],
                &method_counts,
                &run.results_digest,
            ],
        )
        .await
        .with_context(|| format!("Failed to upsert match_runs row {}", run.run_id))?;
        Ok(())
    }
}

impl MatchLogStore for PgMatchLog {
    async fn create_run(&self, run: &MatchRun) -> Result<()> {
        self.upsert_run(run).await?;
        info!("Created match run {} for scenario {}", run.run_id, run.scenario);
        Ok(())
    }

    async fn insert_entries(&self, entries: &[MatchLogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for match_log insert")?;
        let transaction = conn
            .transaction()
            .await
            .context("Failed to start transaction for match_log insert")?;

        let mut inserted = 0usize;
        for chunk in entries.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut values_clause_parts = Vec::with_capacity(chunk.len());
            let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(chunk.len() * LOG_COLUMNS);

            for (row_idx, entry) in chunk.iter().enumerate() {
                let base = row_idx * LOG_COLUMNS;
                let placeholders: Vec<String> = (1..=LOG_COLUMNS).map(|offset| format!("${}", base + offset)).collect();
                values_clause_parts.push(format!("({})", placeholders.join(", ")));

                params.push(Box::new(entry.run_id.clone()));
                params.push(Box::new(entry.source_system.clone()));
                params.push(Box::new(entry.source_id.clone()));
                params.push(Box::new(entry.target_system.clone()));
                params.push(Box::new(entry.target_id.clone()));
                params.push(Box::new(entry.method.clone()));
                params.push(Box::new(entry.tier_rank));
                params.push(Box::new(entry.confidence_band.as_str().to_string()));
                params.push(Box::new(entry.score));
                params.push(Box::new(entry.evidence.clone()));
                params.push(Box::new(entry.status.as_str().to_string()));
                params.push(Box::new(entry.created_at));
            }

            let query = format!(
                "INSERT INTO match_log (
                    run_id, source_system, source_id, target_system, target_id, method,
                    tier_rank, confidence_band, score, evidence, status, created_at
                 )
                 VALUES {}
                 ON CONFLICT (run_id, source_system, source_id, target_system, target_id) DO NOTHING",
                values_clause_parts.join(", ")
            );
            let params_slice: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|param| param.as_ref() as &(dyn ToSql + Sync)).collect();

            match transaction.execute(query.as_str(), &params_slice[..]).await {
                Ok(rows) => inserted += rows as usize,
                Err(e) => {
                    warn!("match_log batch insert failed, rolling back {} entries: {}", entries.len(), e);
                    transaction
                        .rollback()
                        .await
                        .context("Failed to roll back match_log transaction")?;
                    return Err(e).context("Batch insert into match_log failed");
                }
            }
        }

        transaction
            .commit()
            .await
            .context("Failed to commit match_log transaction")?;
        Ok(inserted)
    }

    async fn supersede_prior(&self, source_system: &str, current_run_id: &str, source_ids: &[String]) -> Result<u64> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for supersede")?;
        let mut updated = 0;
        for chunk in source_ids.chunks(SUPERSEDE_CHUNK_SIZE) {
            updated += conn
                .execute(
                    "UPDATE match_log SET status = 'superseded'
                     WHERE source_system = $1 AND run_id <> $2 AND status IN ('active', 'rejected')
                       AND source_id = ANY($3)",
                    &[&source_system, &current_run_id, &chunk],
                )
                .await
                .with_context(|| format!("Failed to supersede prior match_log rows for {}", source_system))?;
        }
        info!(
            "Superseded {} prior match_log rows for {} across {} processed records",
            updated,
            source_system,
            source_ids.len()
        );
        Ok(updated)
    }

    async fn finalize_run(&self, run: &MatchRun) -> Result<()> {
        self.upsert_run(run).await
    }

    async fn load_entries(&self, run_id: &str) -> Result<Vec<MatchLogEntry>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for match_log load")?;
        let rows = conn
            .query(
                "SELECT run_id, source_system, source_id, target_system, target_id, method,
                        tier_rank, confidence_band, score, evidence, status, created_at
                 FROM match_log
                 WHERE run_id = $1
                 ORDER BY source_id, target_id",
                &[&run_id],
            )
            .await
            .with_context(|| format!("Failed to load match_log rows for run {}", run_id))?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn recent_runs(&self, scenario: &str, count: usize) -> Result<Vec<MatchRun>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for match_runs load")?;
        let rows = conn
            .query(
                "SELECT run_id, scenario, source_system, started_at, completed_at, status,
                        total_source, total_matched, total_ambiguous, high_count, medium_count, low_count,
                        method_counts, results_digest
                 FROM match_runs
                 WHERE scenario = $1
                 ORDER BY started_at DESC
                 LIMIT $2",
                &[&scenario, &(count as i64)],
            )
            .await
            .with_context(|| format!("Failed to load recent runs for {}", scenario))?;
        rows.iter().map(run_from_row).collect()
    }
}
