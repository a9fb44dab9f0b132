// src/match_log/mod.rs - Append-only record of match and ambiguity decisions
pub mod db;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tokio::sync::Mutex;

use crate::models::matching::{ConfidenceBand, MatchResult};
use crate::models::stats_models::MatchRun;

/// `target_system` written on every row; all targets live in the reference population.
pub const REFERENCE_TARGET_SYSTEM: &str = "employer_reference";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Active,
    Rejected,
    Superseded,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Active => "active",
            LogStatus::Rejected => "rejected",
            LogStatus::Superseded => "superseded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(LogStatus::Active),
            "rejected" => Some(LogStatus::Rejected),
            "superseded" => Some(LogStatus::Superseded),
            _ => None,
        }
    }
}

/// One persisted decision. Evidence is already flattened to JSON here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchLogEntry {
    pub run_id: String,
    pub source_system: String,
    pub source_id: String,
    pub target_system: String,
    pub target_id: String,
    pub method: String,
    pub tier_rank: i32,
    pub confidence_band: ConfidenceBand,
    pub score: f64,
    pub evidence: JsonValue,
    pub status: LogStatus,
    pub created_at: DateTime<Utc>,
}

impl MatchLogEntry {
    /// `None` for no-match results: a null target has no place in the natural key.
    /// Misses are still counted on the run and covered by its results digest.
    pub fn from_result(run_id: &str, source_system: &str, result: &MatchResult) -> Option<Self> {
        let target_id = result.target_id()?;
        let status = if result.confidence_band == ConfidenceBand::Low {
            LogStatus::Rejected
        } else {
            LogStatus::Active
        };
        Some(Self {
            run_id: run_id.to_string(),
            source_system: source_system.to_string(),
            source_id: result.source_id.clone(),
            target_system: REFERENCE_TARGET_SYSTEM.to_string(),
            target_id: target_id.to_string(),
            method: result.method(),
            tier_rank: i32::from(result.tier_rank),
            confidence_band: result.confidence_band,
            score: result.score,
            evidence: result.evidence.to_json(),
            status,
            created_at: Utc::now(),
        })
    }

    pub fn natural_key(&self) -> (String, String, String, String, String) {
        (
            self.run_id.clone(),
            self.source_system.clone(),
            self.source_id.clone(),
            self.target_system.clone(),
            self.target_id.clone(),
        )
    }
}

/// Persistence for runs and their log rows.
#[allow(async_fn_in_trait)]
pub trait MatchLogStore {
    async fn create_run(&self, run: &MatchRun) -> Result<()>;

    /// Inserts a batch atomically. Rows whose natural key already exists are
    /// skipped; returns how many rows were actually inserted.
    async fn insert_entries(&self, entries: &[MatchLogEntry]) -> Result<usize>;

    /// Marks active/rejected rows of earlier runs of `source_system` superseded,
    /// restricted to the records in `source_ids`. Records the current run did
    /// not process keep their existing decisions.
    async fn supersede_prior(&self, source_system: &str, current_run_id: &str, source_ids: &[String]) -> Result<u64>;

    async fn finalize_run(&self, run: &MatchRun) -> Result<()>;

    async fn load_entries(&self, run_id: &str) -> Result<Vec<MatchLogEntry>>;

    /// Most recent runs of a scenario, newest first.
    async fn recent_runs(&self, scenario: &str, count: usize) -> Result<Vec<MatchRun>>;
}

/// Buffers entries and hands them to the store every `flush_size` rows.
///
/// Only matches and ambiguous collisions reach the log. A record with no
/// match leaves no row; it shows up in `MatchRun::total_source`, the
/// `NO_MATCH` method count and the results digest instead.
pub struct MatchLogWriter<'a, L: MatchLogStore> {
    store: &'a L,
    buffer: Vec<MatchLogEntry>,
    flush_size: usize,
    submitted: usize,
    inserted: usize,
}

impl<'a, L: MatchLogStore> MatchLogWriter<'a, L> {
    pub fn new(store: &'a L, flush_size: usize) -> Self {
        let flush_size = flush_size.max(1);
        Self {
            store,
            buffer: Vec::with_capacity(flush_size),
            flush_size,
            submitted: 0,
            inserted: 0,
        }
    }

    pub async fn push(&mut self, entry: MatchLogEntry) -> Result<()> {
        self.buffer.push(entry);
        if self.buffer.len() >= self.flush_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let inserted = self.store.insert_entries(&self.buffer).await?;
        self.submitted += self.buffer.len();
        self.inserted += inserted;
        debug!(
            "Flushed {} log entries ({} new, {} already present)",
            self.buffer.len(),
            inserted,
            self.buffer.len() - inserted
        );
        self.buffer.clear();
        Ok(())
    }

    /// Final flush; returns `(submitted, inserted)`.
    pub async fn finish(mut self) -> Result<(usize, usize)> {
        self.flush().await?;
        info!(
            "📝 Match log writer finished: {} entries submitted, {} inserted",
            self.submitted, self.inserted
        );
        Ok((self.submitted, self.inserted))
    }
}

/// SHA-256 over the canonical serialization of all results, ordered by source id.
/// Identical inputs produce identical digests.
pub fn results_digest(results: &[MatchResult]) -> String {
    let mut ordered: Vec<&MatchResult> = results.iter().collect();
    ordered.sort_by(|a, b| a.source_id.cmp(&b.source_id));

    let mut hasher = Sha256::new();
    for result in ordered {
        let canonical = json!({
            "source_id": result.source_id,
            "target_id": result.target_id(),
            "method": result.method(),
            "tier_rank": result.tier_rank,
            "confidence_band": result.confidence_band.as_str(),
            "score": format!("{:.6}", result.score),
            "evidence": result.evidence.to_json(),
        });
        hasher.update(canonical.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Default)]
struct InMemoryState {
    runs: Vec<MatchRun>,
    entries: Vec<MatchLogEntry>,
    keys: HashSet<(String, String, String, String, String)>,
}

/// Process-local store for dry runs and tests.
#[derive(Default)]
pub struct InMemoryMatchLog {
    state: Mutex<InMemoryState>,
}

impl InMemoryMatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

impl MatchLogStore for InMemoryMatchLog {
    async fn create_run(&self, run: &MatchRun) -> Result<()> {
        let mut state = self.state.lock().await;
        state.runs.retain(|existing| existing.run_id != run.run_id);
        state.runs.push(run.clone());
        Ok(())
    }

    async fn insert_entries(&self, entries: &[MatchLogEntry]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for entry in entries {
            if state.keys.insert(entry.natural_key()) {
                state.entries.push(entry.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn supersede_prior(&self, source_system: &str, current_run_id: &str, source_ids: &[String]) -> Result<u64> {
        let processed: HashSet<&str> = source_ids.iter().map(String::as_str).collect();
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for entry in state.entries.iter_mut() {
            if entry.source_system == source_system
                && entry.run_id != current_run_id
                && entry.status != LogStatus::Superseded
                && processed.contains(entry.source_id.as_str())
            {
                entry.status = LogStatus::Superseded;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn finalize_run(&self, run: &MatchRun) -> Result<()> {
        self.create_run(run).await
    }

    async fn load_entries(&self, run_id: &str) -> Result<Vec<MatchLogEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<MatchLogEntry> = state
            .entries
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.source_id.cmp(&b.source_id).then_with(|| a.target_id.cmp(&b.target_id)));
        Ok(entries)
    }

    async fn recent_runs(&self, scenario: &str, count: usize) -> Result<Vec<MatchRun>> {
        let state = self.state.lock().await;
        // Insertion order breaks ties between runs started in the same instant.
        let mut runs: Vec<(usize, &MatchRun)> = state
            .runs
            .iter()
            .enumerate()
            .filter(|(_, run)| run.scenario == scenario)
            .collect();
        runs.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at).then(b.0.cmp(&a.0)));
        Ok(runs.into_iter().take(count).map(|(_, run)| run.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::matching::{MatchEvidence, MatchTier, Resolution};

    fn ein_match(source_id: &str, target: &str) -> MatchResult {
        MatchResult::employer(
            source_id,
            target,
            "Acme",
            MatchTier::EinExact,
            Resolution::Direct,
            1.0,
            MatchEvidence::EinExact {
                ein: "123456789".into(),
            },
        )
    }

    #[test]
    fn test_entry_status_follows_band() {
        let accepted = MatchLogEntry::from_result("run-1", "osha", &ein_match("S1", "E1")).unwrap();
        assert_eq!(accepted.status, LogStatus::Active);
        assert_eq!(accepted.method, "EIN_EXACT");
        assert_eq!(accepted.target_system, REFERENCE_TARGET_SYSTEM);
        assert_eq!(accepted.evidence["kind"], "ein_exact");

        let ambiguous = MatchResult::ambiguous("S2", MatchTier::NameStateExact, vec!["E1".into(), "E2".into()], "tie");
        let rejected = MatchLogEntry::from_result("run-1", "osha", &ambiguous).unwrap();
        assert_eq!(rejected.status, LogStatus::Rejected);
        assert_eq!(rejected.target_id, "AMBIGUOUS");

        let miss = MatchResult::no_match("S3", vec![], vec![]);
        assert!(MatchLogEntry::from_result("run-1", "osha", &miss).is_none());
    }

    #[test]
    fn test_digest_ignores_input_order() {
        let a = ein_match("S1", "E1");
        let b = ein_match("S2", "E1");
        let forward = results_digest(&[a.clone(), b.clone()]);
        let backward = results_digest(&[b, a.clone()]);
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 64);
        assert_ne!(forward, results_digest(&[a]));
    }

    #[tokio::test]
    async fn test_relogging_is_idempotent() {
        let store = InMemoryMatchLog::new();
        let entry = MatchLogEntry::from_result("run-1", "osha", &ein_match("S1", "E1")).unwrap();

        assert_eq!(store.insert_entries(&[entry.clone()]).await.unwrap(), 1);
        assert_eq!(store.insert_entries(&[entry.clone(), entry]).await.unwrap(), 0);
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_writer_flushes_in_batches() {
        let store = InMemoryMatchLog::new();
        let mut writer = MatchLogWriter::new(&store, 2);
        for idx in 0..5 {
            let entry = MatchLogEntry::from_result("run-1", "whd", &ein_match(&format!("S{}", idx), "E1")).unwrap();
            writer.push(entry).await.unwrap();
        }
        // Two full batches flushed, one entry still buffered.
        assert_eq!(store.entry_count().await, 4);
        assert_eq!(writer.finish().await.unwrap(), (5, 5));
        assert_eq!(store.entry_count().await, 5);
    }

    #[tokio::test]
    async fn test_supersede_only_touches_other_runs() {
        let store = InMemoryMatchLog::new();
        let old = MatchLogEntry::from_result("run-1", "sam", &ein_match("S1", "E1")).unwrap();
        let other_system = MatchLogEntry::from_result("run-x", "sec", &ein_match("S1", "E1")).unwrap();
        let new = MatchLogEntry::from_result("run-2", "sam", &ein_match("S1", "E1")).unwrap();
        store.insert_entries(&[old, other_system, new]).await.unwrap();

        assert_eq!(store.supersede_prior("sam", "run-2", &["S1".to_string()]).await.unwrap(), 1);
        let old_rows = store.load_entries("run-1").await.unwrap();
        assert_eq!(old_rows[0].status, LogStatus::Superseded);
        assert_eq!(store.load_entries("run-2").await.unwrap()[0].status, LogStatus::Active);
        assert_eq!(store.load_entries("run-x").await.unwrap()[0].status, LogStatus::Active);
    }

    #[tokio::test]
    async fn test_supersede_leaves_unprocessed_records_alone() {
        let store = InMemoryMatchLog::new();
        let kept = MatchLogEntry::from_result("run-1", "sam", &ein_match("S1", "E1")).unwrap();
        let replaced = MatchLogEntry::from_result("run-1", "sam", &ein_match("S2", "E2")).unwrap();
        store.insert_entries(&[kept, replaced]).await.unwrap();

        assert_eq!(store.supersede_prior("sam", "run-2", &["S2".to_string()]).await.unwrap(), 1);
        let rows = store.load_entries("run-1").await.unwrap();
        assert_eq!(rows[0].source_id, "S1");
        assert_eq!(rows[0].status, LogStatus::Active);
        assert_eq!(rows[1].status, LogStatus::Superseded);
        assert_eq!(store.supersede_prior("sam", "run-2", &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first() {
        let store = InMemoryMatchLog::new();
        for run_id in ["r1", "r2", "r3"] {
            store.create_run(&MatchRun::start(run_id, "osha", "osha")).await.unwrap();
        }
        store.create_run(&MatchRun::start("other", "whd", "whd")).await.unwrap();

        let runs = store.recent_runs("osha", 2).await.unwrap();
        let ids: Vec<&str> = runs.iter().map(|run| run.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r2"]);
    }
}
