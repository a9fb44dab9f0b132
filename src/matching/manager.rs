// src/matching/manager.rs - Coordinates one scenario run from load to finalize
use anyhow::{Context, Result};
use indicatif::MultiProgress;
use log::{info, warn};
use uuid::Uuid;

use crate::match_log::{results_digest, MatchLogEntry, MatchLogStore, MatchLogWriter};
use crate::matching::cascade::CascadeMatcher;
use crate::matching::fuzzy::FuzzyMatcher;
use crate::matching::index::MatcherContext;
use crate::matching::probabilistic::LinkageModel;
use crate::models::core::SourceRecord;
use crate::models::matching::MatchResult;
use crate::models::stats_models::{MatchRun, MatchingStats};
use crate::reference::ReferenceStore;
use crate::sources::SourceAdapter;
use crate::utils::match_config::MatchConfig;
use crate::utils::progress_bars::logging::MatchingLogger;
use crate::utils::progress_bars::progress_config::record_bar;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Supersede earlier runs and write the legacy projection.
    pub save: bool,
    pub limit: Option<usize>,
    pub skip_fuzzy: bool,
    pub unmatched_only: bool,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: MatchRun,
    pub stats: MatchingStats,
    pub results: Vec<MatchResult>,
    /// Log rows produced by this run, in source order.
    pub entries: Vec<MatchLogEntry>,
    pub log_inserted: usize,
    pub superseded: u64,
    pub legacy_written: usize,
}

/// Loads the reference population and linkage model and builds the indexes.
pub async fn build_context<R: ReferenceStore>(reference: &R, config: MatchConfig) -> Result<MatcherContext> {
    let employers = reference
        .load_reference()
        .await
        .context("Failed to load reference population")?;
    let model = LinkageModel::load_optional(config.linkage_model_path.as_deref());
    let context = MatcherContext::build(employers, model, config);
    context.stats().log_summary();
    Ok(context)
}

/// Cascade then fuzzy over `records`. One result per record, in input order.
pub fn match_batch(
    context: &MatcherContext,
    records: &[SourceRecord],
    skip_fuzzy: bool,
    stats: &mut MatchingStats,
    logger: &MatchingLogger,
    multi_progress: Option<&MultiProgress>,
) -> Vec<MatchResult> {
    let cascade = CascadeMatcher::new(context);
    let pb = record_bar(multi_progress, records.len() as u64, "Cascade matching");

    let mut results = Vec::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        results.push(cascade.match_record(record, stats));
        if let Some(pb) = &pb {
            pb.inc(1);
        }
        logger.log_progress_update(idx + 1, records.len(), Some("cascade"));
    }
    if let Some(pb) = pb {
        pb.finish_with_message(format!("Cascade done: {} matched", stats.cascade_matches));
    }
    logger.log_cascade_summary(stats);

    if skip_fuzzy {
        return results;
    }

    // Ambiguous outcomes are final; only plain misses go to the fuzzy pass.
    let pending: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, result)| !result.is_match() && !result.is_ambiguous())
        .map(|(idx, _)| idx)
        .collect();
    if pending.is_empty() {
        return results;
    }

    logger.log_phase("Fuzzy matching", Some(&format!("{} unresolved records", pending.len())));
    let pending_records: Vec<&SourceRecord> = pending.iter().map(|&idx| &records[idx]).collect();
    let fuzzy = FuzzyMatcher::new(context);
    for (idx, found) in pending.into_iter().zip(fuzzy.match_records(&pending_records, stats)) {
        if let Some(result) = found {
            results[idx] = result;
        }
    }
    logger.log_fuzzy_summary(stats);
    results
}

/// Runs one scenario end to end against a prebuilt context.
///
/// The run row is created first and finalized last, after superseding and the
/// legacy write. If any step in between fails the run is stored as `failed`.
pub async fn run_scenario<S: SourceAdapter, L: MatchLogStore>(
    scenario: &str,
    source: &S,
    context: &MatcherContext,
    log_store: &L,
    options: &RunOptions,
    multi_progress: Option<&MultiProgress>,
) -> Result<RunReport> {
    let logger = MatchingLogger::new(scenario);
    let run_id = Uuid::new_v4().to_string();
    logger.log_start(&run_id, options.save, options.skip_fuzzy);

    let mut run = MatchRun::start(&run_id, scenario, source.source_system());
    log_store
        .create_run(&run)
        .await
        .with_context(|| format!("Failed to create run {}", run_id))?;

    match process_run(&mut run, source, context, log_store, options, &logger, multi_progress).await {
        Ok(report) => Ok(report),
        Err(e) => {
            logger.log_error(&format!("Run {} failed: {:#}", run_id, e));
            run.fail();
            if let Err(mark_err) = log_store.finalize_run(&run).await {
                warn!("Could not mark run {} as failed: {:#}", run_id, mark_err);
            }
            Err(e)
        }
    }
}

async fn process_run<S: SourceAdapter, L: MatchLogStore>(
    run: &mut MatchRun,
    source: &S,
    context: &MatcherContext,
    log_store: &L,
    options: &RunOptions,
    logger: &MatchingLogger,
    multi_progress: Option<&MultiProgress>,
) -> Result<RunReport> {
    logger.log_phase("Loading source records", None);
    let records = if options.unmatched_only {
        source.load_unmatched(options.limit).await?
    } else {
        source.load_all(options.limit).await?
    };
    logger.log_data_loaded(records.len(), source.source_system());

    let mut stats = MatchingStats::default();
    logger.log_phase("Cascade matching", None);
    let results = match_batch(context, &records, options.skip_fuzzy, &mut stats, logger, multi_progress);

    logger.log_phase("Writing match log", None);
    let mut writer = MatchLogWriter::new(log_store, context.config().log_flush_size);
    let mut entries = Vec::new();
    for result in &results {
        run.record(result);
        if let Some(entry) = MatchLogEntry::from_result(&run.run_id, source.source_system(), result) {
            entries.push(entry.clone());
            writer.push(entry).await?;
        }
    }
    let (_, log_inserted) = writer.finish().await?;

    let mut superseded = 0;
    let mut legacy_written = 0;
    if options.save {
        logger.log_phase("Superseding prior runs", None);
        let processed: Vec<String> = records.iter().map(|record| record.id.clone()).collect();
        superseded = log_store
            .supersede_prior(source.source_system(), &run.run_id, &processed)
            .await?;
        legacy_written = source.write_legacy(&results).await?;
    }

    run.finalize(results_digest(&results));
    log_store
        .finalize_run(run)
        .await
        .with_context(|| format!("Failed to finalize run {}", run.run_id))?;

    logger.log_completion(run);
    info!(
        "[{}] digest {}",
        run.scenario.to_uppercase(),
        run.results_digest.as_deref().unwrap_or_default()
    );

    Ok(RunReport {
        run: run.clone(),
        stats,
        results,
        entries,
        log_inserted,
        superseded,
        legacy_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_log::{InMemoryMatchLog, LogStatus};
    use crate::models::core::ReferenceEmployer;
    use crate::models::stats_models::RunStatus;
    use crate::reference::InMemoryReferenceStore;
    use crate::sources::InMemorySourceAdapter;
    use anyhow::anyhow;

    fn reference() -> InMemoryReferenceStore {
        let mut ein_row = ReferenceEmployer::new("E1", "Acme Corp", Some("CA"), Some("Oakland"));
        ein_row.ein = Some("123456789".to_string());
        InMemoryReferenceStore::new(vec![
            ein_row,
            ReferenceEmployer::new("E2", "Acme", Some("CA"), Some("San Francisco")),
            ReferenceEmployer::new("E3", "Acme", Some("CA"), Some("San Jose")),
            ReferenceEmployer::new("E4", "Riverside Medical Center", Some("NY"), Some("Albany")),
            ReferenceEmployer::new("E5", "Globex", Some("TX"), None),
            ReferenceEmployer::new("E6", "Globex", Some("TX"), None),
        ])
    }

    fn records() -> Vec<SourceRecord> {
        vec![
            SourceRecord::new("S1", "Acme Corporation").with_ein("12-3456789"),
            SourceRecord::new("S2", "Acme").with_state("CA").with_city("San Jose"),
            SourceRecord::new("S3", "Riverside Medical Centre").with_state("NY"),
            SourceRecord::new("S4", "Globex").with_state("TX"),
            SourceRecord::new("S5", "Unrelated Holdings").with_state("WA"),
        ]
    }

    async fn context() -> MatcherContext {
        build_context(&reference(), MatchConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_run_scenario_end_to_end() {
        let context = context().await;
        let source = InMemorySourceAdapter::new("osha", records());
        let log = InMemoryMatchLog::new();
        let options = RunOptions {
            save: true,
            ..Default::default()
        };

        let report = run_scenario("osha", &source, &context, &log, &options, None).await.unwrap();
        assert_eq!(report.results.len(), 5);
        assert_eq!(report.run.total_source, 5);
        assert_eq!(report.run.status, RunStatus::Completed);
        assert!(report.run.results_digest.is_some());

        let by_id = |id: &str| report.results.iter().find(|r| r.source_id == id).unwrap();
        assert_eq!(by_id("S1").target_id(), Some("E1"));
        assert_eq!(by_id("S1").method(), "EIN_EXACT");
        assert_eq!(by_id("S2").target_id(), Some("E3"));
        assert_eq!(by_id("S2").method(), "NAME_CITY_STATE_EXACT");
        assert!(by_id("S3").is_match());
        assert!(by_id("S4").is_ambiguous());
        assert!(!by_id("S5").is_match() && !by_id("S5").is_ambiguous());

        // No-match rows are counted but not logged.
        assert_eq!(report.entries.len(), 4);
        assert_eq!(report.log_inserted, 4);
        assert_eq!(log.entry_count().await, 4);
        let ambiguous = report.entries.iter().find(|e| e.source_id == "S4").unwrap();
        assert_eq!(ambiguous.status, LogStatus::Rejected);

        let legacy = source.legacy_rows().await;
        assert!(legacy.contains_key("S1") && legacy.contains_key("S2"));
        assert!(!legacy.contains_key("S4"));
    }

    #[tokio::test]
    async fn test_reruns_are_idempotent_and_supersede() {
        let context = context().await;
        let source = InMemorySourceAdapter::new("whd", records());
        let log = InMemoryMatchLog::new();
        let options = RunOptions {
            save: true,
            ..Default::default()
        };

        let first = run_scenario("whd", &source, &context, &log, &options, None).await.unwrap();
        let second = run_scenario("whd", &source, &context, &log, &options, None).await.unwrap();
        assert_ne!(first.run.run_id, second.run.run_id);
        assert_eq!(first.run.results_digest, second.run.results_digest);
        assert_eq!(first.results, second.results);
        assert_eq!(second.superseded, first.entries.len() as u64);

        let latest = log.recent_runs("whd", 2).await.unwrap();
        assert_eq!(latest[0].run_id, second.run.run_id);
    }

    fn status_of(entries: &[MatchLogEntry], source_id: &str) -> LogStatus {
        entries.iter().find(|e| e.source_id == source_id).unwrap().status
    }

    #[tokio::test]
    async fn test_unmatched_only_save_keeps_earlier_matches_active() {
        let context = context().await;
        let log = InMemoryMatchLog::new();
        let options = RunOptions {
            save: true,
            ..Default::default()
        };
        let full = InMemorySourceAdapter::new("osha", records());
        let first = run_scenario("osha", &full, &context, &log, &options, None).await.unwrap();

        let partial = InMemorySourceAdapter::new("osha", records()).with_matched(&["S1", "S2"]);
        let options = RunOptions {
            save: true,
            unmatched_only: true,
            ..Default::default()
        };
        let second = run_scenario("osha", &partial, &context, &log, &options, None).await.unwrap();
        assert_eq!(second.run.total_source, 3);
        // Only S3 (matched) and S4 (ambiguous) had rows to replace.
        assert_eq!(second.superseded, 2);

        let earlier = log.load_entries(&first.run.run_id).await.unwrap();
        assert_eq!(status_of(&earlier, "S1"), LogStatus::Active);
        assert_eq!(status_of(&earlier, "S2"), LogStatus::Active);
        assert_eq!(status_of(&earlier, "S3"), LogStatus::Superseded);
        assert_eq!(status_of(&earlier, "S4"), LogStatus::Superseded);
    }

    #[tokio::test]
    async fn test_limited_save_only_supersedes_loaded_records() {
        let context = context().await;
        let source = InMemorySourceAdapter::new("sec", records());
        let log = InMemoryMatchLog::new();
        let options = RunOptions {
            save: true,
            ..Default::default()
        };
        let first = run_scenario("sec", &source, &context, &log, &options, None).await.unwrap();

        let options = RunOptions {
            save: true,
            limit: Some(2),
            ..Default::default()
        };
        let second = run_scenario("sec", &source, &context, &log, &options, None).await.unwrap();
        assert_eq!(second.superseded, 2);

        let earlier = log.load_entries(&first.run.run_id).await.unwrap();
        assert_eq!(status_of(&earlier, "S1"), LogStatus::Superseded);
        assert_eq!(status_of(&earlier, "S2"), LogStatus::Superseded);
        assert_eq!(status_of(&earlier, "S3"), LogStatus::Active);
    }

    /// Delegates to the in-memory adapter but refuses the legacy write.
    struct BrokenLegacy(InMemorySourceAdapter);

    impl SourceAdapter for BrokenLegacy {
        fn source_system(&self) -> &str {
            self.0.source_system()
        }

        async fn load_unmatched(&self, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
            self.0.load_unmatched(limit).await
        }

        async fn load_all(&self, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
            self.0.load_all(limit).await
        }

        async fn write_legacy(&self, _matches: &[MatchResult]) -> Result<usize> {
            Err(anyhow!("legacy table is read-only"))
        }
    }

    #[tokio::test]
    async fn test_failed_save_marks_run_failed() {
        let context = context().await;
        let source = BrokenLegacy(InMemorySourceAdapter::new("990", records()));
        let log = InMemoryMatchLog::new();
        let options = RunOptions {
            save: true,
            ..Default::default()
        };

        let err = run_scenario("990", &source, &context, &log, &options, None)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("read-only"));

        let runs = log.recent_runs("990", 1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].completed_at.is_some());
        assert!(runs[0].results_digest.is_none());
    }

    #[tokio::test]
    async fn test_skip_fuzzy_and_dry_run() {
        let context = context().await;
        let source = InMemorySourceAdapter::new("sam", records());
        let log = InMemoryMatchLog::new();
        let options = RunOptions {
            save: false,
            skip_fuzzy: true,
            limit: Some(3),
            ..Default::default()
        };

        let report = run_scenario("sam", &source, &context, &log, &options, None).await.unwrap();
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.stats.fuzzy_candidates, 0);
        assert_eq!(report.superseded, 0);
        assert_eq!(report.legacy_written, 0);
        assert!(source.legacy_rows().await.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_only_skips_known_records() {
        let context = context().await;
        let source = InMemorySourceAdapter::new("bmf", records()).with_matched(&["S1", "S2"]);
        let log = InMemoryMatchLog::new();
        let options = RunOptions {
            unmatched_only: true,
            ..Default::default()
        };
        let report = run_scenario("bmf", &source, &context, &log, &options, None).await.unwrap();
        assert_eq!(report.run.total_source, 3);
        assert!(report.results.iter().all(|r| r.source_id != "S1" && r.source_id != "S2"));
    }
}
