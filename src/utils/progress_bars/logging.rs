// src/utils/progress_bars/logging.rs - Tagged logging helpers for scenario runs
use log::{error, info, warn};
use std::time::{Duration, Instant};

use crate::models::stats_models::{MatchRun, MatchingStats};

#[derive(Clone)]
pub struct MatchingLogger {
    tag: String,
    emoji: &'static str,
    start_time: Instant,
}

/// Emoji per registered scenario; unknown scenarios get a generic marker.
fn scenario_emoji(scenario: &str) -> &'static str {
    match scenario {
        "osha" => "🦺",
        "whd" => "💵",
        "990" => "🧾",
        "sam" => "🏛️",
        "sec" => "📈",
        "bmf" => "📇",
        _ => "⚙️",
    }
}

impl MatchingLogger {
    pub fn new(scenario: &str) -> Self {
        Self {
            tag: scenario.to_uppercase(),
            emoji: scenario_emoji(scenario),
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, run_id: &str, save: bool, skip_fuzzy: bool) {
        info!(
            "[{}] {} 🚀 Starting match run (run ID: {}){}",
            self.tag,
            self.emoji,
            run_id,
            if save { "" } else { " - dry run, nothing persisted" }
        );
        if skip_fuzzy {
            info!("[{}] {} ⏭️  Fuzzy pass disabled for this run", self.tag, self.emoji);
        }
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        match details {
            Some(details) => info!(
                "[{}] {} 🔄 Phase: {} - {} [+{:.1}s]",
                self.tag,
                self.emoji,
                phase,
                details,
                elapsed.as_secs_f32()
            ),
            None => info!(
                "[{}] {} 🔄 Phase: {} [+{:.1}s]",
                self.tag,
                self.emoji,
                phase,
                elapsed.as_secs_f32()
            ),
        }
    }

    pub fn log_data_loaded(&self, count: usize, data_type: &str) {
        info!("[{}] {} 📊 Found {} {} records", self.tag, self.emoji, count, data_type);
    }

    pub fn log_progress_update(&self, current: usize, total: usize, additional_info: Option<&str>) {
        // Every 5000 items, plus every 10%
        let should_log = current % 5000 == 0 || current == total || (total >= 100 && current % (total / 10) == 0);

        if should_log && current > 0 {
            let percent = (current as f64 / total as f64) * 100.0;
            let msg = match additional_info {
                Some(extra) => format!("Progress: {}/{} ({:.1}%) - {}", current, total, percent, extra),
                None => format!("Progress: {}/{} ({:.1}%)", current, total, percent),
            };
            info!("[{}] {} 📊 {}", self.tag, self.emoji, msg);
        }
    }

    pub fn log_cascade_summary(&self, stats: &MatchingStats) {
        info!(
            "[{}] {} 🎯 Cascade: {} records, {} matched, {} collisions resolved, {} ambiguous",
            self.tag,
            self.emoji,
            stats.records_processed,
            stats.cascade_matches,
            stats.collisions_resolved,
            stats.collisions_ambiguous
        );
        if stats.tier_errors > 0 {
            warn!(
                "[{}] {} ⚠️  {} tier lookups failed and were skipped",
                self.tag, self.emoji, stats.tier_errors
            );
        }
    }

    pub fn log_fuzzy_summary(&self, stats: &MatchingStats) {
        info!(
            "[{}] {} 🔍 Fuzzy: {} candidates, {} probabilistic matches, {} trigram matches",
            self.tag, self.emoji, stats.fuzzy_candidates, stats.probabilistic_matches, stats.trigram_matches
        );
    }

    pub fn log_completion(&self, run: &MatchRun) {
        let duration = self.start_time.elapsed();
        info!(
            "[{}] {} 🎉 COMPLETED run {} in {:.2?}: {}/{} matched ({:.1}%), {} ambiguous",
            self.tag,
            self.emoji,
            run.run_id,
            duration,
            run.total_matched,
            run.total_source,
            run.match_rate() * 100.0,
            run.total_ambiguous
        );
        info!(
            "[{}] {} 📊 Bands: {} HIGH, {} MEDIUM, {} LOW",
            self.tag, self.emoji, run.high_count, run.medium_count, run.low_count
        );
        for (method, count) in &run.method_counts {
            info!("[{}] {}    • {}: {}", self.tag, self.emoji, method, count);
        }
    }

    pub fn log_error(&self, message: &str) {
        error!("[{}] {} ❌ {}", self.tag, self.emoji, message);
    }
}

pub fn log_batch_start(run_all_id: &str, scenarios: &[&str], save: bool) {
    info!("🚀 ===== EMPLOYER MATCHING BATCH STARTING =====");
    info!("📅 Batch ID: {}", run_all_id);
    info!("🎯 Scenarios: {}", scenarios.join(", "));
    info!("💾 Persisting results: {}", if save { "yes" } else { "no (dry run)" });
    info!("================================================");
}

pub fn log_batch_completion(duration: Duration, runs: &[MatchRun], failures: &[(String, String)]) {
    info!("🎉 ===== EMPLOYER MATCHING BATCH COMPLETED =====");
    info!("⏱️  Total Duration: {:.2?}", duration);
    for run in runs {
        info!(
            "  ✅ {}: {}/{} matched ({:.1}%), {} ambiguous",
            run.scenario,
            run.total_matched,
            run.total_source,
            run.match_rate() * 100.0,
            run.total_ambiguous
        );
    }
    for (scenario, reason) in failures {
        error!("  ❌ {}: {}", scenario, reason);
    }
    info!("===============================================");
}
