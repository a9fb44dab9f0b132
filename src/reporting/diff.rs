// src/reporting/diff.rs - Drift report between two runs of one scenario
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::match_log::{MatchLogEntry, MatchLogStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DiffFormat {
    Summary,
    Markdown,
    Json,
}

/// One side of a link as it appeared in a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkSnapshot {
    pub target_id: String,
    pub method: String,
    pub confidence_band: String,
    pub score: f64,
}

impl From<&MatchLogEntry> for LinkSnapshot {
    fn from(entry: &MatchLogEntry) -> Self {
        Self {
            target_id: entry.target_id.clone(),
            method: entry.method.clone(),
            confidence_band: entry.confidence_band.as_str().to_string(),
            score: entry.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangedLink {
    pub source_id: String,
    pub before: LinkSnapshot,
    pub after: LinkSnapshot,
    /// True when the record now points at a different employer; false when
    /// only the method or band moved.
    pub target_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDiff {
    pub scenario: String,
    pub run_a: String,
    pub run_b: String,
    pub new_links: Vec<(String, LinkSnapshot)>,
    pub lost_links: Vec<(String, LinkSnapshot)>,
    pub changed_links: Vec<ChangedLink>,
    pub unchanged: usize,
}

fn by_source(entries: &[MatchLogEntry]) -> BTreeMap<&str, &MatchLogEntry> {
    // One result per source per run; keep the highest-ranked row if a log was hand-edited.
    let mut map: BTreeMap<&str, &MatchLogEntry> = BTreeMap::new();
    for entry in entries {
        map.entry(entry.source_id.as_str())
            .and_modify(|current| {
                if entry.tier_rank > current.tier_rank {
                    *current = entry;
                }
            })
            .or_insert(entry);
    }
    map
}

/// Compares run A (older) against run B (newer).
pub fn diff_entries(scenario: &str, run_a: &str, a: &[MatchLogEntry], run_b: &str, b: &[MatchLogEntry]) -> RunDiff {
    let before = by_source(a);
    let after = by_source(b);

    let mut diff = RunDiff {
        scenario: scenario.to_string(),
        run_a: run_a.to_string(),
        run_b: run_b.to_string(),
        new_links: Vec::new(),
        lost_links: Vec::new(),
        changed_links: Vec::new(),
        unchanged: 0,
    };

    for (source_id, old) in &before {
        match after.get(source_id) {
            None => diff.lost_links.push((source_id.to_string(), LinkSnapshot::from(*old))),
            Some(new) => {
                let target_changed = old.target_id != new.target_id;
                if target_changed || old.method != new.method || old.confidence_band != new.confidence_band {
                    diff.changed_links.push(ChangedLink {
                        source_id: source_id.to_string(),
                        before: LinkSnapshot::from(*old),
                        after: LinkSnapshot::from(*new),
                        target_changed,
                    });
                } else {
                    diff.unchanged += 1;
                }
            }
        }
    }
    for (source_id, new) in &after {
        if !before.contains_key(source_id) {
            diff.new_links.push((source_id.to_string(), LinkSnapshot::from(*new)));
        }
    }
    diff
}

/// Loads both runs and diffs them. Without explicit ids the two most recent
/// runs of the scenario are compared.
pub async fn diff_runs<L: MatchLogStore>(
    store: &L,
    scenario: &str,
    run_a: Option<&str>,
    run_b: Option<&str>,
) -> Result<RunDiff> {
    let (run_a, run_b) = match (run_a, run_b) {
        (Some(a), Some(b)) => (a.to_string(), b.to_string()),
        (None, None) => {
            let runs = store.recent_runs(scenario, 2).await?;
            if runs.len() < 2 {
                bail!("Scenario '{}' has {} recorded run(s); need two to diff", scenario, runs.len());
            }
            (runs[1].run_id.clone(), runs[0].run_id.clone())
        }
        _ => bail!("Pass both --run-a and --run-b, or neither"),
    };

    let a = store
        .load_entries(&run_a)
        .await
        .with_context(|| format!("Failed to load run {}", run_a))?;
    let b = store
        .load_entries(&run_b)
        .await
        .with_context(|| format!("Failed to load run {}", run_b))?;
    Ok(diff_entries(scenario, &run_a, &a, &run_b, &b))
}

impl RunDiff {
    pub fn retargeted(&self) -> usize {
        self.changed_links.iter().filter(|change| change.target_changed).count()
    }

    pub fn render(&self, format: DiffFormat) -> Result<String> {
        match format {
            DiffFormat::Summary => Ok(self.render_summary()),
            DiffFormat::Markdown => Ok(self.render_markdown()),
            DiffFormat::Json => serde_json::to_string_pretty(self).context("Failed to serialize run diff"),
        }
    }

    fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Diff for {}: {} -> {}", self.scenario, self.run_a, self.run_b);
        let _ = writeln!(out, "  new links:     {}", self.new_links.len());
        let _ = writeln!(out, "  lost links:    {}", self.lost_links.len());
        let _ = writeln!(
            out,
            "  changed links: {} ({} retargeted)",
            self.changed_links.len(),
            self.retargeted()
        );
        let _ = writeln!(out, "  unchanged:     {}", self.unchanged);
        out
    }

    fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Match drift: `{}`\n", self.scenario);
        let _ = writeln!(out, "Run A `{}` vs run B `{}`\n", self.run_a, self.run_b);
        let _ = writeln!(out, "| Change | Count |\n|---|---|");
        let _ = writeln!(out, "| New | {} |", self.new_links.len());
        let _ = writeln!(out, "| Lost | {} |", self.lost_links.len());
        let _ = writeln!(out, "| Changed | {} |", self.changed_links.len());
        let _ = writeln!(out, "| Unchanged | {} |", self.unchanged);

        if !self.changed_links.is_empty() {
            let _ = writeln!(out, "\n### Changed\n\n| Source | Before | After |\n|---|---|---|");
            for change in &self.changed_links {
                let _ = writeln!(
                    out,
                    "| {} | {} ({}, {}) | {} ({}, {}) |",
                    change.source_id,
                    change.before.target_id,
                    change.before.method,
                    change.before.confidence_band,
                    change.after.target_id,
                    change.after.method,
                    change.after.confidence_band
                );
            }
        }
        for (title, links) in [("New", &self.new_links), ("Lost", &self.lost_links)] {
            if links.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n### {}\n\n| Source | Target | Method | Band |\n|---|---|---|---|", title);
            for (source_id, link) in links {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} |",
                    source_id, link.target_id, link.method, link.confidence_band
                );
            }
        }
        out
    }
}
