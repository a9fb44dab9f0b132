use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::MultiProgress;
use log::{info, warn};
use std::time::Instant;
use uuid::Uuid;

use employer_match_lib::match_log::db::PgMatchLog;
use employer_match_lib::match_log::{InMemoryMatchLog, MatchLogStore};
use employer_match_lib::matching::index::MatcherContext;
use employer_match_lib::matching::manager::{build_context, match_batch, run_scenario, RunOptions, RunReport};
use employer_match_lib::models::core::SourceRecord;
use employer_match_lib::models::stats_models::{MatchRun, MatchingStats};
use employer_match_lib::reference::db::PgReferenceStore;
use employer_match_lib::reporting::diff::{diff_entries, diff_runs, DiffFormat};
use employer_match_lib::sources::db::PgSourceAdapter;
use employer_match_lib::sources::{scenario, scenario_names, ScenarioDefinition, SCENARIOS};
use employer_match_lib::utils::db_connect::{connect, get_pool_status, PgPool};
use employer_match_lib::utils::env::load_env;
use employer_match_lib::utils::get_memory_usage;
use employer_match_lib::utils::match_config::MatchConfig;
use employer_match_lib::utils::progress_bars::logging::{log_batch_completion, log_batch_start, MatchingLogger};
use employer_match_lib::utils::progress_bars::progress_config::ProgressConfig;

#[derive(Parser)]
#[command(author, version, about = "Resolve source records to reference employers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Match one scenario
    Run {
        scenario: String,
        /// Persist the log, supersede earlier runs and update the legacy table
        #[arg(long)]
        save: bool,
        /// Print drift against the previous saved run
        #[arg(long)]
        diff: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        skip_fuzzy: bool,
        /// Only records without an active match
        #[arg(long)]
        unmatched_only: bool,
    },
    /// Match every registered scenario in turn
    RunAll {
        #[arg(long)]
        save: bool,
        #[arg(long)]
        skip_fuzzy: bool,
    },
    /// Compare two runs of a scenario (defaults to the latest two)
    Diff {
        scenario: String,
        #[arg(long)]
        run_a: Option<String>,
        #[arg(long)]
        run_b: Option<String>,
        #[arg(long, value_enum, default_value_t = DiffFormat::Summary)]
        format: DiffFormat,
    },
    /// Match a single ad-hoc record and print the decision
    Test {
        scenario: String,
        name: String,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        ein: Option<String>,
        #[arg(long)]
        zip: Option<String>,
    },
    /// List recent runs of a scenario
    Runs {
        scenario: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

fn lookup_scenario(name: &str) -> Result<&'static ScenarioDefinition> {
    scenario(name).ok_or_else(|| anyhow!("Unknown scenario '{}'. Known: {}", name, scenario_names().join(", ")))
}

async fn load_context(pool: &PgPool) -> Result<MatcherContext> {
    let config = MatchConfig::from_env();
    config.log_config();
    build_context(&PgReferenceStore::new(pool.clone()), config).await
}

/// Runs one scenario, holding the per-source lock while a saving run writes.
async fn execute_run(
    pool: &PgPool,
    definition: &'static ScenarioDefinition,
    context: &MatcherContext,
    options: &RunOptions,
    multi_progress: Option<&MultiProgress>,
) -> Result<RunReport> {
    let source = PgSourceAdapter::new(pool.clone(), definition);
    if options.save {
        let log_store = PgMatchLog::new(pool.clone());
        let lock = log_store.try_lock_source(definition.source_system).await?;
        let result = run_scenario(definition.name, &source, context, &log_store, options, multi_progress).await;
        lock.release().await?;
        result
    } else {
        let log_store = InMemoryMatchLog::new();
        run_scenario(definition.name, &source, context, &log_store, options, multi_progress).await
    }
}

/// Diffs the fresh report against the newest other run stored for the scenario.
async fn print_drift(pool: &PgPool, report: &RunReport) -> Result<()> {
    let log_store = PgMatchLog::new(pool.clone());
    let previous = log_store
        .recent_runs(&report.run.scenario, 2)
        .await?
        .into_iter()
        .find(|run| run.run_id != report.run.run_id);
    let Some(previous) = previous else {
        warn!("No earlier run of {} to diff against", report.run.scenario);
        return Ok(());
    };
    let before = log_store.load_entries(&previous.run_id).await?;
    let diff = diff_entries(
        &report.run.scenario,
        &previous.run_id,
        &before,
        &report.run.run_id,
        &report.entries,
    );
    println!("{}", diff.render(DiffFormat::Summary)?);
    Ok(())
}

fn print_runs(runs: &[MatchRun]) {
    println!(
        "{:<38} {:<25} {:<10} {:>8} {:>8} {:>9} {:>6} {:>6} {:>6}",
        "run_id", "started_at", "status", "source", "matched", "ambiguous", "high", "medium", "low"
    );
    for run in runs {
        println!(
            "{:<38} {:<25} {:<10} {:>8} {:>8} {:>9} {:>6} {:>6} {:>6}",
            run.run_id,
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.status.as_str(),
            run.total_source,
            run.total_matched,
            run.total_ambiguous,
            run.high_count,
            run.medium_count,
            run.low_count
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();

    let progress_config = ProgressConfig::from_env();
    let multi_progress = progress_config.create_multi_progress();
    let start = Instant::now();

    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");

    match cli.command {
        Command::Run {
            scenario,
            save,
            diff,
            limit,
            skip_fuzzy,
            unmatched_only,
        } => {
            let definition = lookup_scenario(&scenario)?;
            let context = load_context(&pool).await?;
            let options = RunOptions {
                save,
                limit,
                skip_fuzzy,
                unmatched_only,
            };
            let report = execute_run(&pool, definition, &context, &options, multi_progress.as_ref()).await?;
            info!(
                "Run {}: {} log rows inserted, {} superseded, {} legacy rows written",
                report.run.run_id, report.log_inserted, report.superseded, report.legacy_written
            );
            if diff {
                print_drift(&pool, &report).await?;
            }
        }
        Command::RunAll { save, skip_fuzzy } => {
            let batch_id = Uuid::new_v4().to_string();
            log_batch_start(&batch_id, &scenario_names(), save);
            let context = load_context(&pool).await?;
            let options = RunOptions {
                save,
                skip_fuzzy,
                ..Default::default()
            };

            let mut runs = Vec::new();
            let mut failures = Vec::new();
            for definition in SCENARIOS.iter() {
                match execute_run(&pool, definition, &context, &options, multi_progress.as_ref()).await {
                    Ok(report) => runs.push(report.run),
                    Err(e) => {
                        MatchingLogger::new(definition.name).log_error(&format!("{:#}", e));
                        failures.push((definition.name.to_string(), format!("{:#}", e)));
                    }
                }
            }
            log_batch_completion(start.elapsed(), &runs, &failures);
            if !failures.is_empty() {
                return Err(anyhow!("{} of {} scenarios failed", failures.len(), SCENARIOS.len()));
            }
        }
        Command::Diff {
            scenario,
            run_a,
            run_b,
            format,
        } => {
            lookup_scenario(&scenario)?;
            let log_store = PgMatchLog::new(pool.clone());
            let diff = diff_runs(&log_store, &scenario, run_a.as_deref(), run_b.as_deref()).await?;
            println!("{}", diff.render(format)?);
        }
        Command::Test {
            scenario,
            name,
            state,
            city,
            ein,
            zip,
        } => {
            lookup_scenario(&scenario)?;
            let context = load_context(&pool).await?;
            let record = SourceRecord {
                state,
                city,
                ein,
                zip,
                ..SourceRecord::new("test", name)
            };
            let logger = MatchingLogger::new(&scenario);
            let mut stats = MatchingStats::default();
            let results = match_batch(&context, std::slice::from_ref(&record), false, &mut stats, &logger, None);
            for result in &results {
                println!(
                    "{}",
                    serde_json::to_string_pretty(result).context("Failed to serialize match result")?
                );
            }
        }
        Command::Runs { scenario, count } => {
            lookup_scenario(&scenario)?;
            let log_store = PgMatchLog::new(pool.clone());
            print_runs(&log_store.recent_runs(&scenario, count).await?);
        }
    }

    if progress_config.should_show_memory() {
        info!("Final memory usage: {} MB", get_memory_usage().await);
    }
    let (connections, idle, in_use) = get_pool_status(&pool);
    info!(
        "Final DB Connection Pool Status: Total: {}, Idle: {}, In Use: {}",
        connections, idle, in_use
    );
    info!("Finished in {:.2?}", start.elapsed());
    Ok(())
}
