// src/bin/build_canonical_groups.rs
use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::time::Instant;

use employer_match_lib::clustering::canonical_groups::{build_canonical_groups, GrouperConfig};
use employer_match_lib::reference::db::PgReferenceStore;
use employer_match_lib::reference::ReferenceStore;
use employer_match_lib::utils::db_connect::connect;
use employer_match_lib::utils::env::load_env;
use employer_match_lib::utils::get_memory_usage;
use employer_match_lib::utils::progress_bars::progress_config::ProgressConfig;

#[derive(Parser)]
#[command(author, version, about = "Rebuild canonical employer groups", long_about = None)]
struct GrouperArgs {
    /// Distinct states required for a cross-state group
    #[arg(long)]
    min_states: Option<usize>,

    /// Token-set ratio (0-100) for the fuzzy post-merge
    #[arg(long)]
    fuzzy_ratio: Option<f64>,

    /// Compute and report groups without writing them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let args = GrouperArgs::parse();
    let start = Instant::now();

    let mut config = GrouperConfig::from_env();
    if let Some(min_states) = args.min_states {
        config.min_states = min_states.max(2);
    }
    if let Some(ratio) = args.fuzzy_ratio {
        config.fuzzy_merge_ratio = ratio;
    }
    config.log_config();

    let pool = connect().await.context("Failed to connect to database")?;
    let store = PgReferenceStore::new(pool);
    let employers = store.load_reference().await?;

    let outcome = build_canonical_groups(&employers, &config);
    let largest = outcome.groups.iter().max_by_key(|group| group.member_count);
    if let Some(group) = largest {
        info!(
            "Largest group: '{}' ({} members across {})",
            group.canonical_name,
            group.member_count,
            group.states.join("/")
        );
    }

    if args.dry_run {
        info!("Dry run: {} groups computed, nothing written", outcome.groups.len());
    } else {
        let assigned = store.replace_canonical_groups(&outcome).await?;
        info!("Canonical groups rebuilt: {} groups, {} rows assigned", outcome.groups.len(), assigned);
    }

    if ProgressConfig::from_env().should_show_memory() {
        info!("Final memory usage: {} MB", get_memory_usage().await);
    }
    info!("Finished in {:.2?}", start.elapsed());
    Ok(())
}
