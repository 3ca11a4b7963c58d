use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use tracing::{error, info};

use budget_reconcile::config::AppConfig;
use budget_reconcile::logging::init_tracing;
use budget_reconcile::pipeline::{collect_stats, migrate_corrections, rebuild_corrections};
use budget_reconcile::{run_pipeline, CacheOrigin, PipelineOptions, StdinSource, VERSION};

#[derive(Parser)]
#[command(name = "budget-reconcile", version, about = "Budget plan ↔ cost-center key reconciliation")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, value_name = "PATH", env = "BUDGET_RECONCILE_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, correct, enrich and persist
    Run {
        /// Prompt for every key that still fails to match
        #[arg(long)]
        interactive_mode: bool,

        /// Ignore the source cache and re-extract
        #[arg(long)]
        no_cache: bool,

        /// Also export matched rows to this CSV file
        #[arg(long, value_name = "PATH")]
        csv_out: Option<PathBuf>,
    },
    /// Replace the SQL correction table with the JSON map
    Migrate {
        /// JSON map to migrate (defaults to the configured one)
        #[arg(long, value_name = "PATH")]
        from: Option<PathBuf>,
    },
    /// Rebuild the correction map from the enriched output table
    Rebuild,
    /// Show correction map, cache and output state
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let log_path = init_tracing(&config.logs_dir_path(), cli.verbose).context("Failed to initialise logging")?;

    info!("--- budget-reconcile v{} starting ---", VERSION);
    if let Some(path) = &cli.config {
        info!("Configuration loaded from '{}'", path.display());
    }
    info!(
        "Data dir: {} | corrections: {} | log: {}",
        config.data_dir.display(),
        config.corrections.backend,
        log_path.display()
    );

    let result = match cli.command {
        Commands::Run {
            interactive_mode,
            no_cache,
            csv_out,
        } => run(&config, interactive_mode, no_cache, csv_out),
        Commands::Migrate { from } => migrate(&config, from),
        Commands::Rebuild => rebuild(&config),
        Commands::Stats => stats(&config),
    };

    if let Err(e) = &result {
        error!("Run failed: {:#}", e);
    }
    info!("--- end of run ---");
    result
}

fn run(config: &AppConfig, interactive: bool, no_cache: bool, csv_out: Option<PathBuf>) -> Result<()> {
    let options = PipelineOptions {
        interactive,
        refresh_cache: no_cache,
        csv_out,
    };

    let mut input = StdinSource::new();
    let mut stdout = io::stdout();
    let outcome = run_pipeline(config, &options, &mut input, &mut stdout).context("Pipeline failed")?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let origin = match outcome.cache_origin {
        CacheOrigin::Cache => "cache",
        CacheOrigin::Extracted => "sources",
        CacheOrigin::Rebuilt => "sources (cache rebuilt)",
    };
    println!("📂 Budget rows: {} (from {})", outcome.budget_rows, origin);
    println!("🩹 Rows corrected by the map: {}", outcome.corrected_rows);
    println!("✓ Matched: {}", outcome.matched_rows);
    println!(
        "💾 Output table: {} rows ({} new, {} retired)",
        outcome.persisted_rows, outcome.inserted_rows, outcome.retired_rows
    );
    if let Some(rows) = outcome.exported_rows {
        println!("📄 Rows exported to CSV: {}", rows);
    }

    if outcome.unmatched_rows == 0 {
        println!("✅ Every budget row has a cost center");
    } else {
        println!(
            "⚠️  Unmatched: {} rows, {} distinct keys",
            outcome.unmatched_rows,
            outcome.residual_keys.len()
        );
        match &outcome.session {
            Some(session) => println!(
                "🧑‍⚖️ Session: {} accepted, {} skipped, {} already known (applied on the next run)",
                session.accepted, session.skipped, session.already_known
            ),
            None => println!("   Run with --interactive-mode to correct them"),
        }
    }

    Ok(())
}

fn migrate(config: &AppConfig, from: Option<PathBuf>) -> Result<()> {
    let migrated = migrate_corrections(config, from.as_deref()).context("Migration failed")?;
    println!("✅ {} corrections written to {}", migrated, config.sql_map_path().display());
    Ok(())
}

fn rebuild(config: &AppConfig) -> Result<()> {
    let rebuilt = rebuild_corrections(config).context("Rebuild failed")?;
    println!(
        "✅ Correction map ({}) rebuilt with {} entries",
        config.corrections.backend, rebuilt
    );
    Ok(())
}

fn stats(config: &AppConfig) -> Result<()> {
    let stats = collect_stats(config).context("Failed to collect stats")?;

    println!("📊 Correction map ({}): {} entries", stats.backend, stats.corrections);
    match stats.orphaned {
        Some(orphaned) => println!("   Orphaned (target missing from reference): {}", orphaned),
        None => println!("   Orphaned: unknown (no cached reference)"),
    }
    println!(
        "💾 Source cache: {}",
        if stats.cache_present { "present" } else { "absent" }
    );
    match stats.enriched_rows {
        Some(rows) => println!("📄 Enriched output rows: {}", rows),
        None => println!("📄 Enriched output: not created yet"),
    }
    if let Some(event) = &stats.last_run {
        println!(
            "🕒 Last run: {} ({} rows written, {} new, {} retired)",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.data["written"],
            event.data["added"],
            event.data["retired"]
        );
    }
    Ok(())
}
