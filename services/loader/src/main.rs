//! Loader Service - Runs source pipelines into the energy star schema
//!
//! Responsibilities:
//! - Read raw payloads collected per source
//! - Validate, derive and map them to normalized records
//! - Resolve dimensions and upsert facts
//! - Record every run in etl_runs
//!
//! Loads are idempotent: same payload + same code = same warehouse state

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use loader::pipeline::{LoadOptions, RunReport};
use loader::runner::{discover_jobs, run_job, run_sources, SourceJob};
use loader::seed::{generate_territorio_records, generate_tiempo_records};
use loader::store::{DimensionStore, MemoryWarehouse, PgWarehouse, Warehouse};
use loader::{DataPath, Registry, Settings, Table};

/// Months seeded into the throwaway warehouse of a dry run.
const DRY_RUN_YEARS: (i32, i32) = (2000, 2040);

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Transforms raw energy data and loads the star schema")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one source over the given payloads
    Run {
        #[arg(long)]
        source_id: String,

        /// Raw payload files (json, csv, xls/xlsx)
        #[arg(long, num_args = 1.., required = true)]
        input: Vec<PathBuf>,

        /// Dry run - load into memory instead of the database
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
    /// Run every registered source found under the raw directory
    RunAll {
        /// Raw directory with one sub-directory per source id (default RAW_FS_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
    /// Insert one dim_tiempo row per month
    SeedTiempo {
        #[arg(long, default_value = "2010")]
        start_year: i32,

        #[arg(long, default_value = "2036")]
        end_year: i32,
    },
    /// Insert dim_territorios rows from a DIVIPOLA municipality list
    SeedTerritorios {
        #[arg(long)]
        input: PathBuf,
    },
    /// Apply the schema migrations
    Migrate,
    /// List registered sources
    Sources,
}

async fn connect(settings: &Settings) -> Result<PgWarehouse> {
    let db_url = settings.db_url()?;
    PgWarehouse::connect(db_url, settings.db_max_connections)
        .await
        .context("Failed to connect to database")
}

async fn dry_run_warehouse() -> Result<MemoryWarehouse> {
    let store = MemoryWarehouse::new();
    let months = generate_tiempo_records(DRY_RUN_YEARS.0, DRY_RUN_YEARS.1, Utc::now().date_naive());
    store.seed_tiempo(&months).await?;
    Ok(store)
}

fn print_report(report: &RunReport) {
    println!("\n--- {} ---", report.source_id);
    println!("Status: {}", report.status.as_str());
    if let Some(run_id) = report.run_id {
        println!("Run ID: {}", run_id);
    }
    println!(
        "Rows: {} total, {} valid, {} invalid ({:.1}% ok)",
        report.transform.total,
        report.transform.valid,
        report.transform.invalid,
        report.transform.success_percentage()
    );
    for (category, count) in &report.error_categories {
        println!("  {} x{}", category, count);
    }
    if let Some(load) = &report.load {
        println!("Inserted: {}", load.inserted);
        println!(
            "Skipped: {} without tiempo, {} without other dimensions",
            load.skipped_no_tiempo,
            load.skipped_no_dimension()
        );
        println!("Load errors: {}", load.errors);
        println!("Campos created: {}", load.resolver_stats.campos_created_range);
    }
    println!("{}", report.message);
}

async fn run_single<S: Warehouse + ?Sized>(
    store: &S,
    registry: &Registry,
    job: SourceJob,
    options: &LoadOptions,
) -> Result<()> {
    let report = run_job(store, registry, &job, options).await;
    print_report(&report);
    if report.status == loader::LoadStatus::Error {
        anyhow::bail!("source {} failed: {}", report.source_id, report.message);
    }
    Ok(())
}

async fn run_all<S: Warehouse + ?Sized + 'static>(
    store: Arc<S>,
    registry: Arc<Registry>,
    settings: &Settings,
    dir: PathBuf,
) -> Result<()> {
    let jobs = discover_jobs(&dir, &registry)
        .await
        .with_context(|| format!("Failed to scan {}", dir.display()))?;
    println!("Raw dir: {}", dir.display());
    println!("Jobs: {} (max {} workers)", jobs.len(), settings.max_workers);

    let reports = run_sources(
        store,
        registry,
        jobs,
        settings.load_options(),
        settings.max_workers,
    )
    .await;
    for report in &reports {
        print_report(report);
    }

    let failed = reports
        .iter()
        .filter(|r| r.status == loader::LoadStatus::Error)
        .count();
    println!("\n{} sources, {} failed", reports.len(), failed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::from_env().context("Invalid loader settings")?;
    let registry = Registry::builtin();

    println!("=== Energy Loader ===");

    match args.command {
        Command::Run {
            source_id,
            input,
            dry_run,
        } => {
            println!("Source: {}", source_id);
            println!("Mode: {}", if dry_run { "dry-run" } else { "live" });
            let job = SourceJob {
                source_id,
                files: input,
            };
            let options = settings.load_options();
            if dry_run {
                let store = dry_run_warehouse().await?;
                run_single(&store, &registry, job, &options).await?;
                println!("\nDry run - nothing saved to database");
            } else {
                let store = connect(&settings).await?;
                run_single(&store, &registry, job, &options).await?;
            }
        }
        Command::RunAll { dir, dry_run } => {
            let dir = dir.unwrap_or_else(|| settings.raw_fs_dir.clone());
            println!("Mode: {}", if dry_run { "dry-run" } else { "live" });
            let registry = Arc::new(registry);
            if dry_run {
                let store = Arc::new(dry_run_warehouse().await?);
                run_all(store, registry, &settings, dir).await?;
            } else {
                let store = Arc::new(connect(&settings).await?);
                run_all(store, registry, &settings, dir).await?;
            }
        }
        Command::SeedTiempo {
            start_year,
            end_year,
        } => {
            if start_year > end_year {
                anyhow::bail!("start year {} is after end year {}", start_year, end_year);
            }
            let store = connect(&settings).await?;
            let months = generate_tiempo_records(start_year, end_year, Utc::now().date_naive());
            let inserted = store
                .seed_tiempo(&months)
                .await
                .context("Failed to seed dim_tiempo")?;
            println!(
                "dim_tiempo: {} months generated ({}-{}), {} inserted",
                months.len(),
                start_year,
                end_year,
                inserted
            );
        }
        Command::SeedTerritorios { input } => {
            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let name = input.to_string_lossy();
            let table = Table::from_bytes(&name, &bytes, &DataPath::Root)
                .context("Failed to parse DIVIPOLA file")?;
            let places = generate_territorio_records(&table);
            let store = connect(&settings).await?;
            let inserted = store
                .seed_territorios(&places)
                .await
                .context("Failed to seed dim_territorios")?;
            println!(
                "dim_territorios: {} places read, {} inserted",
                places.len(),
                inserted
            );
        }
        Command::Migrate => {
            let store = connect(&settings).await?;
            store.migrate().await.context("Failed to run migrations")?;
            println!("Migrations applied");
        }
        Command::Sources => {
            println!("\nRegistered sources:");
            for source in registry.iter() {
                let config = source.config();
                println!("  - {} -> {}", config.source_id, config.fact_mapping.fact_table);
                if !config.description.is_empty() {
                    println!("      {}", config.description);
                }
            }
        }
    }

    Ok(())
}
