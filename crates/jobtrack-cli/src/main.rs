use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobtrack_storage::{PgPostingStore, PostingStore, StoreConfig};
use jobtrack_sync::{build_scheduler, ConfigError, IngestConfig, IngestPipeline, RunSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobtrack")]
#[command(about = "Job posting ingestion and tracking")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over every keyword and location.
    Sync {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run ingestion on the SYNC_CRON_1 / SYNC_CRON_2 schedule until ctrl-c.
    Schedule,
    Migrate,
    /// Serve the annotation API.
    Serve,
    /// Total postings and per-source counts.
    Counts,
    CheckEnv,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::CheckEnv => check_env(),
        command => {
            let ingest = ingest_config_for(&command, |key| std::env::var(key).ok())?;
            let store = PgPostingStore::connect(&StoreConfig::from_env()).await?;
            let result = run(command, ingest, &store).await;
            store.close().await;
            result
        }
    }
}

/// Ingest settings for the commands that run the pipeline, resolved before any database work.
fn ingest_config_for<F>(command: &Commands, lookup: F) -> Result<Option<IngestConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match command {
        Commands::Sync { .. } | Commands::Schedule => IngestConfig::from_lookup(lookup).map(Some),
        _ => Ok(None),
    }
}

async fn run(command: Commands, ingest: Option<IngestConfig>, store: &PgPostingStore) -> Result<()> {
    match command {
        Commands::Sync { json } => {
            let config = ingest.context("ingest config not loaded")?;
            store.run_migrations().await?;
            let pipeline = IngestPipeline::from_config(&config, Arc::new(store.clone()))?;
            let summary = pipeline.run_once().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Schedule => {
            let config = ingest.context("ingest config not loaded")?;
            store.run_migrations().await?;
            let pipeline = Arc::new(IngestPipeline::from_config(&config, Arc::new(store.clone()))?);
            let crons = [config.sync_cron_1.clone(), config.sync_cron_2.clone()];
            let mut sched = build_scheduler(pipeline, &crons).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron_1 = %crons[0], cron_2 = %crons[1], "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            store.run_migrations().await?;
            let state = jobtrack_web::AppState::new(Arc::new(store.clone()));
            jobtrack_web::serve(state, jobtrack_web::port_from_env()).await?;
        }
        Commands::Counts => {
            let counts = store.counts_by_source().await?;
            let total: i64 = counts.iter().map(|c| c.count).sum();
            println!("total postings: {total}");
            for row in counts {
                println!("  {:<12} {}", row.source, row.count);
            }
        }
        Commands::CheckEnv => check_env()?,
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for pair in &summary.pairs {
        println!(
            "{} @ {}: raw={} processed={} upserted_or_matched={} inserted={}",
            pair.keyword,
            pair.location,
            pair.raw_results,
            pair.processed,
            pair.upserted_or_matched,
            pair.inserted
        );
    }
    for failure in &summary.failed_queries {
        println!("{} @ {}: FAILED ({})", failure.keyword, failure.location, failure.error);
    }
    println!(
        "sync complete: run_id={} processed={} upserted_or_matched={} inserted={} failed_queries={} failed_upserts={}",
        summary.run_id,
        summary.total_processed(),
        summary.total_upserted_or_matched(),
        summary.total_inserted(),
        summary.failed_queries.len(),
        summary.total_failed_upserts()
    );
}

fn check_env() -> Result<()> {
    let present = |key: &str| {
        if std::env::var(key).map(|v| !v.trim().is_empty()).unwrap_or(false) {
            "set"
        } else {
            "unset"
        }
    };
    let store = StoreConfig::from_env();
    println!("SERPAPI_KEY: {}", present("SERPAPI_KEY"));
    println!("DATABASE_URL: {}", present("DATABASE_URL"));
    println!("DB_NAME: {}", store.db_name.as_deref().unwrap_or("(from url)"));
    println!("COLL_NAME: {}", store.collection);

    match IngestConfig::from_env() {
        Ok(config) => {
            println!("KEYWORDS: {}", config.keywords.join(", "));
            println!("LOCATIONS: {}", config.locations.join(" | "));
            println!("SYNC_CRON: {} / {}", config.sync_cron_1, config.sync_cron_2);
            if let Some(path) = &config.quality_rules_path {
                jobtrack_adapters::QualityRules::from_yaml_path(path)?;
                println!("JOBTRACK_QUALITY_RULES: {} (ok)", path.display());
            }
        }
        Err(err) => println!("ingest config: {err}"),
    }
    Ok(())
}
