//! Model Scout - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use model_scout::api::models::ModelVersion;
use model_scout::api::{ApiClient, ReqwestTransport};
use model_scout::batch::{BatchCoordinator, BatchTask};
use model_scout::config::ScoutConfig;
use model_scout::enricher::VersionEnricher;
use model_scout::scanner::{self, FileOrganizer, ModelProcessor, ProcessorOptions};
use model_scout::metrics;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "model-scout")]
#[command(about = "Fetch registry metadata and previews for local model files", long_about = None)]
#[command(version)]
struct Cli {
    /// Model files or directories to scan
    paths: Vec<PathBuf>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Bypass the response cache and re-download previews
    #[arg(short, long)]
    force_refresh: bool,

    /// Log what would be written without touching the filesystem
    #[arg(long)]
    dry_run: bool,

    /// Reuse existing metadata sidecars
    #[arg(long)]
    skip_existing: bool,

    /// Only process files without a metadata sidecar
    #[arg(long)]
    only_missing: bool,

    /// Skip parent model enrichment
    #[arg(long)]
    no_enrich: bool,

    /// Clear the response cache before running
    #[arg(long)]
    clear_cache: bool,

    /// Forget parent models remembered as failed
    #[arg(long)]
    clear_failed: bool,

    /// Copy, move or link processed files into an organized directory
    #[arg(long)]
    organize: bool,

    /// Target directory for --organize (default: `organized/` beside each file)
    #[arg(long)]
    organize_dir: Option<PathBuf>,

    /// Print Prometheus metrics when done
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
    }

    // Load configuration
    let mut config = ScoutConfig::load(cli.config.as_deref())?;
    if cli.dry_run {
        config.output.dry_run = true;
    }
    if cli.skip_existing {
        config.output.skip_existing = true;
    }
    if cli.organize {
        config.organize.enabled = true;
    }
    if let Some(dir) = cli.organize_dir {
        config.organize.output_dir = Some(dir);
    }
    config.validate()?;

    let prometheus_handle = if cli.metrics {
        Some(metrics::setup_metrics()?)
    } else {
        None
    };

    let transport =
        ReqwestTransport::new(&config.transport_config()).context("Failed to build HTTP client")?;
    let client = Arc::new(ApiClient::new(config.client_settings(), Arc::new(transport)));
    let enricher = VersionEnricher::new(client.clone(), &config.scanner.cache_dir);

    if cli.clear_cache {
        if let Some(cache) = client.cache() {
            cache.clear().await;
        }
        tracing::info!(dir = ?config.scanner.cache_dir, "Cleared response cache");
    }
    if cli.clear_failed {
        enricher.clear_failed_cache().await;
    }

    if cli.paths.is_empty() {
        if !cli.clear_cache && !cli.clear_failed {
            anyhow::bail!("No paths given");
        }
        return Ok(());
    }

    // Discover model files
    let mut files = Vec::new();
    for path in &cli.paths {
        files.extend(scanner::find_model_files(
            path,
            &config.scanner.patterns,
            config.scanner.recursive,
        )?);
    }
    files.sort();
    files.dedup();
    if cli.only_missing {
        files = scanner::without_metadata(files);
    }

    if files.is_empty() {
        tracing::warn!("No model files found");
        return Ok(());
    }

    tracing::info!(
        files = files.len(),
        workers = config.workers(),
        dry_run = config.output.dry_run,
        "Starting Model Scout"
    );

    let tasks: Vec<BatchTask> = files
        .into_iter()
        .map(|file| BatchTask {
            verify_hash: config.scanner.verify_hash,
            force_refresh: cli.force_refresh,
            ..BatchTask::new(file)
        })
        .collect();

    let processor = Arc::new(ModelProcessor::new(
        client.clone(),
        ProcessorOptions::from(&config),
    ));
    let coordinator = BatchCoordinator::new(config.batch.batch_size, config.workers());
    let report = processor.process_files(&coordinator, tasks).await.sorted();

    // Enrich with parent models, then rewrite the affected sidecars
    if !cli.no_enrich {
        let mut versions: HashMap<PathBuf, ModelVersion> = report
            .results
            .iter()
            .filter_map(|(label, version)| Some((PathBuf::from(label), version.clone()?)))
            .collect();

        let stats = enricher.enrich_batch(&mut versions, cli.force_refresh).await;
        tracing::info!(?stats, "Enrichment finished");

        if config.output.save_metadata {
            for path in &stats.enriched_paths {
                let Some(version) = versions.get(path) else {
                    continue;
                };
                if let Err(e) = processor.save_metadata(path, version).await {
                    tracing::error!(file = ?path, error = %e, "Failed to save enriched metadata");
                }
            }
        }
    }

    if config.organize.enabled {
        let organizer = FileOrganizer::new(config.organize_options());
        let pairs: Vec<(PathBuf, PathBuf)> = report
            .results
            .iter()
            .filter(|(_, version)| version.is_some())
            .map(|(label, _)| {
                let file = PathBuf::from(label);
                let target = config.organize.target_dir(&file);
                (file, target)
            })
            .collect();

        let organized = organizer.organize_files(&pairs).await;
        let moved = organized.iter().filter(|(_, target)| target.is_some()).count();
        tracing::info!(
            organized = moved,
            failed = organized.len() - moved,
            mode = config.organize.operation_mode.as_str(),
            dry_run = config.output.dry_run,
            "Organized files"
        );
    }

    for (file, reason) in &report.failures {
        tracing::warn!(file = %file, reason = %reason, "Failed to process file");
    }

    tracing::info!(
        total = report.results.len(),
        succeeded = report.success_count(),
        failed = report.failures.len(),
        "Model Scout finished"
    );

    if let Some(handle) = prometheus_handle {
        println!("{}", handle.render());
    }

    Ok(())
}
