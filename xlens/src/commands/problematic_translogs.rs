use std::{sync::Arc, time::Duration};

use clap::Parser;
use tracing::info;
use xlens_logging::cli::LoggingConfig;
use xlens_reset::{
    AdaptiveSummary, AdaptiveThresholdResolver, BatchExitCode, BatchOptions, BatchOrchestrator,
    BatchResult, CandidateSelector, ManualPlan, ProblematicShard, SkippedTable, SqlExecutor,
    backoff::MAX_WAIT_LIMIT, discovery::discover,
};

use super::common::CrateDbConfig;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Client(#[from] xlens_client::Error),

    #[error(transparent)]
    Discovery(#[from] xlens_reset::discovery::Error),

    #[error("failed to configure the audit log: {0}")]
    Logging(#[from] xlens_logging::Error),

    #[error("--dry-run can only be used with --autoexec")]
    DryRunWithoutAutoexec,
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    crate_config: CrateDbConfig,

    /// Baseline uncommitted translog size in MB for a replica to count as problematic
    ///
    /// Tables without an explicit `translog.flush_threshold_size` are judged against this
    /// baseline plus 10%.
    #[clap(long = "size-mb", visible_alias = "sizeMB", default_value_t = 512)]
    size_mb: u32,

    /// Print the statements of a manual replica reset without running any of them
    #[clap(long = "execute", conflicts_with = "autoexec")]
    execute: bool,

    /// Reset replicas of the selected tables: set them to 0, wait for retention leases to
    /// clear, then restore the original count
    #[clap(long = "autoexec")]
    autoexec: bool,

    /// With --autoexec, log every step without changing anything
    #[clap(long = "dry-run")]
    dry_run: bool,

    /// With --autoexec, only reset tables whose peak translog exceeds this percentage of their
    /// adaptive threshold
    #[clap(long = "percentage", default_value_t = 200.0, value_parser = parse_percentage)]
    percentage: f64,

    /// With --autoexec, seconds to wait for retention leases to clear on each table
    #[clap(
        long = "max-wait",
        default_value_t = 720,
        value_parser = clap::value_parser!(u64).range(1..=MAX_WAIT_LIMIT.as_secs())
    )]
    max_wait: u64,

    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,
}

pub(crate) async fn command(config: Config) -> Result<BatchExitCode> {
    if config.dry_run && !config.autoexec {
        return Err(Error::DryRunWithoutAutoexec);
    }

    let executor: Arc<dyn SqlExecutor> = Arc::new(config.crate_config.client()?);
    let baseline_mb = f64::from(config.size_mb);

    println!(
        "Problematic translog analysis (adaptive thresholds, baseline {} MB)",
        config.size_mb
    );
    match (config.autoexec, config.dry_run, config.execute) {
        (true, true, _) => println!("DRY RUN MODE - replica resets are simulated"),
        (true, false, _) => println!("AUTOEXEC MODE - replica resets are executed"),
        (false, _, true) => println!("COMMAND GENERATION MODE - statements are printed, not run"),
        _ => println!("ANALYSIS MODE - nothing is changed"),
    }

    let discovery = discover(executor.as_ref(), baseline_mb).await?;
    if discovery.is_empty() {
        println!("No problematic translog shards found");
        return Ok(BatchExitCode::Success);
    }

    let identities: Vec<_> = discovery
        .shards
        .iter()
        .map(|s| s.identity.clone())
        .chain(discovery.summaries.iter().map(|s| s.identity.clone()))
        .collect();
    let thresholds = AdaptiveThresholdResolver::new(Arc::clone(&executor))
        .resolve(&identities)
        .await;
    let discovery = discovery.apply_adaptive_thresholds(&thresholds, baseline_mb);
    if discovery.is_empty() {
        println!("No problematic translog shards found using adaptive thresholds");
        return Ok(BatchExitCode::Success);
    }

    print_shards(&discovery.shards, config.size_mb);

    let selector = CandidateSelector::new(Arc::clone(&executor), baseline_mb);
    let tables = selector.compute_thresholds(discovery.summaries, &thresholds);
    print_analysis(&selector, &tables).await;

    if config.execute {
        let selection = selector.with_known_replicas(tables).await;
        print_skipped(&selection.skipped);
        println!();
        println!("Generated shard management commands:");
        println!();
        println!(
            "{}",
            ManualPlan::build(&discovery.shards, &selection.candidates)
        );
        return Ok(BatchExitCode::Success);
    }

    if !config.autoexec {
        println!();
        println!("Use --execute to print the statements of a manual replica reset");
        println!("Use --autoexec to reset replicas of tables over --percentage of their threshold");
        return Ok(BatchExitCode::Success);
    }

    let selection = selector
        .filter_by_percentage(tables, config.percentage)
        .await;
    print_skipped(&selection.skipped);

    if selection.candidates.is_empty() {
        println!(
            "No tables exceed {}% of their threshold",
            config.percentage
        );
        return Ok(BatchExitCode::Success);
    }

    println!(
        "Processing {} table(s) exceeding {}% of their threshold",
        selection.candidates.len(),
        config.percentage
    );
    for candidate in &selection.candidates {
        info!(
            table = %candidate.identity,
            max_uncommitted_mb = candidate.max_uncommitted_mb,
            adaptive_threshold_mb = candidate.adaptive_threshold_mb,
            current_replicas = candidate.current_replicas,
            "selected for replica reset"
        );
    }

    let options = BatchOptions {
        dry_run: config.dry_run,
        max_wait: Duration::from_secs(config.max_wait),
        log_format: config.logging_config.log_format,
    };
    let result = BatchOrchestrator::new(executor, options)
        .with_audit_log(config.logging_config.to_builder()?)
        .run(selection.candidates)
        .await;

    print_summary(&result);
    Ok(result.exit_code())
}

fn parse_percentage(s: &str) -> Result<f64, String> {
    let percentage: f64 = s.trim().parse().map_err(|e| format!("{e}"))?;
    if percentage.is_finite() && percentage >= 0.0 {
        Ok(percentage)
    } else {
        Err("must be a finite number of at least 0".to_string())
    }
}

fn print_shards(shards: &[ProblematicShard], size_mb: u32) {
    println!();
    println!("Problematic replica shards (exceeding the {size_mb} MB baseline):");
    println!(
        "  {:<40} {:>8}  {:<20} {:>12} {:>12}",
        "Table", "Shard", "Node", "Translog MB", "Threshold MB"
    );
    for shard in shards {
        println!(
            "  {:<40} {:>8}  {:<20} {:>12.1} {:>12.0}",
            shard.identity.to_string(),
            shard.shard_id,
            shard.node_name,
            shard.translog_mb,
            shard.threshold_mb
        );
    }
}

async fn print_analysis(selector: &CandidateSelector, tables: &[AdaptiveSummary]) {
    println!();
    println!("Tables with problematic replica translogs:");
    for table in tables {
        let summary = &table.summary;
        let ratio = table
            .ratio_percent()
            .map(|r| format!("{r:.1}%"))
            .unwrap_or_else(|| "-".to_string());
        let replicas = match selector.current_replicas(&summary.identity).await {
            Ok(replicas) => replicas.to_string(),
            Err(_) => "?".to_string(),
        };
        println!("  {}", summary.identity);
        println!(
            "    peak uncommitted: {:.1} MB, threshold: {:.1} MB (configured {:.1} MB), ratio: {ratio}",
            summary.max_uncommitted_mb, table.adaptive_threshold_mb, table.adaptive_config_mb
        );
        println!(
            "    problematic replicas: {}/{}, primaries: {} ({:.2} GB), replicas: {replicas} ({:.2} GB)",
            summary.problematic_replica_shards,
            summary.total_replica_shards,
            summary.total_primary_shards,
            summary.total_primary_size_gb,
            summary.total_replica_size_gb
        );
    }
}

fn print_skipped(skipped: &[SkippedTable]) {
    if skipped.is_empty() {
        return;
    }
    println!("Skipped tables:");
    for table in skipped {
        println!(
            "  - {} ({:.1}%): {}",
            table.identity, table.ratio_percent, table.reason
        );
    }
}

fn print_summary(result: &BatchResult) {
    println!();
    println!("AutoExec summary:");
    println!("  Total tables processed: {}", result.attempted());
    println!("  Successful: {}", result.succeeded());
    println!("  Failed: {}", result.failed());
    println!("  Total time: {:.1}s", result.elapsed.as_secs_f64());

    if result.failed() > 0 {
        println!();
        println!("Failed tables requiring manual intervention:");
        for table in result.failed_tables() {
            println!(
                "  - {}: {}",
                table.display_name,
                table.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    }
}
