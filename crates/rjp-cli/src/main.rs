use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rjp_pipeline::{DedupTarget, EnrichPipeline, PipelineConfig};
use rjp_sources::{all_profiles, profile_for_source, SourceProfile};

#[derive(Debug, Parser)]
#[command(name = "rjp")]
#[command(about = "Remote jobs pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetTable {
    Intake,
    Tracking,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge intake rows into the tracking table and enrich the queue.
    Enrich {
        #[arg(long)]
        source: String,
    },
    /// Remove duplicate and invalid rows from one table.
    Dedupe {
        #[arg(long)]
        source: String,
        #[arg(long, value_enum, default_value = "tracking")]
        target: TargetTable,
    },
    /// Project the tracking table into the final dataset.
    Derive {
        #[arg(long)]
        source: String,
    },
    /// Fan all final tables out into per-category tables.
    Aggregate,
}

fn resolve_profile(source: &str) -> Result<&'static SourceProfile> {
    match profile_for_source(source) {
        Some(profile) => Ok(profile),
        None => {
            let known: Vec<&str> = all_profiles().iter().map(|p| p.source_id).collect();
            bail!("unknown source '{source}' (known: {})", known.join(", "));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Enrich { source } => {
            let profile = resolve_profile(&source)?;
            let pipeline = EnrichPipeline::new(config, profile);
            let summary = pipeline.merge_and_enrich().await?;
            println!(
                "enrich complete: run_id={} source={} merged={} added={} processed={} skipped={} failed={} quota_remaining={}",
                summary.run_id,
                summary.source_id,
                summary.merged_total,
                summary.newly_added,
                summary.processed,
                summary.skipped,
                summary.failed,
                summary.quota_remaining
            );
            if summary.halted_stale {
                println!("batch halted at the stale region of the queue");
            }
        }
        Commands::Dedupe { source, target } => {
            let profile = resolve_profile(&source)?;
            let pipeline = EnrichPipeline::new(config, profile);
            let target = match target {
                TargetTable::Intake => DedupTarget::Intake,
                TargetTable::Tracking => DedupTarget::Tracking,
            };
            let summary = pipeline.remove_duplicates(target)?;
            println!(
                "dedupe complete: source={} kept={} duplicates_removed={} invalid_removed={}",
                source, summary.kept, summary.duplicates_removed, summary.invalid_removed
            );
        }
        Commands::Derive { source } => {
            let profile = resolve_profile(&source)?;
            let pipeline = EnrichPipeline::new(config, profile);
            let summary = pipeline.derive_additional_fields()?;
            println!(
                "derive complete: source={} written={} updated={} skipped_not_remote={} skipped_untranslated={}",
                source,
                summary.written,
                summary.updated,
                summary.skipped_not_remote,
                summary.skipped_untranslated
            );
        }
        Commands::Aggregate => {
            let finals: Vec<_> = all_profiles()
                .iter()
                .map(|profile| config.final_path(profile.source_id))
                .collect();
            // Aggregation is source-agnostic; any profile drives it.
            let profile = all_profiles()[0];
            let pipeline = EnrichPipeline::new(config.clone(), profile);
            let outcomes = pipeline.aggregate_by_category(&finals)?;
            for (category, outcome) in &outcomes {
                println!(
                    "aggregate {}: written={} skipped_duplicate={}",
                    category, outcome.written, outcome.skipped_duplicate
                );
            }
        }
    }

    Ok(())
}
