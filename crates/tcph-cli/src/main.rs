use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::Parser;
use tcph_core::{format_day, DateRange};
use tcph_pipeline::{Pipeline, PipelineConfig, RAW_RETENTION_DAYS};
use tcph_source::{SourceConfig, TcgCsvClient};
use tcph_storage::DatasetLayout;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tcph")]
#[command(about = "Harvest daily trading-card price archives into a parquet dataset")]
struct Cli {
    /// First date to harvest (YYYY-MM-DD).
    #[arg(long, value_parser = parse_cli_date)]
    start_date: NaiveDate,

    /// Last date to harvest, inclusive (YYYY-MM-DD).
    #[arg(long, value_parser = parse_cli_date)]
    end_date: NaiveDate,

    /// Stride between harvested dates, in days.
    #[arg(long, default_value_t = 1)]
    interval: u32,

    /// Base directory for all dataset artifacts.
    #[arg(long, default_value = "./data")]
    base_dir: PathBuf,

    /// Keep the extracted raw listings instead of deleting them after the run.
    #[arg(long)]
    keep_extracted: bool,

    /// Also fold this run's partitions into the combined parquet file.
    #[arg(long)]
    full_file: bool,

    /// Re-fetch the products/groups metadata instead of using the disk cache.
    #[arg(long)]
    refresh_metadata: bool,

    /// How many raw per-day tables to retain on disk.
    #[arg(long, default_value_t = RAW_RETENTION_DAYS)]
    raw_retention: usize,
}

fn parse_cli_date(s: &str) -> Result<NaiveDate, String> {
    tcph_core::parse_day(s).map_err(|err| format!("invalid date {s:?}: {err}"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.start_date > cli.end_date {
        bail!(
            "--start-date {} is after --end-date {}",
            format_day(cli.start_date),
            format_day(cli.end_date)
        );
    }

    let source_config = SourceConfig::from_env();
    let category_id = source_config.category_id;
    let client = TcgCsvClient::new(source_config)?;
    let layout = DatasetLayout::new(&cli.base_dir);
    let config = PipelineConfig {
        keep_extracted: cli.keep_extracted,
        full_file: cli.full_file,
        refresh_metadata: cli.refresh_metadata,
        raw_retention: cli.raw_retention,
        category_id,
    };

    let pipeline = Pipeline::new(layout, &client, &client, config);
    let range = DateRange::new(cli.start_date, cli.end_date, cli.interval);
    let summary = pipeline.run(range).await?;

    println!(
        "run {} complete: ok={} empty={} failed={} rows={}",
        summary.run_id,
        summary.days_ok.len(),
        summary.days_empty.len(),
        summary.days_failed.len(),
        summary.rows_written
    );
    for date in &summary.days_failed {
        eprintln!("failed: {}", format_day(*date));
    }
    if let Some(compaction) = &summary.compaction {
        println!(
            "combined dataset: rows={} appended={} replaced_dates={}{}",
            compaction.total_rows,
            compaction.appended_rows,
            compaction.dates_replaced,
            if compaction.rebuilt { " (rebuilt)" } else { "" }
        );
    }

    Ok(if summary.failed() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}
