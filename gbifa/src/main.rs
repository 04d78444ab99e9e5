//! gbifa - Dataset activity analytics pipeline
//!
//! Downloads a dataset's occurrence-download activity from the GBIF API,
//! persists it in monthly batches, then processes the persisted records
//! into a ranked contribution report and strength tables.

use anyhow::Result;
use clap::Parser;
use gbifa::api::{DatasetActivity, GbifClient};
use gbifa::{download, process, report, store};
use gbifa_common::{Config, ReportMode, YearMonth};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "gbifa",
    version,
    about = "GBIF dataset activity analytics pipeline"
)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "gbifa.toml")]
    config: PathBuf,

    /// Override the configured download mode ("count-only", "full" or "YYYY-MM")
    #[arg(long)]
    download_mode: Option<String>,

    /// Override the configured report mode ("full" or "month")
    #[arg(long)]
    report_mode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting gbifa v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(mode) = args.download_mode {
        config.download_mode = mode;
    }
    if let Some(mode) = args.report_mode {
        config.report_mode = mode;
    }
    let download_mode = config.download_mode()?;
    let report_mode = config.report_mode()?;

    let client = GbifClient::new(&config);
    let source = DatasetActivity {
        client: &client,
        dataset: config.dataset_key,
    };

    info!(dataset = %config.dataset_key, mode = ?download_mode, "Phase 1: DOWNLOAD");
    let summary = download::download_activity(
        &source,
        download_mode,
        config.page_limit,
        &config.data_dir,
    )
    .await;
    info!(
        total_count = summary.total_count,
        pages_planned = summary.pages_planned,
        pages_fetched = summary.pages_fetched,
        pages_failed = summary.pages_failed,
        records_fetched = summary.records_fetched,
        batches_written = summary.batches_written,
        early_stopped = summary.early_stopped,
        "download phase complete"
    );

    info!("Phase 2: CITATIONS");
    download::download_citations(&client, &config.dataset_key, &config.data_dir).await;

    info!(mode = ?report_mode, "Phase 3: PROCESS");
    let target_month = match report_mode {
        ReportMode::Full => None,
        ReportMode::LatestMonth => {
            let month = YearMonth::preceding(chrono::Utc::now().date_naive());
            info!(%month, "reporting on most recently completed month");
            Some(month)
        }
    };
    let raw_records = match target_month {
        Some(month) => store::load_month(&config.data_dir, month),
        None => store::load_all_activity(&config.data_dir),
    };
    let rules = process::ExclusionRules::from_config(&config);
    let context = process::PipelineContext::build(raw_records, &rules, target_month);

    info!("Phase 4: REPORT");
    let data = report::export_report_data(
        &context,
        &client,
        &config.report_dir,
        report::DEFAULT_TOP_N,
    )
    .await?;

    info!(
        records = context.records.len(),
        included = context.included_count(),
        skipped = context.skipped,
        ranked = data.downloads.len(),
        "run complete"
    );
    if summary.pages_failed > 0 {
        warn!(
            pages_failed = summary.pages_failed,
            "some pages were never fetched; this run's persisted data is incomplete"
        );
    }

    Ok(())
}
