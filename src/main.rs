use anyhow::{bail, Result};
use clap::{builder::BoolishValueParser, ArgAction, Parser};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use btc_import::btc::BtcClient;
use btc_import::config::{self, ConfigError};
use btc_import::fallback::DestinationAccess;
use btc_import::orchestrator::{BatchOrchestrator, DateRange};
use btc_import::report::render_summary;
use btc_import::resolver::EntityResolver;
use btc_import::runner::{ImportRunner, RunnerOptions};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Import BTC calendar events into the destination for a date or date range"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Destination API token; overrides destination.token
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Source API token; overrides btc.token
    #[arg(long, env = "BTC_TOKEN", hide_env_values = true)]
    btc_token: Option<String>,

    /// Simulate writes (pass `--dry-run false` for a live import)
    #[arg(long, env = "DRY_RUN", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    dry_run: bool,

    /// Single date to import (YYYY-MM-DD)
    #[arg(long, env = "TARGET_DATE", conflicts_with_all = ["start_date", "end_date"])]
    date: Option<String>,

    /// First date of a range (YYYY-MM-DD)
    #[arg(long, env = "START_DATE")]
    start_date: Option<String>,

    /// Last date of a range, inclusive (YYYY-MM-DD); defaults to the start date
    #[arg(long, env = "END_DATE", requires = "start_date")]
    end_date: Option<String>,

    /// Update events that were already imported instead of skipping them
    #[arg(long)]
    update_existing: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,
}

fn date_range(args: &Args) -> Result<DateRange, ConfigError> {
    match (&args.date, &args.start_date, &args.end_date) {
        (Some(date), _, _) => Ok(DateRange::single(config::parse_date(date)?)),
        (None, Some(start), Some(end)) => DateRange::parse(start, end),
        (None, Some(start), None) => Ok(DateRange::single(config::parse_date(start)?)),
        _ => Err(ConfigError::Invalid(
            "no date given; set TARGET_DATE or START_DATE/END_DATE",
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.example_config {
        print!("{}", config::example());
        return Ok(());
    }

    // Everything is validated before the first network call.
    let cfg = config::load(Some(&args.config))?
        .with_credentials(args.auth_token.clone(), args.btc_token.clone())?;
    let range = date_range(&args)?;
    cfg.ensure_dirs()?;

    let access = DestinationAccess::from_config(&cfg)?;
    info!(chain = ?access.strategy_names(), dry_run = args.dry_run, "destination access configured");

    let source = Arc::new(BtcClient::new(&cfg.btc.base_url, cfg.btc.token.clone())?);
    let resolver = EntityResolver::new(
        access.clone(),
        cfg.resolution.clone(),
        cfg.destination.id_field.clone(),
    );
    let runner = ImportRunner::new(
        source,
        access,
        resolver,
        RunnerOptions {
            dry_run: args.dry_run,
            update_existing: args.update_existing || cfg.import.update_existing,
            throttle: Duration::from_millis(cfg.app.throttle_ms),
            id_field: cfg.destination.id_field.clone(),
        },
    );
    let orchestrator = BatchOrchestrator::new(runner, cfg.assessment, cfg.results_dir());

    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current date");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let outcome = orchestrator.run(range).await?;
    print!("{}", render_summary(&outcome.run));
    println!("Report: {}", outcome.report_file.display());

    let run = &outcome.run;
    if !run.dates.is_empty() && run.totals.failed_dates == run.dates.len() as u64 {
        bail!("every date failed; is the source reachable?");
    }
    Ok(())
}
