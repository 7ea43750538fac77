use anyhow::Result;
use clap::{builder::BoolishValueParser, ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

use btc_import::cleanup::{
    AutoConfirm, BackupCleanupFacility, CleanupCriterion, Confirmation, StdinConfirmation,
};
use btc_import::config;
use btc_import::fallback::DestinationAccess;
use btc_import::model::Collection;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Back up and delete records imported from BTC on a given date"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Import date whose records are removed (YYYY-MM-DD)
    #[arg(long, env = "TARGET_DATE")]
    date: String,

    /// Only write the backup; delete nothing
    #[arg(long, env = "DRY_RUN", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    dry_run: bool,

    /// Collections to clean (events, organizers, users)
    #[arg(long, value_delimiter = ',', default_value = "events,organizers,users")]
    collections: Vec<String>,

    /// Skip the typed DELETE confirmation
    #[arg(long)]
    confirm: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?.with_credentials(args.auth_token.clone(), None)?;
    let date = config::parse_date(&args.date)?;
    let mut criterion = CleanupCriterion::new(date);
    criterion.collections = args
        .collections
        .iter()
        .map(|raw| match Collection::parse(raw.trim()) {
            Some(Collection::Venues) | None => {
                anyhow::bail!("cannot clean collection '{raw}'")
            }
            Some(c) => Ok(c),
        })
        .collect::<Result<_>>()?;
    cfg.ensure_dirs()?;

    let confirmation: Box<dyn Confirmation> = if args.confirm {
        Box::new(AutoConfirm)
    } else {
        Box::new(StdinConfirmation)
    };
    let facility = BackupCleanupFacility::new(
        DestinationAccess::from_config(&cfg)?,
        cfg.results_dir(),
        cfg.destination.id_field.clone(),
        cfg.destination.version_field.clone(),
        Duration::from_millis(cfg.app.throttle_ms),
        confirmation,
    );

    let result = facility.cleanup(&criterion, args.dry_run).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.failed > 0 {
        anyhow::bail!("{} records could not be deleted", result.failed);
    }
    Ok(())
}
