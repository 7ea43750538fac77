use anyhow::Result;
use clap::{builder::BoolishValueParser, ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

use btc_import::cleanup::{AutoConfirm, BackupCleanupFacility, Confirmation, StdinConfirmation};
use btc_import::config;
use btc_import::fallback::DestinationAccess;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Re-create records from a cleanup backup file"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Backup file written by btc-cleanup
    #[arg(long)]
    backup: PathBuf,

    /// Count the backup's items without creating anything
    #[arg(long, env = "DRY_RUN", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    dry_run: bool,

    /// Skip the typed RESTORE confirmation
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

    let result = facility.restore(&args.backup, args.dry_run).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.failed > 0 {
        anyhow::bail!("{} records could not be restored", result.failed);
    }
    Ok(())
}
