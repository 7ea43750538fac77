use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use btc_import::config;
use btc_import::model::Collection;
use btc_import::store::DirectStore;

#[derive(Parser, Debug)]
#[command(about = "Show direct-store tables and the collection mapping they resolve to")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let store = DirectStore::from_config(&cfg)
        .context("destination.database_url is not configured")?;

    println!("Tables:");
    for table in store.list_tables().await? {
        println!("  {table}");
    }
    println!("Mapping:");
    for collection in [
        Collection::Events,
        Collection::Organizers,
        Collection::Users,
        Collection::Venues,
    ] {
        let configured = cfg.physical_name(collection);
        match store.resolve_table(collection).await {
            Ok(table) if table == configured => {
                println!("  {} -> {}", collection.as_str(), table)
            }
            Ok(table) => println!(
                "  {} -> {} (configured {}, update the mapping)",
                collection.as_str(),
                table,
                configured
            ),
            Err(err) => println!("  {} -> unresolved: {err}", collection.as_str()),
        }
    }
    Ok(())
}
