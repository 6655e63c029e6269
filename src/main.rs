use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use numberd::bootstrap::Server;
use numberd::config::Config;
use numberd::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "numberd")]
#[command(author, version, about = "Outbound-number admission cache for SMS sending")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE", env = "NUMBERD_CONFIG")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig::from(&config.telemetry))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting numberd"
    );

    info!(
        timezone = %config.timezone,
        database = config.database.url.is_some(),
        profiles = config.hydrate_on_start.len(),
        "configuration loaded"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
