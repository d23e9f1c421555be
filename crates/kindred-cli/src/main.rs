use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use kindred_cli::{
    cli::{Cli, Commands},
    commands::{self, Session},
    config::KindredConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration with CLI overrides
    let config = KindredConfig::load(cli.config.clone(), cli.db_path.clone(), cli.actor.clone())?;

    // Initialize logging: --log-level wins, then --verbose, then the config file
    let level = match (cli.log_level, cli.verbose) {
        (Some(level), _) => LevelFilter::from(level),
        (None, true) => LevelFilter::DEBUG,
        (None, false) => config.logging.level_filter(),
    };
    let env_filter = format!(
        "kindred_cli={0},kindred_core={0},kindred_sqlite={0}",
        level
    );
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config(cmd) => commands::config::execute(cmd, &config).await,
        command => {
            debug!(database = %config.database.path.display(), "Running store command");
            let session = Session::open(config, cli.format)?;
            commands::execute(&session, command).await
        }
    }
}
