use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::cli::ConfigCommands;
use crate::config::KindredConfig;

/// Execute config subcommand
pub async fn execute(cmd: ConfigCommands, config: &KindredConfig) -> Result<()> {
    match cmd {
        ConfigCommands::Init { path, force } => init(path, force).await,
        ConfigCommands::Show { format } => show(config, &format).await,
    }
}

/// Initialize a new config file
async fn init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let config_path = match path {
        Some(path) => path,
        None => KindredConfig::default_config_path().context("Could not determine config file path")?,
    };

    if config_path.exists() && !force {
        println!("Config file already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    KindredConfig::create_example(&config_path)?;
    println!("Created config file at: {}", config_path.display());

    Ok(())
}

/// Show the current effective configuration
async fn show(config: &KindredConfig, format: &str) -> Result<()> {
    let rendered = match format {
        "json" => config.display_as_json()?,
        _ => config.display_as_toml()?,
    };
    println!("{}", rendered);
    Ok(())
}
