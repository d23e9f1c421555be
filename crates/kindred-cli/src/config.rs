use anyhow::{Context, Result};
use kindred_core::EngineConfig;
use kindred_sqlite::SqliteConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::LevelFilter;

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// off, error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Unknown levels fall back to `warn`
    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::WARN)
    }
}

/// CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindredConfig {
    /// Identity recorded as `performed_by`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub database: SqliteConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

impl KindredConfig {
    /// Load configuration with precedence: CLI flags > config file > defaults
    ///
    /// Environment variables reach the flags through clap.
    pub fn load(
        config_file: Option<PathBuf>,
        db_path: Option<PathBuf>,
        actor: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::from_file_or_default(config_file)?;

        if let Some(path) = db_path {
            config.database.path = path;
        }
        if let Some(actor) = actor {
            config.actor = Some(actor);
        }

        Ok(config)
    }

    /// Get default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("kindred");
        Ok(config_dir.join("config.toml"))
    }

    /// Default database location, beside the user's data
    pub fn default_database_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("kindred").join("kindred.db"))
    }

    /// The actor for ledger entries
    pub fn actor(&self) -> Result<String> {
        self.actor
            .clone()
            .filter(|a| !a.trim().is_empty())
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.trim().is_empty()))
            .context("No actor configured; pass --actor or set `actor` in the config file")
    }

    /// Create a new config file with example values
    pub fn create_example(path: &Path) -> Result<()> {
        let database = Self::default_database_path()
            .unwrap_or_else(|| PathBuf::from("./kindred.db"));
        let example = format!(
            r#"# Kindred CLI Configuration
# Location: ~/.config/kindred/config.toml

# Identity recorded as performed_by on every operation
# Default: $USER
# actor = "ana"

[database]
# SQLite database file
path = '{}'

# Write-ahead logging
wal_mode = true

# Milliseconds to wait on a locked database
busy_timeout_ms = 5000

[engine]
# Locks older than this are reported by `kindred locks stale`
stale_lock_after_secs = 900

# Fresh uuids drawn before display id allocation gives up
display_id_attempts = 8

# History rows returned when no --limit is given
default_history_limit = 100

[logging]
# off, error, warn, info, debug, trace
level = "warn"
"#,
            database.display()
        );

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        std::fs::write(path, example).context("Failed to write config file")?;

        Ok(())
    }

    /// Load config from file or return default
    fn from_file_or_default(config_file: Option<PathBuf>) -> Result<Self> {
        let path = config_file
            .or_else(|| Self::default_config_path().ok())
            .filter(|p| p.exists());

        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Display the current configuration as TOML
    pub fn display_as_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config as TOML")
    }

    /// Display the current configuration as JSON
    pub fn display_as_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize config as JSON")
    }
}
