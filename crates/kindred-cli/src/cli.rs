use clap::{Parser, Subcommand, ValueEnum};
use kindred_core::{ExtractionStatus, LinkType, OperationStatus, RecordRef};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

use crate::output::OutputFormat;

/// Log level options for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// No logging output
    Off,
    /// Error messages only
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages (default for verbose)
    Debug,
    /// Trace-level messages (most verbose)
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Parser)]
#[command(name = "kindred")]
#[command(about = "kindred - collection graphs with audited entity merging")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set log level (off, error, warn, info, debug, trace)
    /// If not specified, uses config file value or defaults to 'warn'
    #[arg(short = 'l', long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Enable verbose logging (shortcut for --log-level=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path (defaults to ~/.config/kindred/config.toml)
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file (overrides config file)
    #[arg(long = "db", global = true, env = "KINDRED_DB")]
    pub db_path: Option<PathBuf>,

    /// Identity recorded as `performed_by` (overrides config file)
    #[arg(short = 'a', long, global = true, env = "KINDRED_ACTOR")]
    pub actor: Option<String>,

    /// Set output format
    #[arg(short = 'f', long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Source documents and their extracted graphs
    #[command(subcommand)]
    Doc(DocCommands),

    /// Collections, membership and the materialized graph
    #[command(subcommand)]
    Collection(CollectionCommands),

    /// Collection graph state: initialize, drift, sync
    #[command(subcommand)]
    Graph(GraphCommands),

    /// Merge source entities into one collection entity
    Merge {
        /// Collection (uuid or display id)
        collection: RecordRef,

        /// Source graph entities to merge
        #[arg(required = true, num_args = 1..)]
        sources: Vec<RecordRef>,

        /// Existing merged entity to grow instead of creating a new one
        #[arg(long)]
        into: Option<RecordRef>,

        /// Name of the merged entity
        #[arg(long)]
        name: Option<String>,

        /// Description of the merged entity
        #[arg(long)]
        description: Option<String>,

        /// JSON object merged over the resolved properties
        #[arg(long)]
        properties: Option<String>,
    },

    /// Split a merged entity into one individual entity per source
    Unmerge {
        /// Merged collection entity
        entity: RecordRef,
    },

    /// Split a merged entity along a partition of its sources
    Split {
        /// Merged collection entity
        entity: RecordRef,

        /// One group of source graph entities, comma separated (repeat per group)
        #[arg(short, long = "part", required = true)]
        parts: Vec<String>,
    },

    /// Candidate correspondences between source and collection entities
    #[command(subcommand)]
    Link(LinkCommands),

    /// Operation history of a collection
    History {
        /// Collection (uuid or display id)
        collection: RecordRef,

        /// Show only the latest N operations (defaults to the engine setting)
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Only operations with this status
        #[arg(long)]
        status: Option<OperationStatus>,
    },

    /// Stale lock inspection and release
    #[command(subcommand)]
    Locks(LockCommands),

    /// Visibility profiles and filtered graph views
    #[command(subcommand)]
    Profile(ProfileCommands),

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum DocCommands {
    /// Register a source document
    Create {
        /// Document title
        title: String,

        /// Original file name
        #[arg(long)]
        filename: Option<String>,
    },

    /// Show a document
    Show { document: RecordRef },

    /// Replace a document's graph with an extraction result (JSON file)
    Ingest {
        document: RecordRef,

        /// JSON file with `created_by_tool`, `entities` and `relationships`
        file: PathBuf,
    },

    /// Record extraction progress for a document
    Status {
        document: RecordRef,

        /// pending, processing, complete or error
        status: ExtractionStatus,

        /// Failure message for the error status
        #[arg(long)]
        error: Option<String>,
    },

    /// List the graph entities extracted from a document
    Entities { document: RecordRef },

    /// Delete a document and its extracted graph
    Delete { document: RecordRef },
}

#[derive(Subcommand)]
pub enum CollectionCommands {
    /// Create a collection
    Create {
        name: String,

        #[arg(long)]
        description: Option<String>,

        /// Parent collection
        #[arg(long)]
        parent: Option<RecordRef>,
    },

    /// Show a collection
    Show { collection: RecordRef },

    /// Add a document to a collection
    Add {
        collection: RecordRef,
        document: RecordRef,
    },

    /// Remove a document from a collection
    Remove {
        collection: RecordRef,
        document: RecordRef,
    },

    /// List child collections
    Children { collection: RecordRef },

    /// List collection entities
    Entities { collection: RecordRef },

    /// List collection relationships resolved against merges
    Relationships { collection: RecordRef },

    /// List the source graph entities behind a collection entity
    Sources { entity: RecordRef },
}

#[derive(Subcommand)]
pub enum GraphCommands {
    /// Build the collection graph for the first time
    Init { collection: RecordRef },

    /// Compare the stored fingerprint against the current sources
    Drift { collection: RecordRef },

    /// Rebuild an out-of-sync graph
    Sync { collection: RecordRef },

    /// Show graph state and counts
    Status { collection: RecordRef },

    /// Show the graph through a visibility profile
    View {
        collection: RecordRef,

        /// Profile to apply (defaults to the collection's default profile)
        #[arg(long)]
        profile: Option<RecordRef>,
    },
}

#[derive(Subcommand)]
pub enum LinkCommands {
    /// Propose a link from a source entity to a collection entity
    Propose {
        collection: RecordRef,

        /// Source graph entity
        graph_entity: RecordRef,

        /// Target collection entity
        #[arg(long)]
        target: Option<RecordRef>,

        /// Confidence, 0-100
        #[arg(long, default_value_t = 100)]
        confidence: i64,

        /// exact_match, fuzzy_match or manual
        #[arg(long = "type", default_value = "manual")]
        link_type: LinkType,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// Tool that produced the proposal
        #[arg(long)]
        tool: Option<String>,
    },

    /// Confirm a link, merging its source into the target
    Confirm { link: RecordRef },

    /// Deactivate a link
    Deactivate { link: RecordRef },

    /// Show a link
    Show { link: RecordRef },

    /// List active links pointing at a collection entity
    List { entity: RecordRef },

    /// Best unconfirmed candidate for a source entity
    Best {
        collection: RecordRef,
        graph_entity: RecordRef,
    },
}

#[derive(Subcommand)]
pub enum LockCommands {
    /// List locks older than the threshold
    Stale {
        /// Threshold in seconds (defaults to the engine setting)
        #[arg(long)]
        older_than_secs: Option<u32>,
    },

    /// Force-release a lock, restoring the entity's prior state
    Release {
        entity: RecordRef,

        /// Why the lock is being released
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
pub enum ProfileCommands {
    /// Create a profile; global unless scoped to a collection or document
    Create {
        name: String,

        #[arg(long)]
        description: Option<String>,

        /// Scope the profile to a collection
        #[arg(long, conflicts_with = "document")]
        collection: Option<RecordRef>,

        /// Scope the profile to a document
        #[arg(long)]
        document: Option<RecordRef>,

        /// Entity types to show (repeatable; none means all)
        #[arg(long = "entity-type")]
        entity_types: Vec<String>,

        /// Relationship types to show (repeatable; none means all)
        #[arg(long = "relationship-type")]
        relationship_types: Vec<String>,

        /// Entity to hide by entity id, uuid or display id (repeatable)
        #[arg(long = "hide-entity")]
        hidden_entities: Vec<String>,

        /// Relationship to hide by uuid or display id (repeatable)
        #[arg(long = "hide-relationship")]
        hidden_relationships: Vec<String>,

        /// Do not show entities added after the profile was created
        #[arg(long)]
        no_auto_include: bool,
    },

    /// List profiles usable by a collection
    List { collection: RecordRef },

    /// Show a profile
    Show { profile: RecordRef },

    /// Set or clear a collection's default profile
    Default {
        collection: RecordRef,

        profile: Option<RecordRef>,

        /// Clear the default profile
        #[arg(long, conflicts_with = "profile")]
        clear: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize a new config file
    Init {
        /// Path for config file (defaults to ~/.config/kindred/config.toml)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite existing config file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Output format (toml, json)
        #[arg(short, long, default_value = "toml")]
        format: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_merge_arguments() {
        let cli = Cli::try_parse_from([
            "kindred",
            "merge",
            "0e5fe0c8",
            "11111111",
            "22222222",
            "--name",
            "Acme",
            "--actor",
            "ana",
        ])
        .unwrap();
        assert_eq!(cli.actor.as_deref(), Some("ana"));
        match cli.command {
            Commands::Merge {
                collection,
                sources,
                name,
                into,
                ..
            } => {
                assert_eq!(collection.to_string(), "0e5fe0c8");
                assert_eq!(sources.len(), 2);
                assert_eq!(name.as_deref(), Some("Acme"));
                assert!(into.is_none());
            }
            _ => panic!("expected merge"),
        }
    }

    #[test]
    fn test_invalid_reference_is_rejected() {
        assert!(Cli::try_parse_from(["kindred", "collection", "show", "not-an-id"]).is_err());
    }

    #[test]
    fn test_link_defaults() {
        let cli = Cli::try_parse_from(["kindred", "link", "propose", "aaaaaaaa", "bbbbbbbb"]).unwrap();
        match cli.command {
            Commands::Link(LinkCommands::Propose {
                confidence,
                link_type,
                target,
                ..
            }) => {
                assert_eq!(confidence, 100);
                assert_eq!(link_type, LinkType::Manual);
                assert!(target.is_none());
            }
            _ => panic!("expected link propose"),
        }
    }

    #[test]
    fn test_split_parts_repeat() {
        let cli = Cli::try_parse_from([
            "kindred", "split", "aaaaaaaa", "--part", "11111111,22222222", "--part", "33333333",
        ])
        .unwrap();
        match cli.command {
            Commands::Split { parts, .. } => assert_eq!(parts.len(), 2),
            _ => panic!("expected split"),
        }
    }

    #[test]
    fn test_stale_threshold_is_non_negative() {
        let cli =
            Cli::try_parse_from(["kindred", "locks", "stale", "--older-than-secs", "600"]).unwrap();
        match cli.command {
            Commands::Locks(LockCommands::Stale { older_than_secs }) => {
                assert_eq!(older_than_secs, Some(600))
            }
            _ => panic!("expected locks stale"),
        }
        assert!(
            Cli::try_parse_from(["kindred", "locks", "stale", "--older-than-secs", "-5"]).is_err()
        );
        assert!(Cli::try_parse_from([
            "kindred",
            "locks",
            "stale",
            "--older-than-secs",
            "99999999999999"
        ])
        .is_err());
    }

    #[test]
    fn test_profile_scope_flags_conflict() {
        assert!(Cli::try_parse_from([
            "kindred",
            "profile",
            "create",
            "People",
            "--collection",
            "aaaaaaaa",
            "--document",
            "bbbbbbbb"
        ])
        .is_err());
    }

    #[test]
    fn test_log_level_maps_to_filter() {
        assert_eq!(LevelFilter::from(LogLevel::Off), LevelFilter::OFF);
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
    }
}
