//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// Embodiment attribute engine
///
/// Classifies producer attribute maps against a versioned schema, records
/// description/artifact diffs for research, and runs deferred bias analyses.
#[derive(Parser, Debug)]
#[command(name = "embodiment-engine")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine with background analysis workers until Ctrl+C
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "EMBODIMENT_CONFIG")]
        config: Option<String>,
    },

    /// Compare a description attribute map with an artifact attribute map
    Compare {
        /// JSON file with the attributes extracted from the description
        #[arg(short, long)]
        description: String,

        /// JSON file with the attributes extracted from the generated artifact
        #[arg(short, long)]
        artifact: String,

        #[command(flatten)]
        subject: SubjectArgs,

        /// Path to configuration file
        #[arg(short, long, env = "EMBODIMENT_CONFIG")]
        config: Option<String>,
    },

    /// Erase every stored record for a session
    Erase {
        #[command(flatten)]
        subject: SubjectArgs,

        /// Path to configuration file
        #[arg(short, long, env = "EMBODIMENT_CONFIG")]
        config: Option<String>,
    },

    /// Attribute schema inspection
    Schema {
        #[command(subcommand)]
        subcommand: SchemaSubcommand,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

/// Who the records belong to
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SubjectArgs {
    /// Session pseudonym
    #[arg(short, long, conflicts_with = "user")]
    pub session: Option<String>,

    /// User id; the pseudonym is derived with the configured salt
    #[arg(short, long)]
    pub user: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SchemaSubcommand {
    /// Print the active schema as TOML
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Validate a schema document
    Validate {
        /// Schema document to check
        path: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
