//! Command-line interface for Brig
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::manifest;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Brig - FreeBSD jail lifecycle manager on ZFS
#[derive(Parser)]
#[command(name = "brig")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = manifest::DEFAULT_PATH)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter configuration and create the dataset tree
    Init {
        /// ZFS pool to hold the jail tree
        pool: String,

        /// Overwrite an existing configuration file
        #[arg(short = 'y', long)]
        force: bool,
    },

    /// Create a jail
    Create {
        /// Jail name
        name: String,

        /// Explicit jail id (defaults to the name)
        #[arg(long)]
        id: Option<String>,

        /// Clone from a fetched release
        #[arg(short, long, conflicts_with = "template")]
        release: Option<String>,

        /// Clone from a template jail
        #[arg(short, long)]
        template: Option<String>,

        /// Properties as KEY=VALUE
        props: Vec<String>,
    },

    /// Clone an existing jail
    Clone {
        /// Jail to clone
        source: String,

        /// Name of the new jail
        name: String,

        /// Clone from an existing snapshot instead of a fresh one
        #[arg(short, long)]
        snapshot: Option<String>,

        /// Properties as KEY=VALUE
        props: Vec<String>,
    },

    /// Start a jail
    Start {
        /// Jail name or id
        jail: String,
    },

    /// Stop a jail
    Stop {
        /// Jail name or id
        jail: String,
    },

    /// Stop and start a jail
    Restart {
        /// Jail name or id
        jail: String,
    },

    /// Abort an in-flight start
    Cancel {
        /// Jail name or id
        jail: String,
    },

    /// Clean up a failed jail and return it to defined
    Clear {
        /// Jail name or id
        jail: String,
    },

    /// Destroy a jail and its dataset
    Destroy {
        /// Jail name or id
        jail: String,

        /// Stop it first if running
        #[arg(short, long)]
        force: bool,
    },

    /// List jails
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a jail with its effective properties
    Get {
        /// Jail name or id
        jail: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Change jail properties
    Set {
        /// Jail name or id
        jail: String,

        /// Properties as KEY=VALUE
        #[arg(required = true)]
        props: Vec<String>,
    },

    /// Rename a jail
    Rename {
        /// Jail name or id
        jail: String,

        /// New name
        new_name: String,
    },

    /// Re-copy inherited properties from the jail's template
    Reapply {
        /// Jail name or id
        jail: String,
    },

    /// Snapshot a jail's dataset
    Snapshot {
        /// Jail name or id
        jail: String,

        /// Snapshot name (defaults to a timestamp)
        name: Option<String>,
    },

    /// List a jail's snapshots
    Snapshots {
        /// Jail name or id
        jail: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Destroy one of a jail's snapshots
    Snapremove {
        /// Jail name or id
        jail: String,

        /// Snapshot name
        snapshot: String,
    },

    /// Roll a stopped jail back to a snapshot
    Rollback {
        /// Jail name or id
        jail: String,

        /// Snapshot name
        snapshot: String,
    },

    /// Make a clone independent of its origin
    Promote {
        /// Jail name or id
        jail: String,
    },

    /// Adopt running jails and release stale runtime records
    Reconcile,

    /// Start every jail with boot=on, by priority
    Boot,

    /// Stop every running jail, in reverse priority
    Shutdown,

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "brig", &mut std::io::stdout());
    }
}
