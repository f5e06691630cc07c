use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "changemerge")]
#[command(about = "Apply and inspect row-level changesets against a local database")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Merge a changeset file into a database
    Apply {
        /// Changeset file
        changeset: PathBuf,
        /// Target database
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
        /// Session options as JSON
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Description recorded with the merge
        #[arg(long, default_value = "merge")]
        description: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the records of a changeset file
    Dump {
        /// Changeset file
        changeset: PathBuf,
        /// Show the local row each record targets
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,
    },
    /// Show briefcase state and pending local txns
    Inspect {
        /// Database to inspect
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reverse the most recent local txn
    Undo {
        /// Target database
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
    },
}
