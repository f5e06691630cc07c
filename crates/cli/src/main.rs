//! changemerge - apply and inspect changesets from the command line.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::{run_apply, run_dump, run_inspect, run_undo};
use crate::error::CliError;

fn main() {
    if let Err(error) = run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Apply {
            changeset,
            db,
            config,
            description,
            json,
        } => run_apply(&changeset, &db, config.as_deref(), &description, json),
        Commands::Dump { changeset, db } => run_dump(&changeset, db.as_deref()),
        Commands::Inspect { db, json } => run_inspect(&db, json),
        Commands::Undo { db } => run_undo(&db),
    }
}
