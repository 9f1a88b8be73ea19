//! Keepsake CLI - drive and inspect sync from the terminal
//!
//! Queue local edits, run sync passes, and settle conflicts without a UI.

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::add::run_add;
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::conflicts::run_conflicts;
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::link::run_link;
use crate::commands::list::run_list;
use crate::commands::resolve::run_resolve;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keepsake=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Add {
            entity_type,
            payload,
        } => run_add(entity_type.into(), payload.as_deref(), &db_path).await?,
        Commands::Edit {
            entity_type,
            id,
            payload,
        } => run_edit(entity_type.into(), &id, payload.as_deref(), &db_path).await?,
        Commands::Delete { entity_type, id } => {
            run_delete(entity_type.into(), &id, &db_path).await?;
        }
        Commands::List {
            entity_type,
            limit,
            json,
        } => run_list(entity_type.into(), limit, json, &db_path).await?,
        Commands::Link { journal, content } => run_link(&journal, &content, &db_path).await?,
        Commands::Sync { entity_type } => run_sync(entity_type.map(Into::into), &db_path).await?,
        Commands::Status { remote, json } => run_status(remote, json, &db_path).await?,
        Commands::Conflicts { limit, json } => run_conflicts(limit, json, &db_path).await?,
        Commands::Resolve {
            entity_type,
            id,
            resolution,
        } => run_resolve(entity_type.into(), &id, resolution.resolution(), &db_path).await?,
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}
