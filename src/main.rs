use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod auth;
mod cache;
mod catalog;
mod cli;
mod config;
mod images;
mod ledger;
mod lock;
mod pipeline;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::{AppContext, AppFactory, AppPaths, LedgerAccess};
use cli::Command;

fn main() -> anyhow::Result<()> {
    // stdout carries command output, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = cli::Args::parse();

    let paths = AppFactory::get_paths()?;

    match args.command {
        Command::Ingest { no_progress } => cli::handle_ingest(paths, no_progress),
        Command::Index {} => cli::handle_index(&read_only(paths)?),
        Command::Search { query, k, verbose } => {
            cli::handle_search(&read_only(paths)?, &query, k, verbose)
        }
        Command::Image { id, output } => cli::handle_image(&read_only(paths)?, &id, output),
        Command::Caption { files } => cli::handle_caption(&read_only(paths)?, &files),
        Command::Serve {} => cli::handle_serve(read_only(paths)?),
    }
}

/// Everything but ingest reads the ledger without writing to it, so it can
/// run next to an ingest in progress.
fn read_only(paths: AppPaths) -> anyhow::Result<AppContext> {
    AppFactory::create_context(paths, LedgerAccess::ReadOnly)
}
