use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod handlers;

pub use handlers::*;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Caption every album item that isn't in the ledger yet.
    ///
    /// Safe to interrupt with ctrl+c: the batch being captioned is
    /// finished and saved, the rest is picked up by the next run.
    Ingest {
        /// Don't draw a progress bar
        #[clap(long, default_value = "false")]
        no_progress: bool,
    },

    /// Re-embed all captions and rewrite the search index
    Index {},

    /// Search captions
    Search {
        /// Free text query
        query: String,

        /// Number of results (defaults to semantic_search.default_limit)
        #[clap(short, long)]
        k: Option<usize>,

        /// Print ids and scores too
        #[clap(short, long, default_value = "false")]
        verbose: bool,
    },

    /// Fetch an item's image through the local cache
    Image {
        id: String,

        /// Write to this file instead of `<id>.png`
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Caption local image files without touching the ledger
    Caption {
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },

    /// Serve /search and /image over http
    Serve {},
}
