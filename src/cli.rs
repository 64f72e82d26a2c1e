//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use finncrawl_core::BackendKind;

/// Discover and ingest real-estate listings from finn.no search results.
///
/// finncrawl walks search pages to collect listing identifiers, then
/// scrapes each detail page into structured property records, persisting
/// state in SQLite, CSV files, or a remote REST table.
#[derive(Parser, Debug)]
#[command(name = "finncrawl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Storage backend (sqlite, csv, rest)
    #[arg(short, long, global = true)]
    pub backend: Option<BackendKind>,

    /// SQLite database path (sqlite backend)
    #[arg(long, global = true)]
    pub db_path: Option<String>,

    /// Drop and recreate all storage before running
    #[arg(long, global = true)]
    pub drop_schema: bool,

    /// Minimum delay between requests in milliseconds
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub delay_min_ms: Option<u64>,

    /// Maximum delay between requests in milliseconds
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub delay_max_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crawl search pages and record listing identifiers
    Discover {
        /// Maximum search pages to visit
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=1000))]
        max_pages: Option<u32>,

        /// Search-result URL to crawl
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Scrape detail pages for discovered identifiers
    Ingest {
        /// Stop after this many listings
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Re-scrape every identifier, not just pending and failed ones
        #[arg(long)]
        all: bool,

        /// Skip coordinate enrichment
        #[arg(long)]
        no_geocode: bool,
    },
    /// Write both tables as CSV snapshots
    Export {
        /// Output path for the identifier table
        #[arg(long, default_value = "finn_codes_export.csv")]
        identifiers: PathBuf,

        /// Output path for the property table
        #[arg(long, default_value = "properties_export.csv")]
        properties: PathBuf,
    },
}
