//! CLI entry point for the listing scraper.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use finncrawl_core::{
    create_backend, DetailIngestor, DiscoveryCrawler, Fetcher, FinnDetailParser,
    FinnListingParser, Geocoder, IngestScope, NominatimGeocoder, NoopGeocoder, PageClient,
    PolitenessGate, RetryPolicy, ScraperConfig,
};
use tracing::{debug, info};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = build_config(&args)?;
    let storage = create_backend(&config).await?;

    if args.drop_schema {
        info!("dropping and recreating storage schema");
        storage.drop_schema().await?;
    }

    match args.command {
        Command::Discover {
            max_pages,
            base_url,
        } => {
            let base_url = base_url.unwrap_or_else(|| config.base_url.clone());
            let max_pages = max_pages.unwrap_or(config.max_pages);
            let crawler = DiscoveryCrawler::new(
                build_fetcher(&config),
                Box::new(FinnListingParser::new()),
                base_url,
                max_pages,
            );

            let summary = crawler.run(storage.as_ref()).await?;
            info!(
                pages = summary.pages_visited,
                new = summary.new_codes,
                reaffirmed = summary.reaffirmed_codes,
                inactive = summary.marked_inactive,
                errors = summary.errors,
                "Discovery complete"
            );
            if summary.errors > 0 && summary.new_codes + summary.reaffirmed_codes == 0 {
                bail!("discovery made no progress: every page failed to fetch");
            }
        }
        Command::Ingest {
            limit,
            all,
            no_geocode,
        } => {
            let geocoder: Box<dyn Geocoder> = if no_geocode || !config.geocode {
                Box::new(NoopGeocoder)
            } else if let Some(url) = &config.geocode_url {
                Box::new(NominatimGeocoder::with_endpoint(url.clone()))
            } else {
                Box::new(NominatimGeocoder::new())
            };
            let ingestor = DetailIngestor::from_config(
                build_fetcher(&config),
                Box::new(FinnDetailParser::new()),
                geocoder,
                &config,
            );

            let scope = if all {
                IngestScope::All
            } else {
                IngestScope::NeedsScrape
            };
            let summary = ingestor.run(storage.as_ref(), scope, limit).await?;
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Ingest complete"
            );
            if summary.attempted > 0 && summary.succeeded == 0 {
                bail!("ingest made no progress: every listing failed");
            }
        }
        Command::Export {
            identifiers,
            properties,
        } => {
            storage.export(&identifiers, &properties).await?;
            info!(
                identifiers = %identifiers.display(),
                properties = %properties.display(),
                "Export complete"
            );
        }
    }

    Ok(())
}

/// Loads the config file (when given) and applies CLI overrides.
fn build_config(args: &Args) -> Result<ScraperConfig> {
    let mut config = match &args.config {
        Some(path) => ScraperConfig::load(path)?,
        None => {
            let mut config = ScraperConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(db_path) = &args.db_path {
        config.db_path = db_path.clone();
    }
    if let Some(delay) = args.delay_min_ms {
        config.delay_min_ms = delay;
    }
    if let Some(delay) = args.delay_max_ms {
        config.delay_max_ms = delay;
    }
    Ok(config)
}

fn build_fetcher(config: &ScraperConfig) -> Fetcher {
    let gate = if config.delay_min_ms == 0 && config.delay_max_ms == 0 {
        debug!("politeness delay disabled");
        PolitenessGate::disabled()
    } else {
        PolitenessGate::new(
            Duration::from_millis(config.delay_min_ms),
            Duration::from_millis(config.delay_max_ms),
        )
    };
    let policy = RetryPolicy::with_max_attempts(config.max_retries);
    Fetcher::new(PageClient::new(), gate, policy)
}
