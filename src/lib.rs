//! Finncrawl Core Library
//!
//! This library provides the core functionality for the finncrawl tool,
//! which discovers real-estate listings from a paginated search interface
//! and ingests their detail pages into interchangeable storage backends.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`listing`] - Listing identifier/record types and the status state machine
//! - [`fetch`] - HTTP page fetching with retries and a politeness gate
//! - [`parse`] - Pluggable page parsers for search and detail pages
//! - [`storage`] - Backend-agnostic persistence (SQLite, CSV, REST table)
//! - [`discovery`] - Pagination crawl that maintains the identifier set
//! - [`ingest`] - Detail-page scraping for pending identifiers
//! - [`geocode`] - Optional address enrichment
//! - [`config`] - Immutable process configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod discovery;
pub mod fetch;
pub mod geocode;
pub mod ingest;
pub mod listing;
pub mod parse;
pub mod storage;

// Re-export commonly used types
pub use config::ScraperConfig;
pub use discovery::{CrawlSummary, DiscoveryCrawler};
pub use fetch::{
    DEFAULT_MAX_RETRIES, FailureType, FetchError, Fetcher, PageClient, PolitenessGate,
    RetryDecision, RetryPolicy, classify_error,
};
pub use geocode::{Geocoder, NominatimGeocoder, NoopGeocoder};
pub use ingest::{DetailIngestor, IngestScope, IngestSummary};
pub use listing::{ListingIdentifier, ListingStatus, PropertyRecord};
pub use parse::{
    DetailPageParser, FinnDetailParser, FinnListingParser, ListingPageParser, ParseError,
};
pub use storage::{
    BackendKind, ListingFilter, StorageBackend, StorageError, StorageErrorKind, create_backend,
};
