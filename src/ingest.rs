//! Detail-page ingest.
//!
//! Works through identifiers that still need scraping, fetches each
//! detail page, parses it into a property record, optionally enriches it
//! with coordinates, and persists record and status together. One bad
//! listing never stops the batch; only storage failures abort the run.

use tracing::{info, instrument, warn};

use crate::config::ScraperConfig;
use crate::fetch::Fetcher;
use crate::geocode::Geocoder;
use crate::listing::{ListingStatus, PropertyRecord};
use crate::parse::DetailPageParser;
use crate::storage::{ListingFilter, StorageBackend, StorageError};

/// Which identifiers an ingest run works through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestScope {
    /// Only `pending` and `failed` identifiers; the restartable default.
    NeedsScrape,
    /// Every identifier, re-scraping already captured listings.
    All,
}

impl IngestScope {
    fn filter(self) -> ListingFilter {
        match self {
            Self::NeedsScrape => ListingFilter::NeedsScrape,
            Self::All => ListingFilter::All,
        }
    }
}

/// Outcome counters for one ingest run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    /// Listings attempted.
    pub attempted: u64,
    /// Listings scraped and persisted.
    pub succeeded: u64,
    /// Listings that failed to fetch or parse.
    pub failed: u64,
}

/// Fetches and persists detail records for discovered identifiers.
pub struct DetailIngestor {
    fetcher: Fetcher,
    parser: Box<dyn DetailPageParser>,
    geocoder: Box<dyn Geocoder>,
    ad_url: String,
}

impl DetailIngestor {
    /// Creates an ingestor. `ad_url` is the detail-page template with a
    /// `{code}` placeholder.
    pub fn new(
        fetcher: Fetcher,
        parser: Box<dyn DetailPageParser>,
        geocoder: Box<dyn Geocoder>,
        ad_url: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            parser,
            geocoder,
            ad_url: ad_url.into(),
        }
    }

    /// Creates an ingestor from configuration.
    pub fn from_config(
        fetcher: Fetcher,
        parser: Box<dyn DetailPageParser>,
        geocoder: Box<dyn Geocoder>,
        config: &ScraperConfig,
    ) -> Self {
        Self::new(fetcher, parser, geocoder, config.ad_url.clone())
    }

    /// Runs one ingest pass.
    ///
    /// At most `limit` listings are attempted when a limit is given. A
    /// fetch or parse failure marks that identifier `failed` and moves on.
    ///
    /// # Errors
    ///
    /// Returns an error when storage fails; per-listing failures are
    /// counted in the summary instead.
    #[instrument(skip_all, fields(scope = ?scope, limit = ?limit))]
    pub async fn run(
        &self,
        storage: &dyn StorageBackend,
        scope: IngestScope,
        limit: Option<usize>,
    ) -> Result<IngestSummary, StorageError> {
        let mut todo = storage.list_identifiers(scope.filter()).await?;
        if let Some(limit) = limit {
            todo.truncate(limit);
        }

        let mut summary = IngestSummary::default();
        for id in &todo {
            summary.attempted += 1;
            if self.ingest_one(storage, &id.finn_code).await? {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "ingest complete"
        );
        Ok(summary)
    }

    /// Ingests one listing. Returns whether it succeeded; storage errors
    /// propagate.
    async fn ingest_one(
        &self,
        storage: &dyn StorageBackend,
        finn_code: &str,
    ) -> Result<bool, StorageError> {
        let url = self.ad_url.replace("{code}", finn_code);

        let html = match self.fetcher.fetch_page(&url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(finn_code, error = %err, "detail fetch failed");
                storage
                    .upsert_identifier(finn_code, ListingStatus::Failed)
                    .await?;
                return Ok(false);
            }
        };

        let fields = match self.parser.parse_detail_page(&html) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(finn_code, error = %err, "detail parse failed");
                storage
                    .upsert_identifier(finn_code, ListingStatus::Failed)
                    .await?;
                return Ok(false);
            }
        };

        let mut record = PropertyRecord::from_fields(finn_code, &fields);
        record.scrape_status = ListingStatus::Scraped.as_str().to_string();

        if !record.address.is_empty() && record.latitude.is_empty() {
            if let Some((lat, lon)) = self.geocoder.geocode(&record.address).await {
                record.latitude = lat.to_string();
                record.longitude = lon.to_string();
            }
        }

        storage.upsert_record(&record).await?;
        storage
            .upsert_identifier(finn_code, ListingStatus::Scraped)
            .await?;
        Ok(true)
    }
}
