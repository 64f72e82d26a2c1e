//! Discovery crawl.
//!
//! Walks numbered search-result pages, records every listing identifier it
//! sees, and reconciles liveness afterwards: stored codes that no longer
//! appear in the search results are marked inactive. Discovery only ever
//! proposes `pending`; the storage transition table decides what that
//! means for codes that are already scraped, failed, or inactive.

use std::collections::BTreeSet;

use tracing::{info, instrument, warn};
use url::Url;

use crate::fetch::Fetcher;
use crate::listing::ListingStatus;
use crate::parse::ListingPageParser;
use crate::storage::{ListingFilter, StorageBackend, StorageError};

/// Outcome counters for one discovery run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Search pages attempted.
    pub pages_visited: u32,
    /// Codes seen for the first time.
    pub new_codes: u64,
    /// Codes already known that appeared again.
    pub reaffirmed_codes: u64,
    /// Stored codes marked inactive by the reconciliation pass.
    pub marked_inactive: u64,
    /// Pages that failed to fetch and were skipped.
    pub errors: u64,
}

/// Crawls search-result pages and maintains the identifier table.
pub struct DiscoveryCrawler {
    fetcher: Fetcher,
    parser: Box<dyn ListingPageParser>,
    base_url: String,
    max_pages: u32,
}

impl DiscoveryCrawler {
    /// Creates a crawler over `base_url`, visiting at most `max_pages`
    /// result pages.
    pub fn new(
        fetcher: Fetcher,
        parser: Box<dyn ListingPageParser>,
        base_url: impl Into<String>,
        max_pages: u32,
    ) -> Self {
        Self {
            fetcher,
            parser,
            base_url: base_url.into(),
            max_pages,
        }
    }

    /// Runs a full discovery pass against `storage`.
    ///
    /// A page that fails to fetch is skipped, not fatal. The crawl stops
    /// early at the first page that yields no codes. The inactive
    /// reconciliation only runs when the crawl saw at least one code, so a
    /// broken selector or an outage cannot mass-deactivate the table.
    ///
    /// # Errors
    ///
    /// Returns an error when storage itself fails; fetch errors are
    /// counted in the summary instead.
    #[instrument(skip_all, fields(max_pages = self.max_pages))]
    pub async fn run(&self, storage: &dyn StorageBackend) -> Result<CrawlSummary, StorageError> {
        let known: BTreeSet<String> = storage
            .list_identifiers(ListingFilter::All)
            .await?
            .into_iter()
            .map(|id| id.finn_code)
            .collect();

        let mut summary = CrawlSummary::default();
        let mut seen = BTreeSet::new();

        for page in 1..=self.max_pages {
            summary.pages_visited += 1;
            let url = page_url(&self.base_url, page);

            let html = match self.fetcher.fetch_page(&url).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(page, error = %err, "skipping unfetchable search page");
                    summary.errors += 1;
                    continue;
                }
            };

            let codes = self.parser.parse_listing_page(&html);
            if codes.is_empty() {
                info!(page, "empty search page, stopping crawl");
                break;
            }

            for code in codes {
                if !seen.insert(code.clone()) {
                    continue;
                }
                if known.contains(&code) {
                    summary.reaffirmed_codes += 1;
                } else {
                    summary.new_codes += 1;
                }
                storage
                    .upsert_identifier(&code, ListingStatus::Pending)
                    .await?;
            }
        }

        if seen.is_empty() {
            warn!("crawl saw no codes, skipping inactive reconciliation");
        } else {
            summary.marked_inactive = storage.mark_inactive(&seen).await?;
        }

        info!(
            pages = summary.pages_visited,
            new = summary.new_codes,
            reaffirmed = summary.reaffirmed_codes,
            inactive = summary.marked_inactive,
            errors = summary.errors,
            "discovery complete"
        );
        Ok(summary)
    }
}

/// Appends or replaces the `page` query parameter.
fn page_url(base_url: &str, page: u32) -> String {
    match Url::parse(base_url) {
        Ok(mut url) => {
            let others: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(name, _)| name != "page")
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(others)
                .append_pair("page", &page.to_string());
            url.to_string()
        }
        Err(_) => format!("{base_url}&page={page}"),
    }
}
