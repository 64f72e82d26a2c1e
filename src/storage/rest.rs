//! REST table storage backend.
//!
//! Talks to a PostgREST-compatible endpoint (such as a Supabase table API)
//! exposing `finn_codes` and `properties` tables. Filters and ordering use
//! the PostgREST query grammar, and upserts rely on the
//! `Prefer: resolution=merge-duplicates` header.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::listing::{ListingIdentifier, ListingStatus, PropertyRecord};
use crate::storage::{
    now_timestamp, ListingFilter, StorageBackend, StorageError, StorageErrorKind,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// REST-backed [`StorageBackend`].
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestBackend {
    /// Creates a backend rooted at `base_url` (the URL under which the
    /// `finn_codes` and `properties` tables live).
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(StorageError::from)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(ToString::to_string),
        })
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}/{table}", self.base_url)
        } else {
            format!("{}/{table}?{query}", self.base_url)
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder
                .header("apikey", key)
                .header("Authorization", format!("Bearer {key}"));
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, StorageError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let kind = classify_status(status);
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::backend(
            kind,
            format!("rest backend returned {status}: {body}"),
        ))
    }

    async fn get_identifier(
        &self,
        finn_code: &str,
    ) -> Result<Option<ListingIdentifier>, StorageError> {
        let url = self.table_url(
            "finn_codes",
            &format!(
                "finn_code=eq.{}&select=finn_code,fetched_at,scrape_status",
                urlencoding::encode(finn_code)
            ),
        );
        let rows: Vec<ListingIdentifier> =
            self.send(self.request(Method::GET, &url)).await?.json().await?;
        Ok(rows.into_iter().next())
    }
}

/// Maps an HTTP status to a retryability class. Rate limiting and server
/// errors are worth retrying; everything else is not.
fn classify_status(status: StatusCode) -> StorageErrorKind {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StorageErrorKind::Transient
    } else {
        StorageErrorKind::Permanent
    }
}

/// PostgREST filter clause for a listing filter.
fn filter_clause(filter: ListingFilter) -> Option<String> {
    match filter {
        ListingFilter::All => None,
        ListingFilter::Status(status) => Some(format!("scrape_status=eq.{}", status.as_str())),
        ListingFilter::NeedsScrape => Some("scrape_status=in.(pending,failed)".to_string()),
    }
}

#[async_trait]
impl StorageBackend for RestBackend {
    #[instrument(skip(self))]
    async fn upsert_identifier(
        &self,
        finn_code: &str,
        status: ListingStatus,
    ) -> Result<(), StorageError> {
        let Some(existing) = self.get_identifier(finn_code).await? else {
            let url = self.table_url("finn_codes", "");
            let row = json!({
                "finn_code": finn_code,
                "fetched_at": now_timestamp(),
                "scrape_status": status.as_str(),
            });
            let result = self
                .send(
                    self.request(Method::POST, &url)
                        .header("Prefer", "return=minimal")
                        .json(&row),
                )
                .await;
            match result {
                Ok(_) => return Ok(()),
                // Lost a create race; fall through to the update path.
                Err(err) if err.to_string().contains("409") => {
                    warn!(finn_code, "identifier insert conflict, retrying as update");
                }
                Err(err) => return Err(err),
            }
            let Some(existing) = self.get_identifier(finn_code).await? else {
                return Ok(());
            };
            return update_status(self, finn_code, &existing, status).await;
        };
        update_status(self, finn_code, &existing, status).await
    }

    #[instrument(skip(self))]
    async fn list_identifiers(
        &self,
        filter: ListingFilter,
    ) -> Result<Vec<ListingIdentifier>, StorageError> {
        let mut query = String::from("select=finn_code,fetched_at,scrape_status");
        if let Some(clause) = filter_clause(filter) {
            query.push('&');
            query.push_str(&clause);
        }
        query.push_str("&order=fetched_at.asc,finn_code.asc");
        let url = self.table_url("finn_codes", &query);
        let rows = self.send(self.request(Method::GET, &url)).await?.json().await?;
        Ok(rows)
    }

    #[instrument(skip_all, fields(live = live_codes.len()))]
    async fn mark_inactive(&self, live_codes: &BTreeSet<String>) -> Result<u64, StorageError> {
        let stored = self.list_identifiers(ListingFilter::All).await?;
        let mut marked = 0u64;
        for id in stored {
            if id.status() == ListingStatus::Inactive || live_codes.contains(&id.finn_code) {
                continue;
            }
            let url = self.table_url(
                "finn_codes",
                &format!(
                    "finn_code=eq.{}&scrape_status=neq.inactive",
                    urlencoding::encode(&id.finn_code)
                ),
            );
            let changed: Vec<serde_json::Value> = self
                .send(
                    self.request(Method::PATCH, &url)
                        .header("Prefer", "return=representation")
                        .json(&json!({ "scrape_status": ListingStatus::Inactive.as_str() })),
                )
                .await?
                .json()
                .await?;
            marked += changed.len() as u64;
        }
        debug!(marked, "inactive reconciliation complete");
        Ok(marked)
    }

    #[instrument(skip_all, fields(finn_code = %record.finn_code))]
    async fn upsert_record(&self, record: &PropertyRecord) -> Result<(), StorageError> {
        let url = self.table_url("properties", "");
        self.send(
            self.request(Method::POST, &url)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(record),
        )
        .await?;
        Ok(())
    }

    async fn record_exists(&self, finn_code: &str) -> Result<bool, StorageError> {
        let url = self.table_url(
            "properties",
            &format!("finn_code=eq.{}&select=finn_code", urlencoding::encode(finn_code)),
        );
        let rows: Vec<serde_json::Value> =
            self.send(self.request(Method::GET, &url)).await?.json().await?;
        Ok(!rows.is_empty())
    }

    #[instrument(skip(self))]
    async fn fetch_records(&self) -> Result<Vec<PropertyRecord>, StorageError> {
        let url = self.table_url("properties", "select=*&order=finn_code.asc");
        let rows = self.send(self.request(Method::GET, &url)).await?.json().await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn drop_schema(&self) -> Result<(), StorageError> {
        for table in ["finn_codes", "properties"] {
            let url = self.table_url(table, "finn_code=not.is.null");
            self.send(self.request(Method::DELETE, &url)).await?;
        }
        Ok(())
    }
}

/// Applies the transition table and issues a guarded PATCH when the status
/// actually changes. The `scrape_status=eq.<current>` filter acts as a
/// compare-and-set against concurrent writers.
async fn update_status(
    backend: &RestBackend,
    finn_code: &str,
    existing: &ListingIdentifier,
    proposed: ListingStatus,
) -> Result<(), StorageError> {
    let current = existing.status();
    let next = current.apply(proposed);
    if next == current {
        return Ok(());
    }
    let url = backend.table_url(
        "finn_codes",
        &format!(
            "finn_code=eq.{}&scrape_status=eq.{}",
            urlencoding::encode(finn_code),
            current.as_str()
        ),
    );
    backend
        .send(
            backend
                .request(Method::PATCH, &url)
                .header("Prefer", "return=minimal")
                .json(&json!({ "scrape_status": next.as_str() })),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_table_url_builds_query() {
        let backend = RestBackend::new("https://api.example.com/rest/v1/", None).unwrap();
        assert_eq!(
            backend.table_url("finn_codes", "finn_code=eq.100"),
            "https://api.example.com/rest/v1/finn_codes?finn_code=eq.100"
        );
        assert_eq!(
            backend.table_url("properties", ""),
            "https://api.example.com/rest/v1/properties"
        );
    }

    #[test]
    fn test_filter_clause_grammar() {
        assert_eq!(filter_clause(ListingFilter::All), None);
        assert_eq!(
            filter_clause(ListingFilter::Status(ListingStatus::Inactive)).unwrap(),
            "scrape_status=eq.inactive"
        );
        assert_eq!(
            filter_clause(ListingFilter::NeedsScrape).unwrap(),
            "scrape_status=in.(pending,failed)"
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            StorageErrorKind::Transient
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            StorageErrorKind::Transient
        );
        assert_eq!(
            classify_status(StatusCode::CONFLICT),
            StorageErrorKind::Permanent
        );
    }
}
