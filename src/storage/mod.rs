//! Storage backends.
//!
//! All persistence goes through the [`StorageBackend`] trait so the crawl
//! and ingest pipelines stay oblivious to whether state lives in SQLite,
//! CSV files, or a remote REST table. Backends must agree on semantics:
//! the same operation sequence produces the same observable state
//! everywhere, which the export format makes byte-comparable.

pub mod csv;
pub mod rest;
pub mod sqlite;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::ScraperConfig;
use crate::listing::{ListingIdentifier, ListingStatus, PropertyRecord, PROPERTY_FIELDS};

pub use self::csv::CsvBackend;
pub use self::rest::RestBackend;
pub use self::sqlite::SqliteBackend;

/// RFC 3339 timestamp for first-sighting records, second precision so
/// exports stay stable across backends.
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Whether a storage failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Likely to succeed on retry (lock contention, timeouts, 5xx).
    Transient,
    /// Will not succeed on retry (constraint violations, bad config, 4xx).
    Permanent,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A backend operation failed.
    #[error("storage error ({kind}): {message}")]
    Backend {
        /// Retryability classification.
        kind: StorageErrorKind,
        /// Human-readable description.
        message: String,
    },

    /// A filesystem operation failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Affected path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Export serialization failed.
    #[error("export failed: {0}")]
    Export(String),
}

impl StorageError {
    /// Creates a backend error with the given classification.
    pub fn backend(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self::Backend {
            kind,
            message: message.into(),
        }
    }

    /// Creates an io error for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true when a retry could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend { kind, .. } => *kind == StorageErrorKind::Transient,
            Self::Io { .. } | Self::Export(_) => false,
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => StorageErrorKind::Transient,
            sqlx::Error::Database(db) => {
                let message = db.message().to_lowercase();
                if message.contains("locked") || message.contains("busy") {
                    StorageErrorKind::Transient
                } else {
                    StorageErrorKind::Permanent
                }
            }
            _ => StorageErrorKind::Permanent,
        };
        Self::backend(kind, err.to_string())
    }
}

impl From<::csv::Error> for StorageError {
    fn from(err: ::csv::Error) -> Self {
        Self::Export(err.to_string())
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() {
            StorageErrorKind::Transient
        } else {
            StorageErrorKind::Permanent
        };
        Self::backend(kind, err.to_string())
    }
}

/// Selects which identifiers an enumeration returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFilter {
    /// Every known identifier.
    All,
    /// Identifiers in exactly the given status.
    Status(ListingStatus),
    /// Identifiers eligible for (re-)ingest: pending or failed.
    NeedsScrape,
}

impl ListingFilter {
    /// Returns true when the identifier passes the filter.
    #[must_use]
    pub fn matches(&self, identifier: &ListingIdentifier) -> bool {
        match self {
            Self::All => true,
            Self::Status(status) => identifier.status() == *status,
            Self::NeedsScrape => matches!(
                identifier.status(),
                ListingStatus::Pending | ListingStatus::Failed
            ),
        }
    }
}

/// Uniform persistence contract shared by every backend.
///
/// Status writes go through [`ListingStatus::apply`], so illegal
/// transitions degrade to keeping the current status rather than failing.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Records a discovered identifier.
    ///
    /// New codes are stored with the proposed status and the current
    /// timestamp. Known codes keep their original `fetched_at` and move
    /// status only along legal transitions.
    async fn upsert_identifier(
        &self,
        finn_code: &str,
        status: ListingStatus,
    ) -> Result<(), StorageError>;

    /// Lists identifiers matching the filter, ordered by
    /// (`fetched_at`, `finn_code`) ascending.
    async fn list_identifiers(
        &self,
        filter: ListingFilter,
    ) -> Result<Vec<ListingIdentifier>, StorageError>;

    /// Marks every stored identifier NOT in `live_codes` as inactive.
    /// Returns how many rows changed status.
    async fn mark_inactive(&self, live_codes: &BTreeSet<String>) -> Result<u64, StorageError>;

    /// Inserts or fully replaces a property record.
    async fn upsert_record(&self, record: &PropertyRecord) -> Result<(), StorageError>;

    /// Returns true when a property record exists for the code.
    async fn record_exists(&self, finn_code: &str) -> Result<bool, StorageError>;

    /// Fetches all property records ordered by `finn_code` ascending.
    async fn fetch_records(&self) -> Result<Vec<PropertyRecord>, StorageError>;

    /// Drops and recreates all storage, discarding existing state.
    async fn drop_schema(&self) -> Result<(), StorageError>;

    /// Writes both tables as CSV snapshots with a fixed column order.
    ///
    /// The output is deterministic for a given state, so two backends in
    /// the same state export byte-identical files.
    async fn export(
        &self,
        identifiers_path: &Path,
        properties_path: &Path,
    ) -> Result<(), StorageError> {
        let identifiers = self.list_identifiers(ListingFilter::All).await?;
        let mut writer = ::csv::Writer::from_path(identifiers_path)
            .map_err(|e| StorageError::Export(e.to_string()))?;
        writer.write_record(["finn_code", "fetched_at", "scrape_status"])?;
        for id in &identifiers {
            writer.write_record([
                id.finn_code.as_str(),
                id.fetched_at.as_str(),
                id.scrape_status.as_str(),
            ])?;
        }
        writer.flush().map_err(|e| StorageError::Export(e.to_string()))?;

        let records = self.fetch_records().await?;
        let mut writer = ::csv::Writer::from_path(properties_path)
            .map_err(|e| StorageError::Export(e.to_string()))?;
        let mut header = vec!["finn_code"];
        header.extend_from_slice(&PROPERTY_FIELDS);
        header.push("scrape_status");
        writer.write_record(&header)?;
        for record in &records {
            let mut row = vec![record.finn_code.as_str()];
            for name in PROPERTY_FIELDS {
                row.push(record.field(name));
            }
            row.push(record.scrape_status.as_str());
            writer.write_record(&row)?;
        }
        writer.flush().map_err(|e| StorageError::Export(e.to_string()))?;
        Ok(())
    }
}

/// Which backend implementation to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local SQLite database.
    Sqlite,
    /// Paired CSV files on the local filesystem.
    Csv,
    /// Remote REST table endpoint.
    Rest,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Csv => write!(f, "csv"),
            Self::Rest => write!(f, "rest"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "csv" => Ok(Self::Csv),
            "rest" => Ok(Self::Rest),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Builds the backend named by the configuration.
///
/// # Errors
///
/// Returns an error when the backend cannot be initialized, or when the
/// configuration is missing a required setting (such as the REST URL).
pub async fn create_backend(
    config: &ScraperConfig,
) -> Result<Box<dyn StorageBackend>, StorageError> {
    match config.backend {
        BackendKind::Sqlite => {
            let backend = SqliteBackend::open(&config.db_path).await?;
            Ok(Box::new(backend))
        }
        BackendKind::Csv => {
            let backend =
                CsvBackend::open(&config.finn_codes_csv, &config.properties_csv).await?;
            Ok(Box::new(backend))
        }
        BackendKind::Rest => {
            let url = config.rest_url.as_deref().ok_or_else(|| {
                StorageError::backend(
                    StorageErrorKind::Permanent,
                    "rest backend requires rest_url",
                )
            })?;
            let backend = RestBackend::new(url, config.rest_key.as_deref())?;
            Ok(Box::new(backend))
        }
    }
}
