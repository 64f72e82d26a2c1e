//! SQLite storage backend.
//!
//! The default backend: a single local database file in WAL mode with a
//! small connection pool. Schema creation is idempotent, so opening an
//! existing database is a no-op.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, instrument};

use crate::listing::{ListingIdentifier, ListingStatus, PropertyRecord, PROPERTY_FIELDS};
use crate::storage::{now_timestamp, ListingFilter, StorageBackend, StorageError};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const CREATE_FINN_CODES: &str = "
CREATE TABLE IF NOT EXISTS finn_codes (
    finn_code TEXT PRIMARY KEY,
    fetched_at TEXT NOT NULL,
    scrape_status TEXT NOT NULL DEFAULT 'pending'
)";

/// SQLite-backed [`StorageBackend`].
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Opens (creating if needed) the database at `path` and ensures the
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or the schema
    /// cannot be created.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let backend = Self { pool };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    /// Opens an in-memory database, used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error when the schema cannot be created.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // A single connection keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let backend = Self { pool };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(CREATE_FINN_CODES).execute(&self.pool).await?;
        sqlx::query(&create_properties_sql())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Builds the `properties` DDL from the canonical field list so column
/// order always matches the export order.
fn create_properties_sql() -> String {
    let columns: Vec<String> = PROPERTY_FIELDS
        .iter()
        .map(|name| format!("{name} TEXT NOT NULL DEFAULT ''"))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS properties (\n    finn_code TEXT PRIMARY KEY,\n    {},\n    scrape_status TEXT NOT NULL DEFAULT 'pending'\n)",
        columns.join(",\n    ")
    )
}

fn upsert_record_sql() -> String {
    let mut columns = vec!["finn_code".to_string()];
    columns.extend(PROPERTY_FIELDS.iter().map(ToString::to_string));
    columns.push("scrape_status".to_string());
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT OR REPLACE INTO properties ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self))]
    async fn upsert_identifier(
        &self,
        finn_code: &str,
        status: ListingStatus,
    ) -> Result<(), StorageError> {
        let inserted = sqlx::query(
            "INSERT INTO finn_codes (finn_code, fetched_at, scrape_status)
             VALUES (?, ?, ?)
             ON CONFLICT(finn_code) DO NOTHING",
        )
        .bind(finn_code)
        .bind(now_timestamp())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            debug!(finn_code, status = %status, "inserted new identifier");
            return Ok(());
        }

        // Known code: move its status only along legal transitions, with a
        // compare-and-set so a concurrent writer cannot be overwritten.
        loop {
            let current: Option<(String,)> =
                sqlx::query_as("SELECT scrape_status FROM finn_codes WHERE finn_code = ?")
                    .bind(finn_code)
                    .fetch_optional(&self.pool)
                    .await?;
            let Some((current,)) = current else {
                return Ok(());
            };
            let current: ListingStatus = current.parse().unwrap_or(ListingStatus::Pending);
            let next = current.apply(status);
            if next == current {
                return Ok(());
            }
            let updated = sqlx::query(
                "UPDATE finn_codes SET scrape_status = ?
                 WHERE finn_code = ? AND scrape_status = ?",
            )
            .bind(next.as_str())
            .bind(finn_code)
            .bind(current.as_str())
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() > 0 {
                debug!(finn_code, from = %current, to = %next, "updated identifier status");
                return Ok(());
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_identifiers(
        &self,
        filter: ListingFilter,
    ) -> Result<Vec<ListingIdentifier>, StorageError> {
        const ORDER: &str = "ORDER BY fetched_at ASC, finn_code ASC";
        let rows = match filter {
            ListingFilter::All => {
                sqlx::query_as(&format!(
                    "SELECT finn_code, fetched_at, scrape_status FROM finn_codes {ORDER}"
                ))
                .fetch_all(&self.pool)
                .await?
            }
            ListingFilter::Status(status) => {
                sqlx::query_as(&format!(
                    "SELECT finn_code, fetched_at, scrape_status FROM finn_codes
                     WHERE scrape_status = ? {ORDER}"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            ListingFilter::NeedsScrape => {
                sqlx::query_as(&format!(
                    "SELECT finn_code, fetched_at, scrape_status FROM finn_codes
                     WHERE scrape_status IN ('pending', 'failed') {ORDER}"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    #[instrument(skip_all, fields(live = live_codes.len()))]
    async fn mark_inactive(&self, live_codes: &BTreeSet<String>) -> Result<u64, StorageError> {
        let stored: Vec<(String,)> = sqlx::query_as(
            "SELECT finn_code FROM finn_codes WHERE scrape_status != 'inactive'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut marked = 0u64;
        for (code,) in stored {
            if live_codes.contains(&code) {
                continue;
            }
            let updated = sqlx::query(
                "UPDATE finn_codes SET scrape_status = 'inactive'
                 WHERE finn_code = ? AND scrape_status != 'inactive'",
            )
            .bind(&code)
            .execute(&self.pool)
            .await?;
            marked += updated.rows_affected();
        }
        debug!(marked, "inactive reconciliation complete");
        Ok(marked)
    }

    #[instrument(skip_all, fields(finn_code = %record.finn_code))]
    async fn upsert_record(&self, record: &PropertyRecord) -> Result<(), StorageError> {
        let sql = upsert_record_sql();
        let mut query = sqlx::query(&sql).bind(&record.finn_code);
        for name in PROPERTY_FIELDS {
            query = query.bind(record.field(name));
        }
        query = query.bind(&record.scrape_status);
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn record_exists(&self, finn_code: &str) -> Result<bool, StorageError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM properties WHERE finn_code = ?")
                .bind(finn_code)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn fetch_records(&self) -> Result<Vec<PropertyRecord>, StorageError> {
        let rows = sqlx::query_as("SELECT * FROM properties ORDER BY finn_code ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn drop_schema(&self) -> Result<(), StorageError> {
        sqlx::query("DROP TABLE IF EXISTS finn_codes")
            .execute(&self.pool)
            .await?;
        sqlx::query("DROP TABLE IF EXISTS properties")
            .execute(&self.pool)
            .await?;
        self.ensure_schema().await
    }
}
