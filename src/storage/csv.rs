//! CSV file storage backend.
//!
//! Keeps the full state in memory behind a mutex and persists both tables
//! to CSV after every mutation, writing to a temp file and renaming so a
//! crash never leaves a half-written file. Suitable for small crawls and
//! for diffing state in version control.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::listing::{ListingIdentifier, ListingStatus, PropertyRecord};
use crate::storage::{now_timestamp, ListingFilter, StorageBackend, StorageError};

struct CsvState {
    identifiers: BTreeMap<String, ListingIdentifier>,
    records: BTreeMap<String, PropertyRecord>,
}

/// CSV-backed [`StorageBackend`] over a pair of files.
pub struct CsvBackend {
    identifiers_path: PathBuf,
    records_path: PathBuf,
    state: Mutex<CsvState>,
}

impl CsvBackend {
    /// Opens the backend, loading any existing files.
    ///
    /// Missing files start as empty state and are created on first write.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing file cannot be read or parsed.
    #[instrument(skip_all, fields(
        identifiers = %identifiers_path.as_ref().display(),
        records = %records_path.as_ref().display(),
    ))]
    pub async fn open(
        identifiers_path: impl AsRef<Path>,
        records_path: impl AsRef<Path>,
    ) -> Result<Self, StorageError> {
        let identifiers_path = identifiers_path.as_ref().to_path_buf();
        let records_path = records_path.as_ref().to_path_buf();

        let identifiers = load_table::<ListingIdentifier>(&identifiers_path)?
            .into_iter()
            .map(|id| (id.finn_code.clone(), id))
            .collect();
        let records = load_table::<PropertyRecord>(&records_path)?
            .into_iter()
            .map(|r| (r.finn_code.clone(), r))
            .collect();

        Ok(Self {
            identifiers_path,
            records_path,
            state: Mutex::new(CsvState {
                identifiers,
                records,
            }),
        })
    }

    fn persist_identifiers(&self, state: &CsvState) -> Result<(), StorageError> {
        let mut rows: Vec<&ListingIdentifier> = state.identifiers.values().collect();
        rows.sort_by(|a, b| {
            (a.fetched_at.as_str(), a.finn_code.as_str())
                .cmp(&(b.fetched_at.as_str(), b.finn_code.as_str()))
        });
        write_table(&self.identifiers_path, &rows)
    }

    fn persist_records(&self, state: &CsvState) -> Result<(), StorageError> {
        let rows: Vec<&PropertyRecord> = state.records.values().collect();
        write_table(&self.records_path, &rows)
    }
}

fn load_table<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    debug!(path = %path.display(), rows = rows.len(), "loaded csv table");
    Ok(rows)
}

/// Serializes rows to `path` atomically via a sibling temp file.
fn write_table<T: serde::Serialize>(path: &Path, rows: &[&T]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(|e| StorageError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

#[async_trait]
impl StorageBackend for CsvBackend {
    #[instrument(skip(self))]
    async fn upsert_identifier(
        &self,
        finn_code: &str,
        status: ListingStatus,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        match state.identifiers.get_mut(finn_code) {
            Some(existing) => {
                let next = existing.status().apply(status);
                if next == existing.status() {
                    return Ok(());
                }
                existing.scrape_status = next.as_str().to_string();
            }
            None => {
                let mut id = ListingIdentifier::new(finn_code, now_timestamp());
                id.scrape_status = status.as_str().to_string();
                state.identifiers.insert(finn_code.to_string(), id);
            }
        }
        self.persist_identifiers(&state)
    }

    #[instrument(skip(self))]
    async fn list_identifiers(
        &self,
        filter: ListingFilter,
    ) -> Result<Vec<ListingIdentifier>, StorageError> {
        let state = self.state.lock().await;
        let mut rows: Vec<ListingIdentifier> = state
            .identifiers
            .values()
            .filter(|id| filter.matches(id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.fetched_at.as_str(), a.finn_code.as_str())
                .cmp(&(b.fetched_at.as_str(), b.finn_code.as_str()))
        });
        Ok(rows)
    }

    #[instrument(skip_all, fields(live = live_codes.len()))]
    async fn mark_inactive(&self, live_codes: &BTreeSet<String>) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let mut marked = 0u64;
        for id in state.identifiers.values_mut() {
            if id.status() == ListingStatus::Inactive || live_codes.contains(&id.finn_code) {
                continue;
            }
            id.scrape_status = ListingStatus::Inactive.as_str().to_string();
            marked += 1;
        }
        if marked > 0 {
            self.persist_identifiers(&state)?;
        }
        debug!(marked, "inactive reconciliation complete");
        Ok(marked)
    }

    #[instrument(skip_all, fields(finn_code = %record.finn_code))]
    async fn upsert_record(&self, record: &PropertyRecord) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .records
            .insert(record.finn_code.clone(), record.clone());
        self.persist_records(&state)
    }

    async fn record_exists(&self, finn_code: &str) -> Result<bool, StorageError> {
        let state = self.state.lock().await;
        Ok(state.records.contains_key(finn_code))
    }

    async fn fetch_records(&self) -> Result<Vec<PropertyRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.records.values().cloned().collect())
    }

    #[instrument(skip(self))]
    async fn drop_schema(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.identifiers.clear();
        state.records.clear();
        for path in [&self.identifiers_path, &self.records_path] {
            if path.exists() {
                std::fs::remove_file(path).map_err(|e| StorageError::io(path, e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend(dir: &TempDir) -> CsvBackend {
        CsvBackend::open(
            dir.path().join("finn_codes.csv"),
            dir.path().join("properties.csv"),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = backend(&dir).await;
            backend
                .upsert_identifier("100", ListingStatus::Pending)
                .await
                .unwrap();
            backend
                .upsert_identifier("100", ListingStatus::Scraped)
                .await
                .unwrap();
        }

        let reopened = backend(&dir).await;
        let ids = reopened.list_identifiers(ListingFilter::All).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].status(), ListingStatus::Scraped);
    }

    #[tokio::test]
    async fn test_status_transitions_apply() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;

        backend
            .upsert_identifier("100", ListingStatus::Scraped)
            .await
            .unwrap();
        backend
            .upsert_identifier("100", ListingStatus::Pending)
            .await
            .unwrap();

        let ids = backend.list_identifiers(ListingFilter::All).await.unwrap();
        assert_eq!(ids[0].status(), ListingStatus::Scraped);
    }

    #[tokio::test]
    async fn test_mark_inactive_counts_changes() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend
            .upsert_identifier("100", ListingStatus::Pending)
            .await
            .unwrap();
        backend
            .upsert_identifier("200", ListingStatus::Scraped)
            .await
            .unwrap();

        let live: BTreeSet<String> = ["100".to_string()].into();
        assert_eq!(backend.mark_inactive(&live).await.unwrap(), 1);
        assert_eq!(backend.mark_inactive(&live).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_records_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let mut record = PropertyRecord {
            finn_code: "100".to_string(),
            title: "Hybel med utsikt".to_string(),
            ..PropertyRecord::default()
        };
        record.scrape_status = ListingStatus::Scraped.as_str().to_string();

        {
            let backend = backend(&dir).await;
            backend.upsert_record(&record).await.unwrap();
        }

        let reopened = backend(&dir).await;
        assert!(reopened.record_exists("100").await.unwrap());
        let records = reopened.fetch_records().await.unwrap();
        assert_eq!(records, vec![record]);
    }

    #[tokio::test]
    async fn test_drop_schema_removes_files() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend
            .upsert_identifier("100", ListingStatus::Pending)
            .await
            .unwrap();

        backend.drop_schema().await.unwrap();
        assert!(!dir.path().join("finn_codes.csv").exists());
        assert!(backend
            .list_identifiers(ListingFilter::All)
            .await
            .unwrap()
            .is_empty());
    }
}
