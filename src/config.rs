//! Runtime configuration.
//!
//! Configuration loads from an optional JSON file, every field has a
//! working default, and CLI flags override file values. The REST key can
//! also come from the `FINN_REST_KEY` environment variable so it never
//! has to live in a config file.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::storage::BackendKind;

/// Environment variable consulted for the REST backend key.
pub const REST_KEY_ENV: &str = "FINN_REST_KEY";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed.
        path: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// All tunables for a crawl or ingest run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScraperConfig {
    /// Search-result URL to crawl; page numbers are appended per request.
    pub base_url: String,
    /// Detail-page URL template; `{code}` is replaced by the finn code.
    pub ad_url: String,
    /// Upper bound on search pages visited per discovery run.
    pub max_pages: u32,
    /// Lower bound of the politeness delay, milliseconds.
    pub delay_min_ms: u64,
    /// Upper bound of the politeness delay, milliseconds.
    pub delay_max_ms: u64,
    /// Retry attempts per fetch before giving up.
    pub max_retries: u32,
    /// Which storage backend to use.
    pub backend: BackendKind,
    /// SQLite database path (sqlite backend).
    pub db_path: String,
    /// Identifier table path (csv backend).
    pub finn_codes_csv: String,
    /// Property table path (csv backend).
    pub properties_csv: String,
    /// Table API root (rest backend).
    pub rest_url: Option<String>,
    /// Table API key (rest backend); `FINN_REST_KEY` overrides.
    pub rest_key: Option<String>,
    /// Whether ingest enriches records with coordinates.
    pub geocode: bool,
    /// Override of the geocoding endpoint, for self-hosted instances.
    pub geocode_url: Option<String>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url:
                "https://www.finn.no/realestate/homes/search.html?location=0.20061".to_string(),
            ad_url: "https://www.finn.no/realestate/homes/ad.html?finnkode={code}".to_string(),
            max_pages: 50,
            delay_min_ms: 1000,
            delay_max_ms: 3000,
            max_retries: 3,
            backend: BackendKind::Sqlite,
            db_path: "finncrawl.db".to_string(),
            finn_codes_csv: "finn_codes.csv".to_string(),
            properties_csv: "properties.csv".to_string(),
            rest_url: None,
            rest_key: None,
            geocode: true,
            geocode_url: None,
        }
    }
}

impl ScraperConfig {
    /// Loads configuration from a JSON file, then applies environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.apply_env();
        debug!(backend = %config.backend, "loaded configuration");
        Ok(config)
    }

    /// Applies environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(REST_KEY_ENV) {
            if !key.is_empty() {
                self.rest_key = Some(key);
            }
        }
    }

    /// Builds the detail-page URL for a code.
    #[must_use]
    pub fn detail_url(&self, finn_code: &str) -> String {
        self.ad_url.replace("{code}", finn_code)
    }
}
