//! Address geocoding.
//!
//! Geocoding is strictly best-effort enrichment: a lookup failure never
//! fails the surrounding ingest, it just leaves the coordinate fields
//! empty. The default implementation queries a Nominatim-compatible
//! search endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument, warn};

const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("finncrawl/", env!("CARGO_PKG_VERSION"));

/// Resolves a street address to WGS84 coordinates.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Returns `(latitude, longitude)`, or `None` when the address cannot
    /// be resolved for any reason.
    async fn geocode(&self, address: &str) -> Option<(f64, f64)>;
}

/// Geocoder backed by a Nominatim-compatible search API.
pub struct NominatimGeocoder {
    client: Client,
    endpoint: String,
}

impl NominatimGeocoder {
    /// Creates a geocoder against the public Nominatim endpoint.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed, which requires a
    /// broken TLS setup.
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    /// Creates a geocoder against a custom endpoint, used by tests.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to build http client");
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    async fn lookup(&self, address: &str) -> Result<Option<(f64, f64)>, reqwest::Error> {
        let url = format!(
            "{}?q={}&format=json&limit=1",
            self.endpoint,
            urlencoding::encode(address)
        );
        let results: Vec<serde_json::Value> =
            self.client.get(&url).send().await?.json().await?;

        let Some(first) = results.first() else {
            return Ok(None);
        };
        let lat = first
            .get("lat")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| s.parse::<f64>().ok());
        let lon = first
            .get("lon")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| s.parse::<f64>().ok());
        Ok(lat.zip(lon))
    }
}

impl Default for NominatimGeocoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    #[instrument(skip(self))]
    async fn geocode(&self, address: &str) -> Option<(f64, f64)> {
        if address.trim().is_empty() {
            return None;
        }
        match self.lookup(address).await {
            Ok(Some(coords)) => {
                debug!(lat = coords.0, lon = coords.1, "geocoded address");
                Some(coords)
            }
            Ok(None) => {
                debug!("address not found");
                None
            }
            Err(err) => {
                warn!(error = %err, "geocoding request failed");
                None
            }
        }
    }
}

/// Geocoder that resolves nothing, for runs where enrichment is disabled.
pub struct NoopGeocoder;

#[async_trait]
impl Geocoder for NoopGeocoder {
    async fn geocode(&self, _address: &str) -> Option<(f64, f64)> {
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_geocode_parses_first_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "Karl Johans gate 1, Oslo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "lat": "59.9133301", "lon": "10.7389701" },
                { "lat": "0.0", "lon": "0.0" }
            ])))
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::with_endpoint(format!("{}/search", server.uri()));
        let coords = geocoder.geocode("Karl Johans gate 1, Oslo").await.unwrap();
        assert!((coords.0 - 59.9133301).abs() < f64::EPSILON);
        assert!((coords.1 - 10.7389701).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_geocode_empty_results_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::with_endpoint(format!("{}/search", server.uri()));
        assert!(geocoder.geocode("Finnes ikke 99").await.is_none());
    }

    #[tokio::test]
    async fn test_geocode_server_error_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::with_endpoint(format!("{}/search", server.uri()));
        assert!(geocoder.geocode("Karl Johans gate 1").await.is_none());
    }

    #[tokio::test]
    async fn test_geocode_blank_address_skips_request() {
        let geocoder = NominatimGeocoder::with_endpoint("http://127.0.0.1:1/search");
        assert!(geocoder.geocode("   ").await.is_none());
    }

    #[tokio::test]
    async fn test_noop_geocoder() {
        assert!(NoopGeocoder.geocode("Karl Johans gate 1").await.is_none());
    }
}
