//! HTTP client wrapper for fetching pages as text.
//!
//! [`PageClient`] performs a single GET and maps transport failures onto
//! [`FetchError`]. [`Fetcher`] combines the client with the politeness gate
//! and retry policy to provide the fetch primitive used by the discovery
//! crawler and the detail ingestor.

use std::time::Duration;

use reqwest::{Client, ClientBuilder};
use tracing::{debug, instrument, warn};

use super::error::FetchError;
use super::gate::PolitenessGate;
use super::retry::{RetryDecision, RetryPolicy, classify_error};

/// Request timeout for page fetches.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// User-Agent sent with every request; identifies the tool honestly.
const USER_AGENT: &str = concat!("finncrawl/", env!("CARGO_PKG_VERSION"));

/// HTTP client for fetching HTML pages.
///
/// Designed to be created once and reused; reqwest pools connections
/// internally.
#[derive(Debug, Clone)]
pub struct PageClient {
    client: Client,
}

impl Default for PageClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PageClient {
    /// Creates a new page client with the default timeout.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    /// Creates a new page client with an explicit request timeout.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Performs a single GET and returns the response body as text.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Timeout`] when the request times out,
    /// [`FetchError::HttpStatus`] for non-2xx responses, and
    /// [`FetchError::Network`] for transport failures.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::http_status(url, status.as_u16()));
        }

        response.text().await.map_err(|e| map_reqwest_error(url, e))
    }
}

/// Maps a reqwest error onto the fetch taxonomy, preserving timeout identity.
fn map_reqwest_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else if error.is_builder() {
        FetchError::invalid_url(url)
    } else {
        FetchError::network(url, error)
    }
}

/// Page fetcher: politeness gate + client + retry-on-transient-failure.
///
/// Each physical request (including retries) passes through the gate, so
/// the source site never sees bursts even while backing off.
#[derive(Debug)]
pub struct Fetcher {
    client: PageClient,
    gate: PolitenessGate,
    policy: RetryPolicy,
}

impl Fetcher {
    /// Creates a fetcher from its parts.
    #[must_use]
    pub fn new(client: PageClient, gate: PolitenessGate, policy: RetryPolicy) -> Self {
        Self {
            client,
            gate,
            policy,
        }
    }

    /// Fetches a page, retrying transient failures per the policy.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once the policy declines to retry.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 1u32;
        loop {
            self.gate.acquire().await;

            match self.client.get_text(url).await {
                Ok(body) => {
                    debug!(attempt, bytes = body.len(), "page fetched");
                    return Ok(body);
                }
                Err(error) => {
                    let failure = classify_error(&error);
                    match self.policy.should_retry(failure, attempt) {
                        RetryDecision::Retry {
                            delay,
                            attempt: next,
                        } => {
                            warn!(
                                attempt,
                                delay_ms = delay.as_millis(),
                                error = %error,
                                "fetch failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt = next;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            warn!(attempt, reason = %reason, error = %error, "fetch abandoned");
                            return Err(error);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_page_client_default_builds() {
        let _client = PageClient::default();
    }

    #[test]
    fn test_user_agent_names_the_tool() {
        assert!(USER_AGENT.starts_with("finncrawl/"));
    }

    #[test]
    fn test_get_text_unreachable_host_is_network_error() {
        // Reserved TEST-NET-1 address; connection should fail fast
        let client = PageClient::with_timeout(Duration::from_millis(200));
        let result = tokio_test::block_on(client.get_text("http://192.0.2.1/none"));
        assert!(matches!(
            result,
            Err(FetchError::Network { .. } | FetchError::Timeout { .. })
        ));
    }
}
