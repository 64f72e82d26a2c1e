//! Page fetching: politeness gate, HTTP client, and retry policy.
//!
//! The discovery crawler and the detail ingestor both go through
//! [`Fetcher::fetch_page`], which applies one randomized politeness delay
//! per outbound request and retries transient failures with jittered
//! exponential backoff.

mod client;
mod error;
mod gate;
mod retry;

pub use client::{Fetcher, PageClient};
pub use error::FetchError;
pub use gate::PolitenessGate;
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
