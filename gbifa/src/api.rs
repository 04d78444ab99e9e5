//! GBIF v1 API client
//!
//! One client instance serves the three endpoints the pipeline touches:
//! dataset activity pages (occurrence downloads), literature search, and
//! species name lookup. Every request goes through the same bounded-retry
//! helper and the client-owned rate limiter, so callers never see transport
//! details beyond a typed [`QueryError`].

use async_trait::async_trait;
use gbifa_common::Config;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Typed failure reason for one logical query after the retry budget
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Request timed out
    #[error("request timed out")]
    Timeout,

    /// Connection could not be established or was dropped
    #[error("connection failed: {0}")]
    Connect(String),

    /// Server answered with a non-success status
    #[error("HTTP status {0}")]
    Status(u16),

    /// Response body could not be decoded
    #[error("response decode failed: {0}")]
    Decode(String),
}

/// One page of a paged GBIF result set
///
/// `count` is the source-reported total across all pages, not the page size.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PagedResponse {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub results: Vec<Value>,
}

/// One logical fetch of one activity page, abstracted so the pagination
/// controller can be driven without a network
#[async_trait]
pub trait ActivitySource {
    /// Fetch one page of activity records; `limit = 0` is the count probe
    async fn activity_page(&self, limit: u32, offset: u64)
        -> Result<PagedResponse, QueryError>;
}

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// GBIF API client with bounded retry and fixed-rate request pacing
pub struct GbifClient {
    /// HTTP client with configured timeout
    client: Client,
    /// Base URL for the GBIF v1 API
    base_url: String,
    /// Request pacing; None when the configured delay is zero
    limiter: Option<DirectRateLimiter>,
    /// Attempts per request before giving up
    attempts: u32,
    /// Delay between retry attempts
    retry_delay: Duration,
}

impl GbifClient {
    /// Create a client from pipeline configuration
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be built (should not happen with
    /// valid config)
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to build HTTP client");

        // Quota::with_period rejects a zero period, which doubles as the
        // "no pacing" switch for tests
        let limiter = Quota::with_period(Duration::from_millis(config.page_delay_ms))
            .map(RateLimiter::direct);

        Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            limiter,
            attempts: config.attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Fetch one page of occurrence-download activity for a dataset
    ///
    /// `limit = 0` returns no records but still reports the total count,
    /// which is how the pagination controller probes the page count.
    pub async fn dataset_activity(
        &self,
        dataset: &Uuid,
        limit: u32,
        offset: u64,
    ) -> Result<PagedResponse, QueryError> {
        let url = format!(
            "{}/occurrence/download/dataset/{}?showDownloadDetails=true&limit={}&offset={}",
            self.base_url, dataset, limit, offset
        );
        let value = self.get_json(&url).await?;
        serde_json::from_value(value).map_err(|e| QueryError::Decode(e.to_string()))
    }

    /// Search literature citing the dataset
    pub async fn citation_search(&self, dataset: &Uuid) -> Result<PagedResponse, QueryError> {
        let url = format!(
            "{}/literature/search?gbifDatasetKey={}",
            self.base_url, dataset
        );
        let value = self.get_json(&url).await?;
        serde_json::from_value(value).map_err(|e| QueryError::Decode(e.to_string()))
    }

    /// Look up the parsed name of a taxon key
    pub async fn species_name(&self, taxon_key: &str) -> Result<Value, QueryError> {
        let url = format!("{}/species/{}/name", self.base_url, taxon_key);
        self.get_json(&url).await
    }

    /// GET a JSON document with bounded retry
    ///
    /// Timeouts, connection failures and error statuses are retried up to
    /// the attempt budget with a fixed inter-attempt delay; decode failures
    /// are not (the payload will not improve on a second read).
    async fn get_json(&self, url: &str) -> Result<Value, QueryError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let mut last_error = QueryError::Connect("no attempt made".to_string());
        for attempt in 1..=self.attempts {
            match self.try_get_json(url).await {
                Ok(value) => return Ok(value),
                Err(error @ QueryError::Decode(_)) => return Err(error),
                Err(error) => {
                    tracing::debug!(
                        url,
                        attempt,
                        attempts = self.attempts,
                        %error,
                        "query attempt failed"
                    );
                    last_error = error;
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn try_get_json(&self, url: &str) -> Result<Value, QueryError> {
        let response = self.client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status(status.as_u16()));
        }

        response
            .json()
            .await
            .map_err(|e| QueryError::Decode(e.to_string()))
    }
}

fn classify(error: reqwest::Error) -> QueryError {
    if error.is_timeout() {
        QueryError::Timeout
    } else {
        QueryError::Connect(error.to_string())
    }
}

/// A [`GbifClient`] bound to one dataset, viewed as an activity source
pub struct DatasetActivity<'a> {
    pub client: &'a GbifClient,
    pub dataset: Uuid,
}

#[async_trait]
impl ActivitySource for DatasetActivity<'_> {
    async fn activity_page(
        &self,
        limit: u32,
        offset: u64,
    ) -> Result<PagedResponse, QueryError> {
        self.client.dataset_activity(&self.dataset, limit, offset).await
    }
}
