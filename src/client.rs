//! InfluxDB v2 HTTP client.
//!
//! This module provides the [`TideStore`] implementation used in production:
//! an async HTTP client with connection pooling, token authentication, retry
//! logic with exponential backoff for writes, and streaming decoding of query
//! results.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::annotated_csv::AnnotatedCsvDecoder;
use crate::config::Config;
use crate::store::{
    Bucket, Organization, Precision, RangeQuery, RowStream, StoreError, TideStore,
};

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
struct OrgsResponse {
    #[serde(default)]
    orgs: Vec<Organization>,
}

#[derive(Debug, Deserialize)]
struct BucketsResponse {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

/// Error body returned by the InfluxDB API.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for an InfluxDB v2 instance.
///
/// The client uses connection pooling (via reqwest's internal pool) and
/// authenticates every request with `Authorization: Token <token>`.
///
/// # Example
///
/// ```no_run
/// use tide_ingest::client::InfluxClient;
/// use tide_ingest::config::Config;
/// use tide_ingest::store::TideStore;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let client = InfluxClient::new(&config).expect("Failed to create client");
///
///     match client.list_organizations(&config.org).await {
///         Ok(orgs) => println!("Found {} organizations", orgs.len()),
///         Err(e) => eprintln!("Lookup failed: {}", e),
///     }
/// }
/// ```
pub struct InfluxClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Base URL without trailing slash
    base_url: String,

    /// Value of the Authorization header
    auth_header: String,

    /// Maximum number of write retry attempts
    max_retries: u32,

    /// Request timeout duration
    timeout: Duration,
}

impl InfluxClient {
    /// Create a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, StoreError> {
        Self::with_settings(
            &config.influx_url,
            &config.token,
            config.request_timeout,
            config.max_retries,
        )
    }

    /// Create a new client with custom settings.
    pub fn with_settings(
        base_url: impl Into<String>,
        token: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        let base_url: String = base_url.into();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header: format!("Token {}", token),
            max_retries,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(AUTHORIZATION, &self.auth_header)
    }

    /// Turn a non-success response into a `StoreError`.
    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| {
                if text.is_empty() {
                    status.canonical_reason().unwrap_or("Unknown error").to_string()
                } else {
                    text
                }
            });

        Err(StoreError::from_status(status, message))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, StoreError> {
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| StoreError::Parse(e.to_string()))
    }

    /// Send one write request without retry logic.
    async fn send_write(
        &self,
        org_id: &str,
        bucket: &str,
        precision: Precision,
        body: String,
    ) -> Result<(), StoreError> {
        let response = self
            .request(self.client.post(self.url("/api/v2/write")))
            .query(&[
                ("orgID", org_id),
                ("bucket", bucket),
                ("precision", precision.as_str()),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }

    /// Calculate the backoff delay for a given retry attempt.
    ///
    /// Uses exponential backoff with jitter:
    /// delay = min(base_delay * 2^attempt + jitter, max_delay)
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay = DEFAULT_BASE_DELAY_MS;

        let exponential_delay = base_delay.saturating_mul(1 << attempt.min(10));

        // Add jitter (up to 25% of the delay)
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

        let total_delay = exponential_delay.saturating_add(jitter).min(MAX_RETRY_DELAY_MS);

        Duration::from_millis(total_delay)
    }

    /// Get the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl TideStore for InfluxClient {
    async fn list_organizations(&self, name: &str) -> Result<Vec<Organization>, StoreError> {
        debug!(org = %name, "Listing organizations");
        let response = self
            .request(self.client.get(self.url("/api/v2/orgs")))
            .query(&[("org", name)])
            .timeout(self.timeout)
            .send()
            .await?;

        let response = Self::check(response).await?;
        let body: OrgsResponse = Self::read_json(response).await?;
        Ok(body.orgs)
    }

    async fn list_buckets(&self, org_id: &str, name: &str) -> Result<Vec<Bucket>, StoreError> {
        debug!(org_id = %org_id, bucket = %name, "Listing buckets");
        let response = self
            .request(self.client.get(self.url("/api/v2/buckets")))
            .query(&[("orgID", org_id), ("name", name)])
            .timeout(self.timeout)
            .send()
            .await?;

        let response = Self::check(response).await?;
        let body: BucketsResponse = Self::read_json(response).await?;
        Ok(body.buckets)
    }

    async fn create_bucket(
        &self,
        org_id: &str,
        name: &str,
    ) -> Result<serde_json::Value, StoreError> {
        debug!(org_id = %org_id, bucket = %name, "Creating bucket");
        let response = self
            .request(self.client.post(self.url("/api/v2/buckets")))
            .timeout(self.timeout)
            .json(&json!({ "orgID": org_id, "name": name, "retentionRules": [] }))
            .send()
            .await?;

        let response = Self::check(response).await?;
        Self::read_json(response).await
    }

    /// Write a line protocol body, retrying transient failures.
    ///
    /// Connection errors, timeouts, 5xx and 429 are retried up to
    /// `max_retries` times; anything else fails immediately.
    async fn write(
        &self,
        org_id: &str,
        bucket: &str,
        precision: Precision,
        body: String,
    ) -> Result<(), StoreError> {
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = self.calculate_backoff_delay(attempt);
                warn!(
                    attempt = attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis(),
                    "Retrying write after failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_write(org_id, bucket, precision, body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let is_retryable = e.is_retryable();

                    if is_retryable && attempt < self.max_retries {
                        warn!(
                            error = %e,
                            attempt = attempt + 1,
                            max_retries = self.max_retries,
                            "Write failed, will retry"
                        );
                        attempt += 1;
                    } else {
                        error!(
                            error = %e,
                            attempts = attempt + 1,
                            retryable = is_retryable,
                            "Write failed permanently"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn query_rows(&self, org_id: &str, query: &RangeQuery) -> Result<RowStream, StoreError> {
        let flux = query.to_flux();
        debug!(org_id = %org_id, query = %flux, "Running Flux query");

        // no per-request timeout: the caller bounds the whole stream
        let response = self
            .request(self.client.post(self.url("/api/v2/query")))
            .query(&[("orgID", org_id)])
            .header(ACCEPT, "application/csv")
            .json(&json!({
                "query": flux,
                "type": "flux",
                "dialect": {
                    "header": true,
                    "delimiter": ",",
                    "annotations": ["datatype", "group", "default"],
                },
            }))
            .send()
            .await?;

        let response = Self::check(response).await?;
        Ok(decode_rows(response.bytes_stream()))
    }
}

/// Decode an annotated CSV byte stream into rows.
///
/// The returned stream ends after the first error.
fn decode_rows<S, B, E>(bytes: S) -> RowStream
where
    S: futures_util::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<StoreError> + Send,
{
    struct State<S> {
        bytes: Pin<Box<S>>,
        decoder: AnnotatedCsvDecoder,
        ready: VecDeque<Result<crate::store::QueryRow, StoreError>>,
        done: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        decoder: AnnotatedCsvDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                if item.is_err() {
                    state.ready.clear();
                    state.done = true;
                }
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.decoder.push(chunk.as_ref())),
                Some(Err(e)) => {
                    state.ready.push_back(Err(e.into()));
                    state.done = true;
                }
                None => {
                    state.ready.extend(state.decoder.finish());
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}
