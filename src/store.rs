//! Remote time-series store abstraction.
//!
//! [`TideStore`] is the seam between the service and InfluxDB. The HTTP
//! implementation lives in [`crate::client`]; [`crate::memory`] provides an
//! in-process implementation for tests.

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One result row: column name to value, as returned by the store.
pub type QueryRow = serde_json::Map<String, serde_json::Value>;

/// Pull-based stream of result rows.
///
/// Rows arrive in delivery order. The stream ends after the last row, or
/// yields a single `Err` and then ends.
pub type RowStream = BoxStream<'static, Result<QueryRow, StoreError>>;

/// Organization descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

/// Bucket (collection) descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "orgID", skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

/// Timestamp precision of a write body.
///
/// Observations carry whole seconds, so that is the only unit written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Seconds,
}

impl Precision {
    /// Query parameter value understood by the write endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Seconds => "s",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Range query over one bucket, filtered by a regex on the `location` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub bucket: String,

    /// Range start in seconds since the epoch; the range always ends now
    pub start: i64,

    /// Regular expression matched against the `location` tag
    pub location_pattern: String,
}

impl RangeQuery {
    /// Render as a Flux script.
    ///
    /// The bucket is emitted as a Flux string literal and the pattern as a
    /// Flux regex literal, both escaped so neither can terminate early.
    pub fn to_flux(&self) -> String {
        format!(
            "from(bucket:\"{}\") |> range(start:{}) |> filter(fn: (r) => r.location =~ /{}/)",
            escape_flux_string(&self.bucket),
            self.start,
            escape_flux_regex(&self.location_pattern),
        )
    }
}

fn escape_flux_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' | '"' => {
                out.push('\\');
                out.push(c);
            }
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_flux_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            // keep existing escapes intact, including an escaped slash
            '\\' => {
                out.push('\\');
                match chars.next() {
                    Some(next) => out.push(next),
                    None => out.push('\\'),
                }
            }
            '/' => out.push_str("\\/"),
            _ => out.push(c),
        }
    }
    out
}

/// Errors returned by a [`TideStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// The store answered 404
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store answered with another error status
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Response body could not be decoded
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// The query failed while its result was streaming
    #[error("Query failed: {0}")]
    Query(String),

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Build the error for a non-success response.
    pub fn from_status(code: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        if code == StatusCode::NOT_FOUND {
            StoreError::NotFound(message)
        } else {
            StoreError::Status { code, message }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Whether repeating the same request may succeed.
    ///
    /// Connection failures, timeouts, 5xx and 429 are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            StoreError::Timeout => true,
            StoreError::Status { code, .. } => {
                code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            StoreError::NotFound(_)
            | StoreError::Parse(_)
            | StoreError::Query(_)
            | StoreError::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Request(err)
        }
    }
}

/// Client API of the remote time-series store.
#[async_trait]
pub trait TideStore: Send + Sync {
    /// Organizations whose name equals `name`.
    async fn list_organizations(&self, name: &str) -> Result<Vec<Organization>, StoreError>;

    /// Buckets named `name` within the organization.
    ///
    /// A store may answer [`StoreError::NotFound`] instead of an empty list.
    async fn list_buckets(&self, org_id: &str, name: &str) -> Result<Vec<Bucket>, StoreError>;

    /// Create a bucket and return its descriptor as reported by the store.
    async fn create_bucket(&self, org_id: &str, name: &str)
        -> Result<serde_json::Value, StoreError>;

    /// Write a line protocol body.
    async fn write(
        &self,
        org_id: &str,
        bucket: &str,
        precision: Precision,
        body: String,
    ) -> Result<(), StoreError>;

    /// Run a range query and stream its rows.
    async fn query_rows(&self, org_id: &str, query: &RangeQuery) -> Result<RowStream, StoreError>;
}
