//! Location query service.
//!
//! Translates a user-supplied place into a range query over the whole
//! history of the bucket, filtered by a case-insensitive match on the
//! `location` tag, and collects the streamed rows in arrival order.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::{QueryRow, RangeQuery, StoreError, TideStore};

/// Longest accepted place filter, in characters.
pub const MAX_PLACE_LEN: usize = 64;

/// Errors returned by [`QueryService::query_place`].
#[derive(Debug, Error)]
pub enum QueryError {
    /// The place filter was rejected before reaching the store
    #[error("Invalid place: {0}")]
    InvalidPlace(String),

    /// The store failed before or during streaming
    #[error("Query failed: {0}")]
    Store(#[from] StoreError),

    /// The stream did not complete in time
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
}

/// Validate a place filter.
///
/// The place is returned unchanged: surrounding whitespace is part of the
/// match, so `" Kauai"` matches `"Hanalei, Kauai, HI"` but not `"Kauai"`.
/// A place made only of whitespace is rejected.
pub fn validate_place(place: &str) -> Result<&str, QueryError> {
    if place.trim().is_empty() {
        return Err(QueryError::InvalidPlace("place must not be blank".to_string()));
    }
    if place.chars().count() > MAX_PLACE_LEN {
        return Err(QueryError::InvalidPlace(format!(
            "place exceeds {} characters",
            MAX_PLACE_LEN
        )));
    }
    if place.chars().any(char::is_control) {
        return Err(QueryError::InvalidPlace(
            "place must not contain control characters".to_string(),
        ));
    }

    Ok(place)
}

/// Case-insensitive substring pattern for a validated place.
///
/// Regex metacharacters in the place are escaped, so the place is always
/// matched literally.
pub fn location_pattern(place: &str) -> String {
    format!("(?i)({})", regex::escape(place))
}

/// Runs location queries against one bucket.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn TideStore>,
    org_id: String,
    bucket: String,
    timeout: Duration,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn TideStore>,
        org_id: impl Into<String>,
        bucket: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            org_id: org_id.into(),
            bucket: bucket.into(),
            timeout,
        }
    }

    /// Build the range query for a place, covering all time up to now.
    pub fn range_query(&self, place: &str) -> Result<RangeQuery, QueryError> {
        let place = validate_place(place)?;
        Ok(RangeQuery {
            bucket: self.bucket.clone(),
            start: 0,
            location_pattern: location_pattern(place),
        })
    }

    /// Query every row whose location matches `place`.
    ///
    /// Resolves exactly once: with all rows in delivery order (possibly
    /// none), or with the first error. The whole call, including the time
    /// spent streaming, is bounded by the configured timeout.
    pub async fn query_place(&self, place: &str) -> Result<Vec<QueryRow>, QueryError> {
        let query = self.range_query(place)?;
        info!(place = %place, bucket = %self.bucket, "Querying tide rows");

        match tokio::time::timeout(self.timeout, self.collect(&query)).await {
            Ok(Ok(rows)) => {
                info!(place = %place, rows = rows.len(), "Query completed");
                Ok(rows)
            }
            Ok(Err(e)) => {
                error!(place = %place, error = %e, "Query failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(place = %place, timeout = ?self.timeout, "Query timed out");
                Err(QueryError::Timeout(self.timeout))
            }
        }
    }

    async fn collect(&self, query: &RangeQuery) -> Result<Vec<QueryRow>, StoreError> {
        let mut stream = self.store.query_rows(&self.org_id, query).await?;
        let mut rows = Vec::new();

        while let Some(row) = stream.next().await {
            rows.push(row?);
        }

        debug!(rows = rows.len(), "Row stream completed");
        Ok(rows)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
