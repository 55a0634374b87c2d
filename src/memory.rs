//! In-memory [`TideStore`] for tests and local runs.
//!
//! Parses the line protocol it receives, evaluates range queries with the
//! `regex` crate, and counts mutating calls so tests can assert on them.
//! Failures can be injected per operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::store::{
    Bucket, Organization, Precision, QueryRow, RangeQuery, RowStream, StoreError, TideStore,
};

/// A stored point as reconstructed from line protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub bucket: String,
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub field: String,
    pub value: f64,
    pub timestamp: i64,
}

impl StoredPoint {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn to_row(&self) -> QueryRow {
        let mut row = QueryRow::new();
        row.insert("result".to_string(), json!("_result"));
        row.insert("table".to_string(), json!(0));
        row.insert("_time".to_string(), Value::String(format_time(self.timestamp)));
        row.insert("_value".to_string(), json!(self.value));
        row.insert("_field".to_string(), json!(self.field));
        row.insert("_measurement".to_string(), json!(self.measurement));
        for (key, value) in &self.tags {
            row.insert(key.clone(), json!(value));
        }
        row
    }
}

fn format_time(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| epoch.to_string())
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListOrganizations,
    ListBuckets,
    CreateBucket,
    Write,
    Query,
}

#[derive(Debug, Clone)]
enum Fault {
    Status(StatusCode, String),
    /// Query answers, then fails after this many rows
    QueryAfter(usize, String),
    /// Query never completes
    QueryHang,
}

#[derive(Debug, Default)]
struct State {
    orgs: Vec<Organization>,
    buckets: Vec<Bucket>,
    points: Vec<StoredPoint>,
    faults: HashMap<Operation, Fault>,
    next_id: u64,
}

/// In-process store holding organizations, buckets and points.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    create_calls: AtomicU64,
    write_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a single organization.
    pub fn with_org(name: &str) -> Self {
        let store = Self::new();
        store.add_org(name);
        store
    }

    /// Add an organization and return its id.
    pub fn add_org(&self, name: &str) -> String {
        let mut state = self.lock();
        let id = next_id(&mut state, "org");
        state.orgs.push(Organization {
            id: id.clone(),
            name: name.to_string(),
        });
        id
    }

    /// Make `operation` answer with the given status until cleared.
    pub fn fail(&self, operation: Operation, code: StatusCode, message: &str) {
        self.lock()
            .faults
            .insert(operation, Fault::Status(code, message.to_string()));
    }

    /// Make queries fail mid-stream after `rows` rows.
    pub fn fail_query_after(&self, rows: usize, message: &str) {
        self.lock()
            .faults
            .insert(Operation::Query, Fault::QueryAfter(rows, message.to_string()));
    }

    /// Make queries stall forever.
    pub fn hang_queries(&self) {
        self.lock().faults.insert(Operation::Query, Fault::QueryHang);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn buckets(&self) -> Vec<Bucket> {
        self.lock().buckets.clone()
    }

    pub fn points(&self) -> Vec<StoredPoint> {
        self.lock().points.clone()
    }

    /// Number of `create_bucket` calls that reached the store.
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `write` calls that reached the store.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a panicking test must not poison the store for the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_fault(&self, operation: Operation) -> Result<(), StoreError> {
        match self.lock().faults.get(&operation) {
            Some(Fault::Status(code, message)) => {
                Err(StoreError::from_status(*code, message.clone()))
            }
            _ => Ok(()),
        }
    }
}

fn next_id(state: &mut State, prefix: &str) -> String {
    state.next_id += 1;
    format!("{}-{:04}", prefix, state.next_id)
}

#[async_trait]
impl TideStore for MemoryStore {
    async fn list_organizations(&self, name: &str) -> Result<Vec<Organization>, StoreError> {
        self.check_fault(Operation::ListOrganizations)?;
        Ok(self
            .lock()
            .orgs
            .iter()
            .filter(|o| o.name == name)
            .cloned()
            .collect())
    }

    async fn list_buckets(&self, org_id: &str, name: &str) -> Result<Vec<Bucket>, StoreError> {
        self.check_fault(Operation::ListBuckets)?;
        Ok(self
            .lock()
            .buckets
            .iter()
            .filter(|b| b.name == name && b.org_id.as_deref() == Some(org_id))
            .cloned()
            .collect())
    }

    async fn create_bucket(
        &self,
        org_id: &str,
        name: &str,
    ) -> Result<serde_json::Value, StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check_fault(Operation::CreateBucket)?;

        let mut state = self.lock();
        if !state.orgs.iter().any(|o| o.id == org_id) {
            return Err(StoreError::from_status(
                StatusCode::NOT_FOUND,
                format!("organization {} not found", org_id),
            ));
        }
        if state
            .buckets
            .iter()
            .any(|b| b.name == name && b.org_id.as_deref() == Some(org_id))
        {
            return Err(StoreError::from_status(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("bucket with name {} already exists", name),
            ));
        }

        let bucket = Bucket {
            id: next_id(&mut state, "bucket"),
            name: name.to_string(),
            org_id: Some(org_id.to_string()),
        };
        state.buckets.push(bucket.clone());

        Ok(json!({
            "id": bucket.id,
            "name": bucket.name,
            "orgID": org_id,
            "retentionRules": [],
            "links": { "self": format!("/api/v2/buckets/{}", bucket.id) },
        }))
    }

    async fn write(
        &self,
        org_id: &str,
        bucket: &str,
        _precision: Precision,
        body: String,
    ) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_fault(Operation::Write)?;

        let mut state = self.lock();
        if !state
            .buckets
            .iter()
            .any(|b| b.name == bucket && b.org_id.as_deref() == Some(org_id))
        {
            return Err(StoreError::from_status(
                StatusCode::NOT_FOUND,
                format!("bucket \"{}\" not found", bucket),
            ));
        }

        let mut parsed = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let point = parse_line(bucket, line).ok_or_else(|| {
                StoreError::from_status(
                    StatusCode::BAD_REQUEST,
                    format!("unable to parse '{}'", line),
                )
            })?;
            parsed.push(point);
        }
        state.points.extend(parsed);
        Ok(())
    }

    async fn query_rows(&self, _org_id: &str, query: &RangeQuery) -> Result<RowStream, StoreError> {
        self.check_fault(Operation::Query)?;

        let pattern = Regex::new(&query.location_pattern).map_err(|e| {
            StoreError::from_status(StatusCode::BAD_REQUEST, format!("invalid regex: {}", e))
        })?;

        let state = self.lock();
        let rows: Vec<Result<QueryRow, StoreError>> = state
            .points
            .iter()
            .filter(|p| p.bucket == query.bucket && p.timestamp >= query.start)
            .filter(|p| p.tag("location").is_some_and(|l| pattern.is_match(l)))
            .map(|p| Ok(p.to_row()))
            .collect();

        match state.faults.get(&Operation::Query).cloned() {
            Some(Fault::QueryHang) => Ok(stream::pending().boxed()),
            Some(Fault::QueryAfter(n, message)) => {
                let mut rows: Vec<_> = rows.into_iter().take(n).collect();
                rows.push(Err(StoreError::Query(message)));
                Ok(stream::iter(rows).boxed())
            }
            _ => Ok(stream::iter(rows).boxed()),
        }
    }
}

/// Parse `measurement,tag=v,... field=value timestamp`.
fn parse_line(bucket: &str, line: &str) -> Option<StoredPoint> {
    let parts = split_unescaped(line, ' ');
    if parts.len() != 3 {
        return None;
    }

    let mut series = split_unescaped(&parts[0], ',').into_iter();
    let measurement = unescape(&series.next()?);
    let mut tags = Vec::new();
    for pair in series {
        let kv = split_unescaped(&pair, '=');
        if kv.len() != 2 {
            return None;
        }
        tags.push((unescape(&kv[0]), unescape(&kv[1])));
    }

    let field = split_unescaped(&parts[1], '=');
    if field.len() != 2 {
        return None;
    }

    Some(StoredPoint {
        bucket: bucket.to_string(),
        measurement,
        tags,
        field: unescape(&field[0]),
        value: field[1].parse().ok()?,
        timestamp: parts[2].parse().ok()?,
    })
}

/// Split on `sep` where it is not preceded by a backslash; escapes are kept.
fn split_unescaped(value: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pattern: &str) -> RangeQuery {
        RangeQuery {
            bucket: "ocean_tides".to_string(),
            start: 0,
            location_pattern: pattern.to_string(),
        }
    }

    async fn seeded() -> (MemoryStore, String) {
        let store = MemoryStore::new();
        let org_id = store.add_org("my-org");
        store.create_bucket(&org_id, "ocean_tides").await.unwrap();
        store
            .write(
                &org_id,
                "ocean_tides",
                Precision::Seconds,
                "tide,location=Hanalei,unit=feet height=1.5 1577836800\n\
                 tide,location=Hilo,unit=feet height=0.5 1577836800"
                    .to_string(),
            )
            .await
            .unwrap();
        (store, org_id)
    }

    #[test]
    fn test_parse_line_with_escapes() {
        let point = parse_line("b", r"tide,location=Nawiliwili\,\ Kauai,unit=a\=b height=1 0").unwrap();
        assert_eq!(point.tag("location"), Some("Nawiliwili, Kauai"));
        assert_eq!(point.tag("unit"), Some("a=b"));
        assert_eq!(point.value, 1.0);
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(parse_line("b", "tide height").is_none());
        assert!(parse_line("b", "tide height=x 0").is_none());
    }

    #[tokio::test]
    async fn test_query_filters_by_pattern() {
        let (store, org_id) = seeded().await;
        let rows: Vec<_> = store
            .query_rows(&org_id, &query("(?i)(han)"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(rows.len(), 1);
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row["location"], json!("Hanalei"));
        assert_eq!(row["_time"], json!("2020-01-01T00:00:00Z"));
        assert_eq!(row["_value"], json!(1.5));
    }

    #[tokio::test]
    async fn test_write_to_missing_bucket() {
        let store = MemoryStore::with_org("my-org");
        let err = store
            .write("org-0001", "nope", Precision::Seconds, "tide height=1 0".to_string())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_bucket_rejected() {
        let (store, org_id) = seeded().await;
        let err = store.create_bucket(&org_id, "ocean_tides").await.unwrap_err();
        assert!(matches!(err, StoreError::Status { code, .. } if code == StatusCode::UNPROCESSABLE_ENTITY));
        assert_eq!(store.buckets().len(), 1);
        assert_eq!(store.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_fault() {
        let store = MemoryStore::with_org("my-org");
        store.fail(Operation::ListOrganizations, StatusCode::BAD_GATEWAY, "down");
        assert!(store.list_organizations("my-org").await.is_err());
        store.clear_faults();
        assert_eq!(store.list_organizations("my-org").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_query_fails_mid_stream() {
        let (store, org_id) = seeded().await;
        store.fail_query_after(1, "stream reset");
        let rows: Vec<_> = store
            .query_rows(&org_id, &query("(?i)()"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_ok());
        assert!(matches!(rows[1], Err(StoreError::Query(_))));
    }
}
