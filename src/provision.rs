//! Idempotent bucket provisioning.
//!
//! Runs once at startup, before any point is written and before the query
//! API starts listening.

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::store::{Bucket, Organization, StoreError, TideStore};

/// Errors that abort provisioning, and with it the startup sequence.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No organization with the configured name exists
    #[error("No organization named \"{0}\" found")]
    OrgNotFound(String),

    /// The store failed for a reason other than "not found"
    #[error("Store unavailable during provisioning: {0}")]
    Store(#[from] StoreError),
}

/// What provisioning found or did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    /// The bucket was already there; nothing was changed
    AlreadyExists(Bucket),

    /// The bucket was created; carries the store's descriptor
    Created(Value),
}

/// Result of a successful provisioning run.
#[derive(Debug, Clone, PartialEq)]
pub struct Provisioned {
    /// Organization the bucket belongs to
    pub org: Organization,

    pub outcome: ProvisionOutcome,
}

impl Provisioned {
    pub fn org_id(&self) -> &str {
        &self.org.id
    }

    pub fn created(&self) -> bool {
        matches!(self.outcome, ProvisionOutcome::Created(_))
    }
}

/// Resolve an organization by name.
///
/// # Errors
///
/// Returns `ProvisionError::OrgNotFound` if the lookup comes back empty.
pub async fn resolve_org(store: &dyn TideStore, org: &str) -> Result<Organization, ProvisionError> {
    info!(org = %org, "Resolving organization");
    let orgs = store.list_organizations(org).await?;
    let found = orgs
        .into_iter()
        .next()
        .ok_or_else(|| ProvisionError::OrgNotFound(org.to_string()))?;
    info!(org = %org, org_id = %found.id, "Using organization");
    Ok(found)
}

/// Make sure bucket `name` exists in organization `org`.
///
/// An existing bucket is left untouched, so calling this repeatedly is safe
/// and issues at most one create call per invocation. A 404 from the bucket
/// listing means "does not exist yet" and leads to creation.
pub async fn ensure_bucket(
    store: &dyn TideStore,
    org: &str,
    name: &str,
) -> Result<Provisioned, ProvisionError> {
    let org = resolve_org(store, org).await?;

    let existing = match store.list_buckets(&org.id, name).await {
        Ok(buckets) => buckets,
        Err(e) if e.is_not_found() => {
            info!(bucket = %name, "Bucket listing returned not found");
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(bucket) = existing.into_iter().next() {
        info!(bucket = %name, bucket_id = %bucket.id, "Bucket already exists");
        return Ok(Provisioned {
            org,
            outcome: ProvisionOutcome::AlreadyExists(bucket),
        });
    }

    info!(bucket = %name, org_id = %org.id, "Creating bucket");
    let descriptor = store.create_bucket(&org.id, name).await?;
    info!(bucket = %name, descriptor = %describe(&descriptor), "Bucket created");

    Ok(Provisioned {
        org,
        outcome: ProvisionOutcome::Created(descriptor),
    })
}

/// Pretty-print a bucket descriptor without its `links` member.
fn describe(descriptor: &Value) -> String {
    let mut descriptor = descriptor.clone();
    if let Some(obj) = descriptor.as_object_mut() {
        obj.remove("links");
    }
    serde_json::to_string_pretty(&descriptor).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to render bucket descriptor");
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, Operation};
    use reqwest::StatusCode;

    #[tokio::test]
    async fn test_creates_missing_bucket() {
        let store = MemoryStore::with_org("my-org");

        let provisioned = ensure_bucket(&store, "my-org", "ocean_tides").await.unwrap();

        assert!(provisioned.created());
        assert_eq!(store.create_calls(), 1);
        assert_eq!(store.buckets().len(), 1);
        assert_eq!(store.buckets()[0].name, "ocean_tides");
    }

    #[tokio::test]
    async fn test_second_call_is_noop() {
        let store = MemoryStore::with_org("my-org");

        let first = ensure_bucket(&store, "my-org", "ocean_tides").await.unwrap();
        let second = ensure_bucket(&store, "my-org", "ocean_tides").await.unwrap();

        assert!(first.created());
        assert!(matches!(second.outcome, ProvisionOutcome::AlreadyExists(ref b) if b.name == "ocean_tides"));
        assert_eq!(store.create_calls(), 1);
        assert_eq!(store.buckets().len(), 1);
        assert_eq!(first.org_id(), second.org_id());
    }

    #[tokio::test]
    async fn test_missing_org_is_fatal() {
        let store = MemoryStore::with_org("other-org");

        let err = ensure_bucket(&store, "my-org", "ocean_tides").await.unwrap_err();

        assert!(matches!(err, ProvisionError::OrgNotFound(ref name) if name == "my-org"));
        assert_eq!(store.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_not_found_listing_leads_to_create() {
        let store = MemoryStore::with_org("my-org");
        store.fail(Operation::ListBuckets, StatusCode::NOT_FOUND, "bucket not found");

        let provisioned = ensure_bucket(&store, "my-org", "ocean_tides").await.unwrap();

        assert!(provisioned.created());
        assert_eq!(store.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts() {
        let store = MemoryStore::with_org("my-org");
        store.fail(Operation::ListBuckets, StatusCode::UNAUTHORIZED, "unauthorized access");

        let err = ensure_bucket(&store, "my-org", "ocean_tides").await.unwrap_err();

        assert!(matches!(err, ProvisionError::Store(StoreError::Status { .. })));
        assert_eq!(store.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_aborts() {
        let store = MemoryStore::with_org("my-org");
        store.fail(Operation::CreateBucket, StatusCode::INTERNAL_SERVER_ERROR, "boom");

        let err = ensure_bucket(&store, "my-org", "ocean_tides").await.unwrap_err();

        assert!(matches!(err, ProvisionError::Store(_)));
        assert!(store.buckets().is_empty());
    }

    #[tokio::test]
    async fn test_org_lookup_failure_aborts() {
        let store = MemoryStore::with_org("my-org");
        store.fail(Operation::ListOrganizations, StatusCode::SERVICE_UNAVAILABLE, "down");

        let err = ensure_bucket(&store, "my-org", "ocean_tides").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Store(_)));
    }

    #[test]
    fn test_describe_strips_links() {
        let descriptor = serde_json::json!({"id": "b1", "name": "ocean_tides", "links": {"self": "/x"}});
        let rendered = describe(&descriptor);
        assert!(rendered.contains("ocean_tides"));
        assert!(!rendered.contains("links"));
    }
}
