//! Service startup and lifetime.
//!
//! Startup runs in a fixed order: provision the bucket, load every dataset,
//! bind the listener, then submit the points. A failure in any step before
//! the bind returns an error with no port open and no point written.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::dataset::{load_monitored, DatasetError};
use crate::pipeline::load_all;
use crate::provision::{ensure_bucket, ProvisionError};
use crate::query::QueryService;
use crate::server::{self, AppState};
use crate::store::TideStore;
use crate::writer::{PointWriter, WriteStats, WriteTarget, WriterConfig};

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Failed to load tide datasets: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// A started service: bucket provisioned, points submitted, listener bound.
pub struct Service {
    listener: TcpListener,
    app: Router,
    writer: PointWriter,
    local_addr: SocketAddr,
}

/// Provision, load and bind, in that order.
///
/// The returned [`Service`] is already listening but answers nothing until
/// [`Service::serve`] is awaited.
///
/// # Errors
///
/// Returns the first failing step. The listener is only bound once the
/// bucket exists and every dataset has loaded.
pub async fn start(config: &Config, store: Arc<dyn TideStore>) -> Result<Service, StartupError> {
    let provisioned = ensure_bucket(store.as_ref(), &config.org, &config.bucket).await?;
    info!(
        bucket = %config.bucket,
        created = provisioned.created(),
        "Provisioning finished"
    );

    let datasets = load_monitored(&config.data_dir).await?;

    let bind_error = |source: io::Error| StartupError::Bind {
        port: config.http_port,
        source,
    };
    let listener = server::bind(config.http_port).await.map_err(bind_error)?;
    let local_addr = listener.local_addr().map_err(bind_error)?;

    let org_id = provisioned.org_id().to_string();
    let writer = PointWriter::spawn(
        store.clone(),
        WriteTarget {
            org_id: org_id.clone(),
            bucket: config.bucket.clone(),
        },
        WriterConfig::from_config(config),
    );

    if let Err(e) = load_all(&datasets, &writer.handle()) {
        error!(error = %e, "Bulk load interrupted");
    }

    let query = QueryService::new(store, org_id, config.bucket.clone(), config.query_timeout);

    Ok(Service {
        listener,
        app: server::router(AppState { query }),
        writer,
        local_addr,
    })
}

impl Service {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn write_stats(&self) -> WriteStats {
        self.writer.stats()
    }

    /// Serve queries until `shutdown` resolves, then flush the writer.
    ///
    /// The writer is closed even if the server fails.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<WriteStats>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let result = server::serve(self.listener, self.app, shutdown).await;

        info!("Flushing buffered points...");
        let stats = self.writer.close().await;

        result.map(|()| stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use reqwest::StatusCode;

    use crate::memory::{MemoryStore, Operation};

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn config(port: u16, data_dir: PathBuf) -> Config {
        Config {
            http_port: port,
            data_dir,
            flush_interval: Duration::from_millis(50),
            ..Config::default()
        }
    }

    fn shipped_data() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data")
    }

    async fn assert_not_listening(port: u16) {
        assert!(
            tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err(),
            "port {} accepted a connection",
            port
        );
    }

    #[tokio::test]
    async fn test_create_failure_aborts_before_bind() {
        let store = Arc::new(MemoryStore::with_org("my-org"));
        store.fail(
            Operation::CreateBucket,
            StatusCode::FORBIDDEN,
            "insufficient permissions",
        );
        let port = free_port();

        let result = start(&config(port, shipped_data()), store.clone()).await;

        assert!(matches!(result, Err(StartupError::Provision(_))));
        assert_not_listening(port).await;
        assert_eq!(store.write_calls(), 0);
        assert!(store.points().is_empty());
    }

    #[tokio::test]
    async fn test_missing_org_aborts_before_bind() {
        let store = Arc::new(MemoryStore::new());
        let port = free_port();

        let result = start(&config(port, shipped_data()), store.clone()).await;

        assert!(matches!(
            result,
            Err(StartupError::Provision(ProvisionError::OrgNotFound(_)))
        ));
        assert_not_listening(port).await;
        assert_eq!(store.create_calls(), 0);
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_org_lookup_failure_aborts_before_bind() {
        let store = Arc::new(MemoryStore::with_org("my-org"));
        store.fail(
            Operation::ListOrganizations,
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
        );
        let port = free_port();

        let result = start(&config(port, shipped_data()), store.clone()).await;

        assert!(matches!(result, Err(StartupError::Provision(_))));
        assert_not_listening(port).await;
        assert!(store.buckets().is_empty());
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_dataset_failure_aborts_before_bind() {
        let store = Arc::new(MemoryStore::with_org("my-org"));
        let port = free_port();
        let missing = std::env::temp_dir().join(format!("tide-missing-{}", uuid::Uuid::new_v4()));

        let result = start(&config(port, missing), store.clone()).await;

        assert!(matches!(result, Err(StartupError::Dataset(_))));
        assert_not_listening(port).await;
        // the bucket exists but nothing was written to it
        assert_eq!(store.buckets().len(), 1);
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_started_service_listens_and_flushes_on_shutdown() {
        let store = Arc::new(MemoryStore::with_org("my-org"));
        let port = free_port();

        let service = start(&config(port, shipped_data()), store.clone())
            .await
            .unwrap();
        assert_eq!(service.local_addr().port(), port);
        assert_eq!(store.buckets().len(), 1);
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(service.serve(async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.points_submitted, 96);
        assert_eq!(stats.points_written, 96);
        assert_eq!(store.points().len(), 96);
    }
}
