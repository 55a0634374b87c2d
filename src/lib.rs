//! Tide Ingest Library
//!
//! This library loads tide observations for a fixed set of coastal
//! locations into InfluxDB and serves them back by location:
//!
//! - **config**: Environment-based configuration
//! - **dataset**: Per-location observation files
//! - **point**: Observation to time-series point, line protocol encoding
//! - **store**: Remote store trait, query and error types
//! - **client**: InfluxDB v2 HTTP implementation of the store
//! - **annotated_csv**: Streaming decoder for Flux query results
//! - **memory**: In-memory store for tests
//! - **provision**: Idempotent bucket provisioning
//! - **writer**: Buffered, non-blocking write channel
//! - **pipeline**: Bulk load of all datasets
//! - **query**: Location query service
//! - **server**: HTTP query API
//! - **service**: Ordered startup and shutdown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tide_ingest::client::InfluxClient;
//! use tide_ingest::config::Config;
//! use tide_ingest::dataset::load_monitored;
//! use tide_ingest::pipeline::load_all;
//! use tide_ingest::provision::ensure_bucket;
//! use tide_ingest::store::TideStore;
//! use tide_ingest::writer::{PointWriter, WriteTarget, WriterConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let store: Arc<dyn TideStore> =
//!         Arc::new(InfluxClient::new(&config).expect("Failed to create client"));
//!
//!     let provisioned = ensure_bucket(store.as_ref(), &config.org, &config.bucket)
//!         .await
//!         .expect("Provisioning failed");
//!
//!     let target = WriteTarget {
//!         org_id: provisioned.org_id().to_string(),
//!         bucket: config.bucket.clone(),
//!     };
//!     let writer = PointWriter::spawn(store, target, WriterConfig::from_config(&config));
//!
//!     let datasets = load_monitored(&config.data_dir).await.expect("Failed to load datasets");
//!     load_all(&datasets, &writer.handle()).ok();
//!     writer.close().await;
//! }
//! ```

pub mod annotated_csv;
pub mod client;
pub mod config;
pub mod dataset;
pub mod memory;
pub mod pipeline;
pub mod point;
pub mod provision;
pub mod query;
pub mod server;
pub mod service;
pub mod store;
pub mod writer;

// Re-export commonly used types at crate root for convenience
pub use client::InfluxClient;
pub use config::{Config, ConfigError};
pub use dataset::{DatasetError, LocationDataset, TideObservation};
pub use memory::MemoryStore;
pub use point::{build_points, TidePoint};
pub use provision::{ensure_bucket, ProvisionError, ProvisionOutcome, Provisioned};
pub use query::{QueryError, QueryService};
pub use service::{Service, StartupError};
pub use store::{Bucket, Organization, QueryRow, RangeQuery, StoreError, TideStore};
pub use writer::{PointWriter, WriteError, WriteHandle, WriteStats, WriteTarget, WriterConfig};
