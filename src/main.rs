//! Tide Ingest - tide observation loader and query API
//!
//! On startup this service makes sure the target InfluxDB bucket exists,
//! bulk-loads the tide observations of every monitored location, and then
//! serves `GET /api/v1/tide/:place`.
//!
//! Startup is all-or-nothing: if configuration, provisioning or dataset
//! loading fails, the process exits with status 1 before the listener binds
//! and before any point is written.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `INFLUX_URL`, `INFLUX_TOKEN`, `INFLUX_ORG`, `INFLUX_BUCKET`: store access
//! - `TIDE_HTTP_PORT`: query API port (default: 3000)
//! - `TIDE_DATA_DIR`: directory of `tides-<location>.json` files (default: data)
//! - `TIDE_BATCH_SIZE`, `TIDE_FLUSH_INTERVAL_SECS`: write batching
//! - `TIDE_REQUEST_TIMEOUT_SECS`, `TIDE_QUERY_TIMEOUT_SECS`, `TIDE_MAX_RETRIES`
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tide_ingest::client::InfluxClient;
use tide_ingest::config::Config;
use tide_ingest::server;
use tide_ingest::service;
use tide_ingest::store::TideStore;

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Tide Ingest service...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                influx_url = %config.influx_url,
                org = %config.org,
                bucket = %config.bucket,
                http_port = config.http_port,
                batch_size = config.batch_size,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn TideStore> = match InfluxClient::new(&config) {
        Ok(client) => {
            info!(url = %client.base_url(), "InfluxDB client initialized");
            Arc::new(client)
        }
        Err(e) => {
            error!(error = %e, "Failed to create InfluxDB client");
            std::process::exit(1);
        }
    };

    let service = match service::start(&config, store).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    };

    info!(addr = %service.local_addr(), "Tide Ingest started");

    match service.serve(server::shutdown_signal()).await {
        Ok(stats) => info!(
            written = stats.points_written,
            failed = stats.points_failed,
            dropped = stats.points_dropped,
            "Tide Ingest stopped"
        ),
        Err(e) => {
            error!(error = %e, "Query API stopped with an error");
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
