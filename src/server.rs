//! HTTP query API.

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use crate::query::{QueryError, QueryService};
use crate::store::QueryRow;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
}

impl QueryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            QueryError::InvalidPlace(_) => StatusCode::BAD_REQUEST,
            QueryError::Store(_) => StatusCode::BAD_GATEWAY,
            QueryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the router with every API route.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/tide/:place", get(handle_tide))
        .route("/-/healthy", get(handle_healthy))
        .with_state(state)
}

/// Handle GET /api/v1/tide/:place
///
/// Responds 200 with the matching rows as a JSON array, possibly empty.
async fn handle_tide(
    State(state): State<AppState>,
    Path(place): Path<String>,
) -> Result<Json<Vec<QueryRow>>, QueryError> {
    let rows = state.query.query_place(&place).await?;
    Ok(Json(rows))
}

/// Handle GET /-/healthy
async fn handle_healthy() -> &'static str {
    "OK"
}

/// Bind the query API on all interfaces.
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Server shut down gracefully");
    Ok(())
}

/// Listen for SIGTERM and SIGINT (Ctrl+C).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::time::Duration;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            QueryError::InvalidPlace("empty".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            QueryError::Store(StoreError::Query("boom".to_string())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            QueryError::Timeout(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_response() {
        let response = QueryError::Timeout(Duration::from_secs(1)).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
