use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::datasource::DataSource;
use crate::metrics;
use crate::models::{BatchRequest, BatchResponse, HealthStatus};
use crate::pool::ConnectionPool;
use crate::{DataSourceError, Result};

pub struct AppState<P> {
    pub datasource: Arc<DataSource<P>>,
}

impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            datasource: self.datasource.clone(),
        }
    }
}

pub fn router<P: ConnectionPool>(datasource: Arc<DataSource<P>>) -> Router {
    Router::new()
        .route("/query", post(query_data::<P>))
        .route("/health", get(check_health::<P>))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { datasource })
}

async fn query_data<P: ConnectionPool>(
    State(state): State<AppState<P>>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>> {
    info!("Received batch of {} queries", request.queries.len());

    let queries = request
        .queries
        .into_iter()
        .map(|payload| payload.into_request())
        .collect::<Result<Vec<_>>>()?;

    let results = state.datasource.query_data(queries).await?;
    Ok(Json(BatchResponse { results }))
}

async fn check_health<P: ConnectionPool>(State(state): State<AppState<P>>) -> impl IntoResponse {
    let result = state.datasource.check_health().await;
    let status = match result.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Error => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(result))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
}

/// Serve the data source on `0.0.0.0:port` until Ctrl-C.
pub async fn serve<P: ConnectionPool>(datasource: Arc<DataSource<P>>, port: u16) -> Result<()> {
    let app = router(datasource);
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting data source service on {}", addr);

    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        DataSourceError::Internal(format!("Failed to bind to address {}: {}", addr, e))
    })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| DataSourceError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
