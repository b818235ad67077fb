use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("connection acquisition failed for {ref_id}: {source}")]
    Acquisition {
        ref_id: String,
        #[source]
        source: AcquireError,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for DataSourceError {
    fn from(err: serde_json::Error) -> Self {
        DataSourceError::Serialization(err.to_string())
    }
}

impl From<tokio_postgres::Error> for DataSourceError {
    fn from(err: tokio_postgres::Error) -> Self {
        DataSourceError::Pool(err.to_string())
    }
}

impl From<deadpool_postgres::BuildError> for DataSourceError {
    fn from(err: deadpool_postgres::BuildError) -> Self {
        DataSourceError::Pool(err.to_string())
    }
}

impl From<duckdb::Error> for DataSourceError {
    fn from(err: duckdb::Error) -> Self {
        DataSourceError::Pool(err.to_string())
    }
}

impl IntoResponse for DataSourceError {
    fn into_response(self) -> Response {
        let status = match self {
            DataSourceError::Settings(_) | DataSourceError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            DataSourceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DataSourceError::Acquisition { .. } => StatusCode::BAD_GATEWAY,
            DataSourceError::Pool(_) | DataSourceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DataSourceError>;

/// Failure to obtain a connection from a pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("timed out waiting for a connection")]
    Timeout,

    #[error("context canceled")]
    Cancelled,

    #[error("pool is closed")]
    Closed,

    #[error("{0}")]
    Backend(String),
}

/// Status code attached to a failed query in a batch response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    Internal,
}

/// Why a single query of a batch did not produce a frame.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query format: {0}")]
    MalformedQuery(String),

    #[error("empty query text")]
    EmptyQuery,

    #[error(transparent)]
    Acquisition(#[from] AcquireError),

    #[error("query execution failed: {0}")]
    Execution(String),
}

impl QueryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            QueryError::MalformedQuery(_) | QueryError::EmptyQuery => ErrorCode::BadRequest,
            QueryError::Acquisition(_) | QueryError::Execution(_) => ErrorCode::Internal,
        }
    }
}

impl From<tokio_postgres::Error> for QueryError {
    fn from(err: tokio_postgres::Error) -> Self {
        QueryError::Execution(err.to_string())
    }
}

impl From<duckdb::Error> for QueryError {
    fn from(err: duckdb::Error) -> Self {
        QueryError::Execution(err.to_string())
    }
}
