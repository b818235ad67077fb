use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, QueryError};
use crate::query::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Span of the range; zero when `to` is not after `from`.
    pub fn duration(&self) -> Duration {
        (self.to - self.from).to_std().unwrap_or(Duration::ZERO)
    }
}

/// One query of a batch, as handed over by the host.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub ref_id: String,
    pub json: Vec<u8>,
    pub time_range: TimeRange,
    pub interval: Duration,
}

impl QueryRequest {
    pub fn new(
        ref_id: impl Into<String>,
        json: impl Into<Vec<u8>>,
        time_range: TimeRange,
        interval: Duration,
    ) -> Self {
        Self {
            ref_id: ref_id.into(),
            json: json.into(),
            time_range,
            interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuery {
    pub ref_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFailure {
    pub code: ErrorCode,
    pub message: String,
}

/// Outcome of one query: a frame, or the error that replaced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryResponse {
    Frame(Frame),
    Error(QueryFailure),
}

impl QueryResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        QueryResponse::Error(QueryFailure {
            code,
            message: message.into(),
        })
    }

    pub fn frame(&self) -> Option<&Frame> {
        match self {
            QueryResponse::Frame(frame) => Some(frame),
            QueryResponse::Error(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&QueryFailure> {
        match self {
            QueryResponse::Frame(_) => None,
            QueryResponse::Error(failure) => Some(failure),
        }
    }
}

impl From<QueryError> for QueryResponse {
    fn from(err: QueryError) -> Self {
        QueryResponse::error(err.code(), err.to_string())
    }
}

pub type BatchResult = HashMap<String, QueryResponse>;

/// Wire form of a single query inside a `POST /query` body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    pub ref_id: String,
    #[serde(default)]
    pub body: serde_json::Value,
    pub time_range: TimeRange,
    #[serde(default)]
    pub interval_ms: u64,
}

impl QueryPayload {
    pub fn into_request(self) -> crate::Result<QueryRequest> {
        let json = serde_json::to_vec(&self.body)?;
        Ok(QueryRequest {
            ref_id: self.ref_id,
            json,
            time_range: self.time_range,
            interval: Duration::from_millis(self.interval_ms),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub queries: Vec<QueryPayload>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: BatchResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResult {
    pub status: HealthStatus,
    pub message: String,
}

impl HealthResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Ok,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            message: message.into(),
        }
    }
}
