use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::error::PipelineError;
use crate::store::CommitReceipt;
use crate::sweeper::SweepReport;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CaptureResponse {
    pub accepted: usize,
    pub duplicates: usize,
    /// Ids of the accepted events, generated ones included
    pub ids: Vec<String>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct FlushResponse {
    pub committed: usize,
    pub receipt: Option<CommitReceipt>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClearResponse {
    pub removed: u64,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct SweepResponse {
    /// Another sweep was already running
    pub skipped: bool,
    pub report: Option<SweepReport>,
}

/// `from`/`to` bounds of an entry listing, RFC 3339.
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("request holds no event")]
    EmptyBatch,
    #[error("event submitted with an empty kind")]
    MissingEventKind,
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::RequestParsingError(_)
            | ApiError::EmptyBatch
            | ApiError::MissingEventKind
            | ApiError::InvalidRange(_)
            | ApiError::Pipeline(PipelineError::Config(_)) => StatusCode::BAD_REQUEST,

            ApiError::Pipeline(PipelineError::NotRunning) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pipeline(PipelineError::AlreadyRunning) => StatusCode::CONFLICT,

            ApiError::Pipeline(PipelineError::CommitFailed { .. })
            | ApiError::Pipeline(PipelineError::CommitterGone)
            | ApiError::Pipeline(PipelineError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
