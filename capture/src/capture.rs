use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::instrument;

use crate::api::{
    ApiError, CaptureResponse, ClearResponse, FlushResponse, RangeQuery, SweepResponse,
};
use crate::event::{EventRecord, EventSource, RawRequest};
use crate::ingest::Admission;
use crate::pipeline::{PipelineStats, PipelineStatus};
use crate::pipeline_config::{PipelineConfig, PipelineConfigUpdate};
use crate::router;
use crate::store::StoredEntry;

/// Parses one event or an array of events and applies the producer defaults.
fn parse_events(
    body: &[u8],
    now: OffsetDateTime,
    default_source: EventSource,
) -> Result<Vec<EventRecord>, ApiError> {
    let events = serde_json::from_slice::<RawRequest>(body)?.events();
    if events.is_empty() {
        return Err(ApiError::EmptyBatch);
    }
    if events.iter().any(|event| event.kind.is_empty()) {
        return Err(ApiError::MissingEventKind);
    }

    Ok(events
        .into_iter()
        .map(|event| event.into_record(now, default_source))
        .collect())
}

fn capture_response(records: &[EventRecord], admissions: &[Admission]) -> CaptureResponse {
    let ids: Vec<String> = records
        .iter()
        .zip(admissions)
        .filter(|(_, admission)| **admission == Admission::Accepted)
        .map(|(record, _)| record.id.clone())
        .collect();
    CaptureResponse {
        accepted: ids.len(),
        duplicates: admissions.len() - ids.len(),
        ids,
    }
}

#[instrument(skip_all, fields(batch_size))]
pub async fn event(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<Json<CaptureResponse>, ApiError> {
    let now = state.pipeline.timesource().now();
    let records = parse_events(&body, now, EventSource::Synthetic)?;
    tracing::Span::current().record("batch_size", records.len());

    let admissions = state.pipeline.submit_event(records.clone())?;
    Ok(Json(capture_response(&records, &admissions)))
}

#[instrument(skip_all, fields(batch_size))]
pub async fn throttled_event(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<Json<CaptureResponse>, ApiError> {
    let now = state.pipeline.timesource().now();
    let records = parse_events(&body, now, EventSource::Dom)?;
    tracing::Span::current().record("batch_size", records.len());

    let admissions = state.pipeline.submit_throttled(records.clone())?;
    Ok(Json(capture_response(&records, &admissions)))
}

pub async fn flush(State(state): State<router::State>) -> Result<Json<FlushResponse>, ApiError> {
    let receipt = state.pipeline.flush().await?;
    Ok(Json(FlushResponse {
        committed: receipt.as_ref().map_or(0, |receipt| receipt.keys.len()),
        receipt,
    }))
}

pub async fn get_config(State(state): State<router::State>) -> Json<PipelineConfig> {
    Json(state.pipeline.get_config())
}

pub async fn update_config(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<Json<PipelineConfig>, ApiError> {
    let update: PipelineConfigUpdate = serde_json::from_slice(&body)?;
    Ok(Json(state.pipeline.update_config(update).await?))
}

fn parse_bound(name: &str, value: Option<&str>) -> Result<Option<OffsetDateTime>, ApiError> {
    value
        .map(|value| {
            OffsetDateTime::parse(value, &Rfc3339)
                .map_err(|err| ApiError::InvalidRange(format!("{name}: {err}")))
        })
        .transpose()
}

pub async fn entries(
    State(state): State<router::State>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<StoredEntry>>, ApiError> {
    let from = parse_bound("from", range.from.as_deref())?;
    let to = parse_bound("to", range.to.as_deref())?;

    let entries = match (from, to) {
        (None, None) => state.pipeline.list_entries().await?,
        (Some(from), Some(to)) if from > to => {
            return Err(ApiError::InvalidRange("from is after to".to_string()))
        }
        (from, to) => state.pipeline.list_range(from, to).await?,
    };
    Ok(Json(entries))
}

pub async fn records(
    State(state): State<router::State>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    Ok(Json(state.pipeline.list_records().await?))
}

pub async fn clear(State(state): State<router::State>) -> Result<Json<ClearResponse>, ApiError> {
    let removed = state.pipeline.clear_all().await?;
    Ok(Json(ClearResponse { removed }))
}

pub async fn sweep(State(state): State<router::State>) -> Result<Json<SweepResponse>, ApiError> {
    let report = state.pipeline.sweep_now().await?;
    Ok(Json(SweepResponse {
        skipped: report.is_none(),
        report,
    }))
}

pub async fn stats(State(state): State<router::State>) -> Result<Json<PipelineStats>, ApiError> {
    Ok(Json(state.pipeline.stats().await?))
}

pub async fn readiness(State(state): State<router::State>) -> (StatusCode, &'static str) {
    match state.pipeline.status() {
        PipelineStatus::Active => (StatusCode::OK, "ready"),
        PipelineStatus::Inactive => (StatusCode::SERVICE_UNAVAILABLE, "inactive"),
    }
}
