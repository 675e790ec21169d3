use crate::errors::Error;
use crate::ingest::{IngestOutcome, IngestionService};
use crate::model::{DeviceEvent, DeviceEventRowList, DeviceSnapshot};
use crate::queries::{self, PageQuery};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
struct AppState {
    service: Arc<IngestionService>,
    include_in_progress: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
    device_id: Option<String>,
    starting_at: Option<String>,
}

pub fn create_router(service: Arc<IngestionService>, include_in_progress: bool) -> Router {
    let state = AppState {
        service,
        include_in_progress,
    };

    Router::new()
        .route("/api/events", post(missing_device_id))
        .route("/api/events/", post(missing_device_id))
        .route("/api/events/:device_id", post(post_events))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/queue/length", get(queue_length))
        .route("/api/devices/history/interval/:start/:end", get(history_interval))
        .route(
            "/api/devices/history/page/:page_index/pageSize/:page_size",
            get(history_page),
        )
        .route(
            "/api/devices/history/byKeyRange/:start/:end/:index_start/:batch_size",
            get(history_key_range),
        )
        .with_state(state)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("Invalid timestamp '{}': {}", raw, e)))
}

async fn missing_device_id() -> Result<Json<IngestOutcome>, AppError> {
    Err(Error::Validation("Device id cannot be empty".to_string()).into())
}

async fn post_events(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<Json<IngestOutcome>, AppError> {
    if body.is_empty() {
        return Err(Error::Validation("Request body cannot be empty".to_string()).into());
    }

    let events: Vec<DeviceEvent> = serde_json::from_slice(&body)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    debug!(device_id = %device_id, events = events.len(), "Received event batch");

    let outcome = state.service.ingest(&device_id, events).await?;
    Ok(Json(outcome))
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceSnapshot>>, AppError> {
    let snapshots = queries::device_snapshots(state.service.store().as_ref()).await?;
    Ok(Json(snapshots))
}

async fn queue_length(State(state): State<AppState>) -> Result<Json<u64>, AppError> {
    let total = queries::queue_length(state.service.store().as_ref(), state.include_in_progress).await?;
    Ok(Json(total))
}

async fn history_interval(
    State(state): State<AppState>,
    Path((start, end)): Path<(i64, i64)>,
) -> Result<Json<Vec<DeviceSnapshot>>, AppError> {
    let records = queries::history_interval(state.service.store().as_ref(), start, end, Utc::now()).await?;
    Ok(Json(records))
}

async fn history_page(
    State(state): State<AppState>,
    Path((page_index, page_size)): Path<(usize, usize)>,
    Query(params): Query<PageParams>,
) -> Result<Json<DeviceEventRowList>, AppError> {
    let starting_at = params.starting_at.as_deref().map(parse_timestamp).transpose()?;

    let query = PageQuery {
        page_index,
        page_size,
        device_id: params.device_id.filter(|id| !id.trim().is_empty()),
        starting_at,
    };

    let page = queries::history_page(state.service.store().as_ref(), &query).await?;
    Ok(Json(page))
}

async fn history_key_range(
    State(state): State<AppState>,
    Path((start, end, index_start, batch_size)): Path<(String, String, usize, usize)>,
) -> Result<Json<Vec<DeviceSnapshot>>, AppError> {
    let start = parse_timestamp(&start)?;
    let end = parse_timestamp(&end)?;

    let records =
        queries::history_key_range(state.service.store().as_ref(), start, end, index_start, batch_size).await?;
    Ok(Json(records))
}

/// HTTP status for a domain error.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) | Error::InvalidKey(_) | Error::CommitFailure { .. } => StatusCode::BAD_REQUEST,
        Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<Error>()
            .map_or(StatusCode::INTERNAL_SERVER_ERROR, status_for);

        if status.is_server_error() {
            error!("API error: {}", self.0);
            (status, format!("Internal server error: {}", self.0)).into_response()
        } else {
            debug!("Rejected request: {}", self.0);
            (status, self.0.to_string()).into_response()
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&Error::CommitFailure {
                attempts: 5,
                source: Box::new(Error::TransientTimeout("busy".into())),
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&Error::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&Error::TransientTimeout("busy".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(
            parse_timestamp("1970-01-01T00:00:01.500+00:00").unwrap().timestamp_millis(),
            1_500
        );
        assert!(matches!(parse_timestamp("yesterday"), Err(Error::Validation(_))));
    }
}
