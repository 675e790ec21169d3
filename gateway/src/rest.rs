use crate::errors::Error;
use crate::fanout::{Concatenate, PartitionFanout, Sum, WindowedPage};
use crate::forward::EventForwarder;
use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use ingestor::model::{DeviceEventRowList, DeviceSnapshot};
use ingestor::queries::MAX_PAGE_SIZE;
use ingestor::store::{COUNTERS, HISTORY, IN_PROGRESS};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
struct AppState {
    fanout: Arc<PartitionFanout>,
    forwarder: Arc<EventForwarder>,
}

pub fn create_router(fanout: Arc<PartitionFanout>, forwarder: Arc<EventForwarder>) -> Router {
    let state = AppState { fanout, forwarder };

    Router::new()
        .route("/api/events", post(missing_device_id))
        .route("/api/events/", post(missing_device_id))
        .route("/api/events/:device_id", post(post_events))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/device/:device_id", get(device_by_id))
        .route("/api/devices/queue/length", get(queue_length))
        .route("/api/devices/history/interval/:start/:end", get(history_interval))
        .route(
            "/api/devices/history/page/:page_index/pageSize/:page_size",
            get(history_page),
        )
        .route(
            "/api/devices/history/download/from/:start/to/:end",
            get(download_history),
        )
        .with_state(state)
}

async fn missing_device_id() -> Result<Response, AppError> {
    Err(Error::Validation("Device id cannot be empty".to_string()).into())
}

async fn post_events(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let relayed = state.forwarder.forward(&device_id, body.to_vec()).await?;
    let status = StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::BAD_GATEWAY);

    Ok((status, [(header::CONTENT_TYPE, "application/json")], relayed.body).into_response())
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceSnapshot>>, AppError> {
    let devices = state
        .fanout
        .query(IN_PROGRESS.name(), "/api/devices", &Concatenate::new())
        .await?;
    Ok(Json(devices))
}

async fn device_by_id(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Vec<DeviceSnapshot>>, AppError> {
    let devices: Vec<DeviceSnapshot> = state
        .fanout
        .query(IN_PROGRESS.name(), "/api/devices", &Concatenate::new())
        .await?;

    Ok(Json(
        devices
            .into_iter()
            .filter(|d| d.device_id.eq_ignore_ascii_case(&device_id))
            .collect(),
    ))
}

async fn queue_length(State(state): State<AppState>) -> Result<Json<u64>, AppError> {
    let total = state
        .fanout
        .query(COUNTERS.name(), "/api/devices/queue/length", &Sum)
        .await?;
    Ok(Json(total))
}

async fn history_interval(
    State(state): State<AppState>,
    Path((start, end)): Path<(i64, i64)>,
) -> Result<Json<Vec<DeviceSnapshot>>, AppError> {
    if start < end {
        return Err(Error::Validation(format!(
            "Interval start ({}) must be at or before its end ({})",
            start, end
        ))
        .into());
    }

    let path = format!("/api/devices/history/interval/{}/{}", start, end);
    let records = state
        .fanout
        .query(HISTORY.name(), &path, &Concatenate::new())
        .await?;
    Ok(Json(records))
}

async fn history_page(
    State(state): State<AppState>,
    Path((page_index, page_size)): Path<(usize, usize)>,
    RawQuery(query): RawQuery,
) -> Result<Json<DeviceEventRowList>, AppError> {
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(Error::Validation(format!(
            "pageSize must be between 1 and {}, got {}",
            MAX_PAGE_SIZE, page_size
        ))
        .into());
    }

    let mut path = format!("/api/devices/history/page/{}/pageSize/{}", page_index, page_size);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        path.push('?');
        path.push_str(&query);
    }

    let page = state
        .fanout
        .query(HISTORY.name(), &path, &WindowedPage { page_index, page_size })
        .await?;
    Ok(Json(page))
}

fn normalize_timestamp(raw: &str) -> Result<String, Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
        .map_err(|e| Error::Validation(format!("Invalid timestamp '{}': {}", raw, e)))
}

async fn download_history(
    State(state): State<AppState>,
    Path((start, end)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let start = normalize_timestamp(&start)?;
    let end = normalize_timestamp(&end)?;

    let rows = state.fanout.collect_key_range(&start, &end).await?;
    debug!("Export from {} to {} holds {} rows", start, end, rows.len());

    let body = serde_json::to_vec(&rows)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CONTENT_DISPOSITION, "attachment; filename=export.json"),
        ],
        body,
    )
        .into_response())
}

/// HTTP status for a gateway error. A failing partition's own status is
/// passed through.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::PartitionUnavailable { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        Error::Transport(_) | Error::Json(_) => StatusCode::BAD_GATEWAY,
        Error::NoPartitions(_) | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Publish(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
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
        } else {
            debug!("Rejected request: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
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
