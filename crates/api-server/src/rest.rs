//! REST handlers for event ingestion, metrics queries and the health probe.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use fast_ingest_analytics::MetricsEngine;
use fast_ingest_core::config::AppConfig;
use fast_ingest_core::error::IngestError;
use fast_ingest_core::types::{format_instant, Event, MetricsRequest, MetricsResult};
use fast_ingest_pipeline::AdmissionQueue;
use fast_ingest_storage::error::with_deadline;
use fast_ingest_storage::EventStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: AdmissionQueue,
    pub store: Arc<dyn EventStore>,
    pub engine: Arc<MetricsEngine>,
    pub max_bulk_events: usize,
    pub max_lookback_days: i64,
    pub probe_timeout: Duration,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: &AppConfig, queue: AdmissionQueue, store: Arc<dyn EventStore>) -> Self {
        let engine = Arc::new(MetricsEngine::new(store.clone(), config.query.timeout()));
        Self {
            queue,
            store,
            engine,
            max_bulk_events: config.api.max_bulk_events,
            max_lookback_days: config.query.max_lookback_days,
            probe_timeout: config.query.timeout(),
            start_time: Instant::now(),
        }
    }

    fn record_depth(&self) {
        metrics::gauge!("ingest.queue_depth").set(self.queue.depth() as f64);
    }
}

/// Error body shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Handler error carrying its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "invalid_request",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal_error",
            message: message.into(),
        }
    }

    fn invalid_json(rejection: &impl std::fmt::Display) -> Self {
        metrics::counter!("ingest.validation_errors").increment(1);
        debug!(rejection = %rejection, "Rejected request body");
        Self::bad_request("invalid JSON payload")
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Validation(message) => Self::bad_request(message),
            IngestError::QueueFull => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                error: "queue_full",
                message: "ingest queue full".to_string(),
            },
            IngestError::ShuttingDown => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error: "shutting_down",
                message: "server is shutting down".to_string(),
            },
            other => {
                error!(error = %other, "Unexpected ingest error");
                Self::internal("internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_later = self.status == StatusCode::TOO_MANY_REQUESTS;
        let mut response = (
            self.status,
            Json(ErrorResponse {
                error: self.error.to_string(),
                message: self.message,
            }),
        )
            .into_response();
        if retry_later {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub at: String,
}

#[derive(Debug, Serialize)]
pub struct BulkAcceptedResponse {
    pub status: &'static str,
    pub accepted: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queue_length: usize,
    pub uptime_secs: u64,
}

fn reject_invalid(e: IngestError) -> ApiError {
    metrics::counter!("ingest.validation_errors").increment(1);
    warn!(error = %e, "Event validation failed");
    ApiError::from(e)
}

/// POST /events: admit a single event.
pub async fn ingest_event(
    State(state): State<AppState>,
    payload: Result<Json<Event>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let Json(event) = payload.map_err(|e| ApiError::invalid_json(&e))?;
    event.validate().map_err(reject_invalid)?;

    let result = state.queue.enqueue(event);
    state.record_depth();
    if let Err(e) = result {
        warn!(error = %e, "Event not admitted");
        return Err(e.into());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            at: format_instant(Utc::now()),
        }),
    ))
}

/// POST /events/bulk: admit a batch of events, all or none.
pub async fn ingest_bulk(
    State(state): State<AppState>,
    payload: Result<Json<Vec<Event>>, JsonRejection>,
) -> Result<(StatusCode, Json<BulkAcceptedResponse>), ApiError> {
    let Json(events) = payload.map_err(|e| ApiError::invalid_json(&e))?;

    if events.is_empty() {
        return Err(reject_invalid(IngestError::validation("events is required")));
    }
    if events.len() > state.max_bulk_events {
        return Err(reject_invalid(IngestError::validation(format!(
            "too many events (max {})",
            state.max_bulk_events
        ))));
    }
    if let Some(index) = events.iter().position(|e| e.validate().is_err()) {
        return Err(reject_invalid(IngestError::validation(format!(
            "invalid event at index {index}"
        ))));
    }

    let count = events.len();
    let result = state.queue.enqueue_all(events);
    state.record_depth();
    let accepted = result.map_err(|e| {
        warn!(error = %e, count = count, "Bulk request not admitted");
        ApiError::from(e)
    })?;

    debug!(accepted = accepted, "Bulk request admitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(BulkAcceptedResponse {
            status: "accepted",
            accepted,
        }),
    ))
}

/// GET /metrics: aggregate counts over a time range.
pub async fn get_metrics(
    State(state): State<AppState>,
    params: Result<Query<MetricsRequest>, QueryRejection>,
) -> Result<Json<MetricsResult>, ApiError> {
    let Query(request) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let query = request
        .validate(Utc::now(), state.max_lookback_days)
        .map_err(ApiError::from)?;

    match state.engine.query_metrics(&query).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            error!(error = %e, event_name = %query.event_name, "Metrics query failed");
            Err(ApiError::internal("failed to retrieve metrics"))
        }
    }
}

/// GET /health: store connectivity and current queue depth.
pub async fn health_check(State(state): State<AppState>) -> Response {
    match with_deadline(state.probe_timeout, state.store.ping()).await {
        Ok(()) => Json(HealthResponse {
            status: "ok",
            queue_length: state.queue.depth(),
            uptime_secs: state.start_time.elapsed().as_secs(),
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, backend = state.store.backend_name(), "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "unhealthy".to_string(),
                    message: "store unreachable".to_string(),
                }),
            )
                .into_response()
        }
    }
}
