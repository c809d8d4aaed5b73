//! Request handlers for the ingestion service.

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use super::IngestState;
use super::error::ApiError;

/// Response to an accepted batch.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub pid: u32,
    pub worker_id: usize,
}

/// Flatten a request body into individual records.
fn into_records(body: Value) -> Result<Vec<Value>, ApiError> {
    let records = match body {
        Value::Array(items) => items,
        record @ Value::Object(_) => vec![record],
        _ => {
            return Err(ApiError::bad_request(
                "Body must be a JSON object or an array of objects",
            ));
        }
    };

    if records.is_empty() {
        return Err(ApiError::bad_request("Batch contains no records"));
    }
    if let Some(pos) = records.iter().position(|r| !r.is_object()) {
        return Err(ApiError::bad_request(format!(
            "Record {} is not a JSON object",
            pos
        )));
    }
    Ok(records)
}

/// Append a batch of log records to the store list.
#[instrument(skip_all)]
pub async fn ingest_logs(
    State(state): State<Arc<IngestState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let records = into_records(body)?;
    if records.len() > state.options.max_batch {
        return Err(ApiError::too_large(format!(
            "Batch of {} records exceeds the limit of {}",
            records.len(),
            state.options.max_batch
        )));
    }

    let encoded = records
        .iter()
        .map(serde_json::to_vec)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::bad_request(format!("Unserializable record: {}", e)))?;
    state.store.push(&state.options.list_key, encoded).await?;

    tracing::debug!(records = records.len(), "Batch forwarded to store");
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted: records.len(),
        }),
    ))
}

/// Report which process and worker answered.
pub async fn health_check(State(state): State<Arc<IngestState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        pid: std::process::id(),
        worker_id: state.worker_id,
    })
}
