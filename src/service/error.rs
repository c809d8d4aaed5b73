//! API error handling.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

/// API error type that converts to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    /// 400 Bad Request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }

    /// 413 Payload Too Large, used for oversized batches.
    pub fn too_large(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            code: "BATCH_TOO_LARGE".to_string(),
            message: message.into(),
        }
    }

    /// 502 Bad Gateway, used when the backing store rejects a write.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            code: "STORE_UNAVAILABLE".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<crate::error::IngestError> for ApiError {
    fn from(err: crate::error::IngestError) -> Self {
        use crate::error::IngestError;
        match err {
            IngestError::Store(msg) => ApiError::store_unavailable(msg),
            IngestError::Io(e) => ApiError::store_unavailable(format!("Store I/O error: {}", e)),
            other => ApiError::store_unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;

    #[test]
    fn test_bad_request() {
        let err = ApiError::bad_request("empty batch");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "BAD_REQUEST");
        assert_eq!(err.message, "empty batch");
    }

    #[test]
    fn test_store_error_maps_to_bad_gateway() {
        let err = ApiError::from(IngestError::Store("READONLY replica".into()));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert!(err.message.contains("READONLY"));
    }

    #[test]
    fn test_into_response_status() {
        let resp = ApiError::too_large("1001 records").into_response();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
