//! Ingestion service attached to each worker's listener.
//!
//! The worker treats the service as opaque: it hands a [`ServiceHandler`] its
//! store connection and serves whatever router comes back.
//!
//! # Endpoints
//!
//! - `POST /v1/logs`: accepts one JSON object or an array of objects and
//!   appends each record to the configured store list.
//! - `GET /health`: reports the serving process and worker id.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::store::StoreClient;

/// Default store list receiving ingested records.
pub const DEFAULT_LIST_KEY: &str = "ingest:logs";

/// Default upper bound on records per request.
pub const DEFAULT_MAX_BATCH: usize = 1000;

/// Something that can be registered against a worker's listener.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Build the router serving requests with this worker's store connection.
    fn router(&self, store: StoreClient) -> Router;
}

/// Options for the log ingestion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Store list that receives records.
    pub list_key: String,
    /// Maximum number of records accepted in one request.
    pub max_batch: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            list_key: DEFAULT_LIST_KEY.to_string(),
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

/// Per-worker state shared by the handlers.
pub struct IngestState {
    pub store: StoreClient,
    pub options: IngestOptions,
    pub worker_id: usize,
}

/// Log ingestion service forwarding JSON records to the store.
#[derive(Debug, Clone)]
pub struct LogIngestService {
    worker_id: usize,
    options: IngestOptions,
}

impl LogIngestService {
    pub fn new(worker_id: usize, options: IngestOptions) -> Self {
        Self { worker_id, options }
    }
}

impl ServiceHandler for LogIngestService {
    fn router(&self, store: StoreClient) -> Router {
        let state = Arc::new(IngestState {
            store,
            options: self.options.clone(),
            worker_id: self.worker_id,
        });

        Router::new()
            .route("/v1/logs", post(handlers::ingest_logs))
            .route("/health", get(handlers::health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}
