//! Control protocol between the supervisor and worker processes.
//!
//! Messages are JSON objects tagged by `type`, one per line. The supervisor
//! writes [`ControlRequest`]s to the worker's stdin; the worker answers with
//! [`WorkerEvent`]s on its stdout.

use crate::service::IngestOptions;
use crate::store::StoreParams;
use serde::{Deserialize, Serialize};

/// Configuration shared read-only by every worker of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// `host:port` every worker binds.
    pub bind_address: String,
    /// Backing-store endpoint and credentials.
    pub store: StoreParams,
    /// Options for the service attached to the listener.
    #[serde(default)]
    pub ingest: IngestOptions,
}

/// Request from supervisor to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Connect to the store and bind the listener.
    Start {
        worker_id: usize,
        config: WorkerConfig,
    },
    /// Every worker is bound: begin accepting connections.
    Serve,
    /// Stop accepting new work and drain.
    Stop,
    /// Leave as soon as possible.
    Exit,
}

/// Event from worker to supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Process is up and waiting for `Start`.
    Ready { pid: u32 },
    /// Store connected and listener bound.
    Bound { addr: String },
    /// Accept loop running.
    Serving { addr: String },
    /// Server loop ended cleanly.
    Stopped,
    /// Startup or serving failed.
    Failed { message: String },
}

impl WorkerEvent {
    /// Create a failure event.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Whether this event ends the worker's serving loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> WorkerConfig {
        WorkerConfig {
            bind_address: "localhost:50051".to_string(),
            store: StoreParams::new("redis", 6379),
            ingest: IngestOptions::default(),
        }
    }

    #[test]
    fn test_start_request_carries_config() {
        let req = ControlRequest::Start {
            worker_id: 1,
            config: sample_config(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""type":"start""#));
        assert!(json.contains("localhost:50051"));

        let parsed: ControlRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_unit_requests_are_tagged() {
        assert_eq!(
            serde_json::to_string(&ControlRequest::Stop).unwrap(),
            r#"{"type":"stop"}"#
        );
        let parsed: ControlRequest = serde_json::from_str(r#"{"type":"serve"}"#).unwrap();
        assert_eq!(parsed, ControlRequest::Serve);
    }

    #[test]
    fn test_config_without_ingest_options() {
        let json = r#"{"bind_address":"127.0.0.1:9000","store":{"hostname":"db","port":6379,"username":null,"password":null}}"#;
        let config: WorkerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ingest, IngestOptions::default());
    }

    #[test]
    fn test_event_terminality() {
        assert!(WorkerEvent::Stopped.is_terminal());
        assert!(WorkerEvent::failed("bind").is_terminal());
        assert!(!WorkerEvent::Ready { pid: 1 }.is_terminal());
        assert!(
            !WorkerEvent::Bound {
                addr: "127.0.0.1:1".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_failed_event_roundtrip() {
        let line = serde_json::to_string(&WorkerEvent::failed("connection refused")).unwrap();
        match serde_json::from_str::<WorkerEvent>(&line).unwrap() {
            WorkerEvent::Failed { message } => assert_eq!(message, "connection refused"),
            other => panic!("Expected Failed event, got {:?}", other),
        }
    }
}
