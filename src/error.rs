//! Error types for ingestd.

use thiserror::Error;

/// Main error type for ingestd.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to bind probe socket on port {port}: {source}")]
    PortBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {worker_id} (pid {pid}) failed to start on {addr}: {message}")]
    WorkerStart {
        worker_id: usize,
        pid: i32,
        addr: String,
        message: String,
    },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Worker {worker_id} cannot {action} while {from}")]
    InvalidTransition {
        worker_id: usize,
        from: String,
        action: &'static str,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for ingestd operations.
pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::io;

    #[test]
    fn test_port_bind_error_message() {
        let err = IngestError::PortBind {
            port: 50051,
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        let msg = err.to_string();
        assert!(msg.contains("50051"));
        assert!(msg.contains("address in use"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_worker_start_error_message() {
        let err = IngestError::WorkerStart {
            worker_id: 1,
            pid: 4242,
            addr: "localhost:50051".to_string(),
            message: "connection refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Worker 1"));
        assert!(msg.contains("4242"));
        assert!(msg.contains("localhost:50051"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = IngestError::InvalidTransition {
            worker_id: 0,
            from: "destroyed".to_string(),
            action: "start",
        };
        assert_eq!(err.to_string(), "Worker 0 cannot start while destroyed");
    }

    #[test]
    fn test_config_error_message() {
        let err = IngestError::Config("worker count must be at least 1".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("at least 1"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: IngestError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: IngestError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<u16> {
            Ok(50051)
        }

        fn returns_err() -> Result<u16> {
            Err(IngestError::Store("NOAUTH".into()))
        }

        assert_eq!(returns_ok().unwrap(), 50051);
        assert!(returns_err().is_err());
    }
}
