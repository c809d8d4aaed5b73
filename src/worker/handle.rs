//! Supervisor-side handle for one worker.

use super::protocol::{ControlRequest, WorkerConfig, WorkerEvent};
use super::signals::TerminationReason;
use super::state::{Lifecycle, WorkerOutcome, WorkerState};
use crate::error::{IngestError, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Events delivered to the supervisor's single receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A message from a worker.
    Worker { id: usize, event: WorkerEvent },
    /// A worker's control channel closed.
    Disconnected { id: usize },
    /// Ctrl-C / SIGTERM reached the supervisor.
    Interrupt,
}

/// Transport to one worker: delivers requests and tears the far end down.
pub trait WorkerLink {
    /// OS process id of the worker.
    fn pid(&self) -> i32;

    fn send(&mut self, request: &ControlRequest) -> Result<()>;

    /// Make the worker go away, waiting up to `timeout` before forcing it.
    fn shutdown(&mut self, timeout: Duration) -> TerminationReason;
}

/// One worker process, as seen by the supervisor.
///
/// Requests are fire-and-forget; replies arrive as [`PoolEvent`]s and are
/// fed back through [`ServerWorker::record`].
pub struct ServerWorker<L: WorkerLink> {
    id: usize,
    config: WorkerConfig,
    link: L,
    lifecycle: Lifecycle,
    stop_timeout: Duration,
}

impl<L: WorkerLink> ServerWorker<L> {
    pub fn new(id: usize, config: WorkerConfig, link: L, stop_timeout: Duration) -> Self {
        Self {
            id,
            config,
            link,
            lifecycle: Lifecycle::new(id),
            stop_timeout,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> i32 {
        self.link.pid()
    }

    pub fn bind_address(&self) -> &str {
        &self.config.bind_address
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    pub fn outcome(&self) -> Option<&WorkerOutcome> {
        self.lifecycle.outcome()
    }

    pub fn is_bound(&self) -> bool {
        self.lifecycle.is_bound()
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.is_finished()
    }

    /// Start error carrying this worker's pid and bind address.
    pub fn start_error(&self, message: impl Into<String>) -> IngestError {
        IngestError::WorkerStart {
            worker_id: self.id,
            pid: self.pid(),
            addr: self.config.bind_address.clone(),
            message: message.into(),
        }
    }

    /// Ask the worker to connect its store and bind its listener.
    pub fn start(&mut self) -> Result<()> {
        self.lifecycle.begin_start()?;
        let request = ControlRequest::Start {
            worker_id: self.id,
            config: self.config.clone(),
        };
        if let Err(e) = self.link.send(&request) {
            self.lifecycle.finish(WorkerOutcome::Failed(e.to_string()));
            return Err(self.start_error(e.to_string()));
        }
        debug!(worker_id = self.id, pid = self.pid(), "Start dispatched");
        Ok(())
    }

    /// Release the bind barrier for this worker.
    pub fn serve(&mut self) -> Result<()> {
        if self.state() != WorkerState::Starting || !self.is_bound() || self.is_finished() {
            return Ok(());
        }
        self.link.send(&ControlRequest::Serve)
    }

    /// Ask the worker to stop serving. No-op unless it is running.
    pub fn stop(&mut self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        debug!(worker_id = self.id, pid = self.pid(), "Stop dispatched");
        self.link.send(&ControlRequest::Stop)
    }

    /// Tear the worker down. Runs once; later calls do nothing.
    pub fn destroy(&mut self) {
        if !self.lifecycle.destroy() {
            return;
        }
        let reason = self.link.shutdown(self.stop_timeout);
        let outcome = if reason.is_clean() {
            WorkerOutcome::Stopped
        } else {
            WorkerOutcome::Died(reason.to_string())
        };
        if self.lifecycle.finish(outcome) && !reason.is_clean() {
            warn!(worker_id = self.id, pid = self.pid(), reason = %reason, "Worker ended without reporting");
        }
        if reason.was_forced() {
            warn!(worker_id = self.id, pid = self.pid(), reason = %reason, "Worker had to be signalled");
        }
        debug!(worker_id = self.id, pid = self.pid(), reason = %reason, "Worker destroyed");
    }

    /// Apply an event reported by the worker.
    pub fn record(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::Ready { pid } => {
                debug!(worker_id = self.id, pid, "Worker ready");
            }
            WorkerEvent::Bound { addr } => {
                debug!(worker_id = self.id, pid = self.pid(), addr = %addr, "Listener bound");
                self.lifecycle.mark_bound();
            }
            WorkerEvent::Serving { addr } => {
                info!(worker_id = self.id, pid = self.pid(), addr = %addr, "Worker serving");
                self.lifecycle.mark_serving();
            }
            WorkerEvent::Stopped => {
                debug!(worker_id = self.id, pid = self.pid(), "Worker stopped");
                self.lifecycle.finish(WorkerOutcome::Stopped);
            }
            WorkerEvent::Failed { message } => {
                self.lifecycle.finish(WorkerOutcome::Failed(message.clone()));
            }
        }
    }

    /// The control channel closed. Counts as a death unless the worker
    /// already reported how it ended.
    pub fn disconnected(&mut self) {
        if self
            .lifecycle
            .finish(WorkerOutcome::Died("control channel closed".into()))
        {
            warn!(worker_id = self.id, pid = self.pid(), "Worker exited without reporting");
        }
    }
}

impl<L: WorkerLink> Drop for ServerWorker<L> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreParams;
    use std::sync::{Arc, Mutex};

    /// Link that records every request and shutdown.
    struct RecordingLink {
        log: Arc<Mutex<Vec<String>>>,
        fail_sends: bool,
    }

    impl WorkerLink for RecordingLink {
        fn pid(&self) -> i32 {
            4242
        }

        fn send(&mut self, request: &ControlRequest) -> Result<()> {
            if self.fail_sends {
                return Err(IngestError::Worker("broken pipe".into()));
            }
            let name = match request {
                ControlRequest::Start { .. } => "start",
                ControlRequest::Serve => "serve",
                ControlRequest::Stop => "stop",
                ControlRequest::Exit => "exit",
            };
            self.log.lock().unwrap().push(name.to_string());
            Ok(())
        }

        fn shutdown(&mut self, _timeout: Duration) -> TerminationReason {
            self.log.lock().unwrap().push("shutdown".to_string());
            TerminationReason::Exited(0)
        }
    }

    fn worker(fail_sends: bool) -> (ServerWorker<RecordingLink>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let link = RecordingLink {
            log: log.clone(),
            fail_sends,
        };
        let config = WorkerConfig {
            bind_address: "localhost:50051".into(),
            store: StoreParams::default(),
            ingest: Default::default(),
        };
        (
            ServerWorker::new(0, config, link, Duration::from_secs(1)),
            log,
        )
    }

    fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_serve_waits_for_bind() {
        let (mut w, log) = worker(false);
        w.start().unwrap();
        w.serve().unwrap();
        assert_eq!(entries(&log), vec!["start"]);

        w.record(&WorkerEvent::Bound {
            addr: "127.0.0.1:50051".into(),
        });
        w.serve().unwrap();
        assert_eq!(entries(&log), vec!["start", "serve"]);

        w.record(&WorkerEvent::Serving {
            addr: "127.0.0.1:50051".into(),
        });
        assert_eq!(w.state(), WorkerState::Serving);
    }

    #[test]
    fn test_stop_on_destroyed_worker_is_noop() {
        let (mut w, log) = worker(false);
        w.start().unwrap();
        w.destroy();
        assert_eq!(w.state(), WorkerState::Destroyed);

        w.stop().unwrap();
        assert_eq!(entries(&log), vec!["start", "shutdown"]);
    }

    #[test]
    fn test_destroy_runs_once() {
        let (mut w, log) = worker(false);
        w.destroy();
        w.destroy();
        drop(w);
        assert_eq!(entries(&log), vec!["shutdown"]);
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let (mut w, log) = worker(false);
        w.stop().unwrap();
        assert_eq!(w.state(), WorkerState::Created);
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn test_failed_send_marks_start_failure() {
        let (mut w, _log) = worker(true);
        let err = w.start().unwrap_err();
        assert!(matches!(
            err,
            IngestError::WorkerStart { pid: 4242, ref addr, .. } if addr == "localhost:50051"
        ));
        assert!(w.is_finished());
        assert!(w.outcome().unwrap().failure_reason().is_some());
    }

    #[test]
    fn test_reported_outcome_survives_disconnect_and_destroy() {
        let (mut w, _log) = worker(false);
        w.start().unwrap();
        w.record(&WorkerEvent::Stopped);
        w.disconnected();
        w.destroy();
        assert_eq!(w.outcome(), Some(&WorkerOutcome::Stopped));
    }

    #[test]
    fn test_disconnect_without_report_is_a_death() {
        let (mut w, _log) = worker(false);
        w.start().unwrap();
        w.disconnected();
        assert!(matches!(w.outcome(), Some(WorkerOutcome::Died(_))));
        w.stop().unwrap();
        assert_eq!(w.state(), WorkerState::Starting);
    }
}
