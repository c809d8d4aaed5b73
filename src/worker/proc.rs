//! Process handle for worker subprocesses.
//!
//! Wraps a child process together with the supervisor's end of its control
//! channel.

use super::channel::{MessageReader, MessageWriter, PipeFd};
use super::protocol::{ControlRequest, WorkerEvent};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{IngestError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::OwnedFd;
use std::time::{Duration, Instant};

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Interval between non-blocking exit checks.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a worker subprocess.
pub struct Proc {
    pid: Pid,
    /// Requests to the worker's stdin.
    writer: MessageWriter<ControlRequest>,
    /// Events from the worker's stdout; handed to the monitor thread.
    reader: Option<MessageReader<WorkerEvent>>,
    /// Exit status once reaped.
    status: Option<WaitStatus>,
}

impl Proc {
    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's stdin and stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IngestError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IngestError::Worker("Child stdout not captured".into()))?;

        Ok(Self {
            pid,
            writer: MessageWriter::new(PipeFd::new(OwnedFd::from(stdin))),
            reader: Some(MessageReader::new(PipeFd::new(OwnedFd::from(stdout)))),
            status: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send a request to the worker.
    pub fn send(&mut self, request: &ControlRequest) -> Result<()> {
        self.writer
            .send(request)
            .map_err(|e| IngestError::Worker(format!("Failed to send to worker: {}", e)))
    }

    /// Take the event reader. Returns `None` after the first call.
    pub fn take_reader(&mut self) -> Option<MessageReader<WorkerEvent>> {
        self.reader.take()
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Try to reap the process (non-blocking).
    ///
    /// Returns `None` if the process is still running. Once reaped, the
    /// stored status is returned on every later call.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(e) => Err(IngestError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        match waitpid(self.pid, None) {
            Ok(status) => {
                self.status = Some(status);
                Ok(status)
            }
            Err(e) => Err(IngestError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// How the process ended, if it has been reaped.
    pub fn termination(&self) -> Option<TerminationReason> {
        self.status.map(analyze_wait_status)
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| IngestError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| IngestError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }

    /// Poll for exit until `timeout` elapses.
    fn wait_timeout(&mut self, timeout: Duration) -> Option<WaitStatus> {
        let start = Instant::now();
        loop {
            if let Ok(Some(status)) = self.try_wait() {
                return Some(status);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Stop the worker: send `Exit`, wait up to `timeout`, then SIGTERM,
    /// then SIGKILL. Always leaves the process reaped.
    pub fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        if let Some(status) = self.status {
            return Ok(analyze_wait_status(status));
        }

        // The worker may already be gone; escalation below still reaps it.
        let _ = self.send(&ControlRequest::Exit);
        if let Some(status) = self.wait_timeout(timeout) {
            return Ok(analyze_wait_status(status));
        }

        tracing::warn!(
            pid = self.pid.as_raw(),
            timeout_ms = timeout.as_millis() as u64,
            "Worker did not exit in time, sending SIGTERM"
        );
        self.terminate()?;
        if let Some(status) = self.wait_timeout(TERM_GRACE) {
            return Ok(analyze_wait_status(status));
        }

        tracing::warn!(pid = self.pid.as_raw(), "Worker ignored SIGTERM, sending SIGKILL");
        self.kill()?;
        Ok(self
            .termination()
            .unwrap_or(TerminationReason::Unknown))
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.terminate();
            std::thread::sleep(POLL_INTERVAL);

            if let Ok(Some(_)) = self.try_wait() {
                return;
            }

            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}
