//! Worker subprocess spawning.
//!
//! Uses `posix_spawn` via `std::process::Command`. Each worker gets a
//! monitor thread that forwards its events to the supervisor.

use super::channel::MessageReader;
use super::handle::{PoolEvent, WorkerLink};
use super::proc::Proc;
use super::protocol::{ControlRequest, WorkerEvent};
use super::signals::TerminationReason;
use crate::error::{IngestError, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;

/// Stack size for monitor threads. They only parse small JSON lines.
const MONITOR_STACK_SIZE: usize = 256 * 1024;

/// Command line used to launch a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Added to the inherited environment.
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Re-execute the running binary in worker mode.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| {
            IngestError::Worker(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self {
            program,
            args: vec!["serve".into(), "--internal-worker".into()],
            env: Vec::new(),
        })
    }
}

/// Spawn a worker subprocess with piped control channels.
pub fn spawn_worker(command: &WorkerCommand) -> Result<Proc> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    cmd.envs(command.env.iter().map(|(k, v)| (k, v)));

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit()); // Worker logs go to the parent's stderr

    let child = cmd
        .spawn()
        .map_err(|e| IngestError::Worker(format!("Failed to spawn worker: {}", e)))?;

    Proc::from_child(child)
}

/// Forward every event from `reader` until the worker closes its stdout.
fn forward_events(id: usize, mut reader: MessageReader<WorkerEvent>, events: Sender<PoolEvent>) {
    loop {
        match reader.recv() {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    tracing::debug!(worker_id = id, event = ?event, "Worker reported its final event");
                }
                if events.send(PoolEvent::Worker { id, event }).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(IngestError::Io(e)) => {
                tracing::warn!(worker_id = id, error = %e, "Worker event pipe failed");
                break;
            }
            Err(e) => {
                tracing::warn!(worker_id = id, error = %e, "Ignoring malformed worker message");
            }
        }
    }
    let _ = events.send(PoolEvent::Disconnected { id });
}

/// Link to a real worker process.
pub struct ProcessLink {
    proc: Proc,
    monitor: Option<JoinHandle<()>>,
}

impl ProcessLink {
    /// Spawn a worker and start forwarding its events.
    pub fn spawn(id: usize, command: &WorkerCommand, events: &Sender<PoolEvent>) -> Result<Self> {
        let mut proc = spawn_worker(command)?;
        let reader = proc
            .take_reader()
            .ok_or_else(|| IngestError::Worker("Worker stdout already taken".into()))?;

        let events = events.clone();
        let monitor = std::thread::Builder::new()
            .name(format!("worker-{}-monitor", id))
            .stack_size(MONITOR_STACK_SIZE)
            .spawn(move || forward_events(id, reader, events))?;

        tracing::debug!(worker_id = id, pid = proc.pid().as_raw(), "Worker spawned");
        Ok(Self {
            proc,
            monitor: Some(monitor),
        })
    }
}

impl WorkerLink for ProcessLink {
    fn pid(&self) -> i32 {
        self.proc.pid().as_raw()
    }

    fn send(&mut self, request: &ControlRequest) -> Result<()> {
        self.proc.send(request)
    }

    fn shutdown(&mut self, timeout: Duration) -> TerminationReason {
        let reason = match self.proc.stop(timeout) {
            Ok(reason) => reason,
            Err(e) => {
                tracing::warn!(pid = self.pid(), error = %e, "Failed to stop worker");
                TerminationReason::Unknown
            }
        };
        // stdout closes with the process, so the monitor is about to finish.
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                tracing::warn!(pid = self.pid(), "Worker monitor thread panicked");
            }
        }
        reason
    }
}
