//! Supervisor for a pool of listener workers sharing one port.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │      Supervisor      │
//!                 │ reserve → spawn → run│
//!                 └──────────┬───────────┘
//!                            │ mpsc<PoolEvent>
//!            ┌───────────────┼───────────────┐
//!            │               │               │
//!      ┌─────▼─────┐   ┌─────▼─────┐   ┌─────▼─────┐
//!      │ Worker 0  │   │ Worker 1  │   │ Worker N  │
//!      │ (process) │   │ (process) │   │ (process) │
//!      │ :50051    │   │ :50051    │   │ :50051    │
//!      └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! Every worker binds the same address; the kernel spreads connections
//! across them. The supervisor only drives lifecycles:
//!
//! 1. Spawn every worker and wait for each to report ready.
//! 2. Dispatch `start` to all of them before waiting on any.
//! 3. Once every live worker has bound its listener, tell all of them to
//!    serve.
//! 4. On interrupt, stop every worker. Destroy all of them on the way out,
//!    whatever happened.

use super::handle::{PoolEvent, ServerWorker, WorkerLink};
use super::protocol::{WorkerConfig, WorkerEvent};
use super::spawn::{ProcessLink, WorkerCommand};
use crate::error::{IngestError, Result};
use crate::reserve::{DEFAULT_PORT, ReservedPort, reserve_port};
use crate::service::IngestOptions;
use crate::store::StoreParams;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Default number of workers when shared binding is available.
pub const DEFAULT_WORKERS: usize = 2;

/// Configuration for one supervisor run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Host every worker binds.
    pub host: String,
    /// Port to reserve. `0` picks an ephemeral port.
    pub port: u16,
    /// Workers to run when shared binding is supported.
    pub worker_count: usize,
    pub store: StoreParams,
    pub ingest: IngestOptions,
    /// How long each spawned worker has to report ready.
    pub ready_timeout: Duration,
    /// How long a worker has to exit before it is signalled.
    pub stop_timeout: Duration,
    /// Extra environment for worker processes.
    pub worker_env: Vec<(String, String)>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            worker_count: DEFAULT_WORKERS,
            store: StoreParams::default(),
            ingest: IngestOptions::default(),
            ready_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            worker_env: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(IngestError::Config("worker count must be at least 1".into()));
        }
        if self.host.trim().is_empty() {
            return Err(IngestError::Config("host must not be empty".into()));
        }
        if self.store.retry.attempts == 0 {
            return Err(IngestError::Config(
                "store connect attempts must be at least 1".into(),
            ));
        }
        if self.ingest.list_key.is_empty() {
            return Err(IngestError::Config("list key must not be empty".into()));
        }
        if self.ingest.max_batch == 0 {
            return Err(IngestError::Config("max batch must be at least 1".into()));
        }
        Ok(())
    }

    /// `host:port` for the workers, bracketing IPv6 literals.
    pub fn bind_address(&self, port: u16) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }

    fn worker_config(&self, port: u16) -> WorkerConfig {
        WorkerConfig {
            bind_address: self.bind_address(port),
            store: self.store.clone(),
            ingest: self.ingest.clone(),
        }
    }
}

/// What happened during a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub port: u16,
    pub pool_size: usize,
    /// The run ended because of Ctrl-C / SIGTERM.
    pub interrupted: bool,
    /// Workers that failed to start or died, with the reason.
    pub failures: Vec<(usize, String)>,
}

impl RunSummary {
    /// Whether no worker ever got past startup.
    pub fn all_failed(&self) -> bool {
        self.pool_size > 0 && self.failures.len() == self.pool_size
    }
}

/// Produces the link for each pool slot.
pub trait WorkerSpawner {
    type Link: WorkerLink;

    /// Launch worker `id`, forwarding its events to `events`.
    fn spawn(&mut self, id: usize, events: &Sender<PoolEvent>) -> Result<Self::Link>;
}

/// Spawns real worker processes.
pub struct ProcessSpawner {
    command: WorkerCommand,
}

impl ProcessSpawner {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

impl WorkerSpawner for ProcessSpawner {
    type Link = ProcessLink;

    fn spawn(&mut self, id: usize, events: &Sender<PoolEvent>) -> Result<ProcessLink> {
        ProcessLink::spawn(id, &self.command, events)
    }
}

/// The constructed workers. Dropping the pool destroys every worker.
struct WorkerPool<L: WorkerLink> {
    workers: Vec<ServerWorker<L>>,
}

impl<L: WorkerLink> WorkerPool<L> {
    /// Spawn `size` workers. On failure the already-spawned ones are
    /// destroyed when the partial pool drops.
    fn spawn<S>(
        spawner: &mut S,
        size: usize,
        config: &WorkerConfig,
        stop_timeout: Duration,
        events: &Sender<PoolEvent>,
    ) -> Result<Self>
    where
        S: WorkerSpawner<Link = L>,
    {
        let mut pool = Self {
            workers: Vec::with_capacity(size),
        };
        for id in 0..size {
            let link = spawner.spawn(id, events)?;
            pool.workers
                .push(ServerWorker::new(id, config.clone(), link, stop_timeout));
        }
        Ok(pool)
    }

    fn all_finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }

    /// Every worker that can still serve has bound its listener.
    fn all_bound(&self) -> bool {
        self.workers.iter().all(|w| w.is_bound() || w.is_finished())
    }

    fn stop_all(&mut self) {
        for worker in &mut self.workers {
            if let Err(e) = worker.stop() {
                warn!(worker_id = worker.id(), pid = worker.pid(), error = %e, "Failed to stop worker");
            }
        }
    }

    fn destroy_all(&mut self) {
        for worker in &mut self.workers {
            worker.destroy();
        }
    }
}

impl<L: WorkerLink> Drop for WorkerPool<L> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

/// Reserve the configured port, then run a pool of worker processes until
/// they all finish or the process is interrupted.
pub fn run(config: &SupervisorConfig) -> Result<RunSummary> {
    config.validate()?;
    let reserved = reserve_port(config.port)?;

    let (tx, rx) = mpsc::channel();
    let interrupt = tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt.send(PoolEvent::Interrupt);
    })
    .map_err(|e| IngestError::Worker(format!("Failed to install interrupt handler: {}", e)))?;

    let mut command = WorkerCommand::current_exe()?;
    command.env.extend(config.worker_env.iter().cloned());
    let mut spawner = ProcessSpawner::new(command);
    run_with(config, reserved, &mut spawner, tx, rx)
}

/// Run a pool on an already reserved port.
#[instrument(level = "debug", skip_all, fields(port = reserved.port))]
pub fn run_with<S: WorkerSpawner>(
    config: &SupervisorConfig,
    reserved: ReservedPort,
    spawner: &mut S,
    events: Sender<PoolEvent>,
    inbox: Receiver<PoolEvent>,
) -> Result<RunSummary> {
    let size = reserved.pool_size(config.worker_count);
    let worker_config = config.worker_config(reserved.port);
    let mut summary = RunSummary {
        port: reserved.port,
        pool_size: size,
        ..Default::default()
    };

    info!(
        workers = size,
        addr = %worker_config.bind_address,
        shared_binding = reserved.shared_binding_supported,
        "Starting worker pool"
    );

    let mut pool = WorkerPool::spawn(spawner, size, &worker_config, config.stop_timeout, &events)?;
    // Only monitors and the interrupt handler hold senders from here on.
    drop(events);

    if !wait_ready(&mut pool, &inbox, config.ready_timeout)? {
        info!("Interrupted before workers were ready");
        summary.interrupted = true;
        return Ok(summary);
    }

    for worker in &mut pool.workers {
        if let Err(e) = worker.start() {
            error!(worker_id = worker.id(), pid = worker.pid(), addr = worker.bind_address(), error = %e, "Worker failed to start");
        }
    }

    let mut released = false;
    // Set once workers have been told to stop; they get `stop_timeout` to
    // finish before being destroyed regardless.
    let mut stop_deadline: Option<Instant> = None;
    while !pool.all_finished() {
        if !released && pool.all_bound() {
            for worker in &mut pool.workers {
                if let Err(e) = worker.serve() {
                    warn!(worker_id = worker.id(), error = %e, "Failed to release worker");
                }
            }
            released = true;
            info!(workers = size, "All workers bound, serving");
        }

        let received = match stop_deadline {
            Some(deadline) => {
                inbox.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(PoolEvent::Worker { id, event }) => {
                let Some(worker) = pool.workers.get_mut(id) else {
                    continue;
                };
                worker.record(&event);
                if let WorkerEvent::Failed { message } = &event {
                    let err = worker.start_error(message.as_str());
                    error!(worker_id = id, pid = worker.pid(), addr = worker.bind_address(), error = %err, "Worker failed");
                }
            }
            Ok(PoolEvent::Disconnected { id }) => {
                if let Some(worker) = pool.workers.get_mut(id) {
                    worker.disconnected();
                }
            }
            Ok(PoolEvent::Interrupt) => {
                if summary.interrupted {
                    warn!("Second interrupt, destroying workers now");
                    break;
                }
                info!("Interrupt received, stopping workers");
                summary.interrupted = true;
                pool.stop_all();
                stop_deadline.get_or_insert_with(|| Instant::now() + config.stop_timeout);
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = config.stop_timeout.as_millis() as u64,
                    "Workers did not stop in time, destroying them"
                );
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Event channel closed, stopping workers");
                pool.stop_all();
                break;
            }
        }
    }

    pool.destroy_all();
    summary.failures = pool
        .workers
        .iter()
        .filter_map(|w| {
            let reason = w.outcome()?.failure_reason()?;
            Some((w.id(), reason.to_string()))
        })
        .collect();

    info!(
        workers = size,
        failures = summary.failures.len(),
        interrupted = summary.interrupted,
        "Worker pool shut down"
    );
    Ok(summary)
}

/// Wait until every worker reported ready. Returns `false` on interrupt.
fn wait_ready<L: WorkerLink>(
    pool: &mut WorkerPool<L>,
    inbox: &Receiver<PoolEvent>,
    timeout: Duration,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut ready = vec![false; pool.workers.len()];

    while ready.iter().any(|r| !r) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match inbox.recv_timeout(remaining) {
            Ok(PoolEvent::Worker { id, event }) => {
                if let Some(worker) = pool.workers.get_mut(id) {
                    worker.record(&event);
                    if matches!(event, WorkerEvent::Ready { .. }) {
                        ready[id] = true;
                    }
                }
            }
            Ok(PoolEvent::Disconnected { id }) => {
                return Err(IngestError::Worker(format!(
                    "Worker {} exited before reporting ready",
                    id
                )));
            }
            Ok(PoolEvent::Interrupt) => return Ok(false),
            Err(RecvTimeoutError::Timeout) => {
                let pending = ready.iter().filter(|r| !**r).count();
                return Err(IngestError::Worker(format!(
                    "{} worker(s) not ready after {:?}",
                    pending, timeout
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(IngestError::Worker("Event channel closed".into()));
            }
        }
    }
    Ok(true)
}
