//! Worker lifecycle bookkeeping.
//!
//! ```text
//! Created ──start──▶ Starting ──serving──▶ Serving
//!                       │                     │
//!                       └───────stop──────────┴──▶ Stopping
//!
//! any ──destroy──▶ Destroyed
//! ```
//!
//! How the worker's serving loop ended is tracked separately as a
//! [`WorkerOutcome`], since a worker can fail while still `Starting`.

use crate::error::{IngestError, Result};
use std::fmt;

/// Supervisor-side view of a worker's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Starting,
    Serving,
    Stopping,
    Destroyed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::Stopping => "stopping",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// How a worker's serving loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Stopped cleanly.
    Stopped,
    /// Reported a startup or serving failure.
    Failed(String),
    /// Went away without a final report.
    Died(String),
}

impl WorkerOutcome {
    /// Why the worker did not stop cleanly, if it didn't.
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Stopped => None,
            Self::Failed(reason) | Self::Died(reason) => Some(reason),
        }
    }
}

/// Lifecycle of one worker.
#[derive(Debug)]
pub struct Lifecycle {
    worker_id: usize,
    state: WorkerState,
    bound: bool,
    outcome: Option<WorkerOutcome>,
}

impl Lifecycle {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            state: WorkerState::Created,
            bound: false,
            outcome: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn outcome(&self) -> Option<&WorkerOutcome> {
        self.outcome.as_ref()
    }

    /// Whether the worker's listener is bound.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Whether the serving loop has ended.
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Created → Starting.
    pub fn begin_start(&mut self) -> Result<()> {
        if self.state != WorkerState::Created {
            return Err(IngestError::InvalidTransition {
                worker_id: self.worker_id,
                from: self.state.to_string(),
                action: "start",
            });
        }
        self.state = WorkerState::Starting;
        Ok(())
    }

    /// Record that the listener is bound.
    pub fn mark_bound(&mut self) {
        if matches!(self.state, WorkerState::Starting | WorkerState::Serving) {
            self.bound = true;
        }
    }

    /// Starting → Serving.
    pub fn mark_serving(&mut self) {
        if self.state == WorkerState::Starting {
            self.bound = true;
            self.state = WorkerState::Serving;
        }
    }

    /// Starting|Serving → Stopping.
    ///
    /// Returns `false` when there is nothing to stop.
    pub fn begin_stop(&mut self) -> bool {
        if self.is_finished() {
            return false;
        }
        match self.state {
            WorkerState::Starting | WorkerState::Serving => {
                self.state = WorkerState::Stopping;
                true
            }
            _ => false,
        }
    }

    /// Record how the serving loop ended. The first outcome wins.
    pub fn finish(&mut self, outcome: WorkerOutcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Any → Destroyed. Returns `true` only on the first call.
    pub fn destroy(&mut self) -> bool {
        if self.state == WorkerState::Destroyed {
            return false;
        }
        self.state = WorkerState::Destroyed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lc = Lifecycle::new(0);
        assert_eq!(lc.state(), WorkerState::Created);

        lc.begin_start().unwrap();
        assert_eq!(lc.state(), WorkerState::Starting);
        assert!(!lc.is_bound());

        lc.mark_bound();
        assert!(lc.is_bound());
        lc.mark_serving();
        assert_eq!(lc.state(), WorkerState::Serving);

        assert!(lc.begin_stop());
        assert_eq!(lc.state(), WorkerState::Stopping);
        assert!(lc.finish(WorkerOutcome::Stopped));
        assert!(lc.destroy());
        assert_eq!(lc.state(), WorkerState::Destroyed);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut lc = Lifecycle::new(4);
        lc.begin_start().unwrap();
        let err = lc.begin_start().unwrap_err();
        assert_eq!(err.to_string(), "Worker 4 cannot start while starting");
    }

    #[test]
    fn test_stop_is_a_noop_outside_running_states() {
        let mut lc = Lifecycle::new(0);
        assert!(!lc.begin_stop());
        assert_eq!(lc.state(), WorkerState::Created);

        lc.begin_start().unwrap();
        assert!(lc.begin_stop());
        assert!(!lc.begin_stop());

        lc.destroy();
        assert!(!lc.begin_stop());
        assert_eq!(lc.state(), WorkerState::Destroyed);
    }

    #[test]
    fn test_stop_after_failure_is_a_noop() {
        let mut lc = Lifecycle::new(0);
        lc.begin_start().unwrap();
        lc.finish(WorkerOutcome::Failed("bind".into()));
        assert!(!lc.begin_stop());
        assert_eq!(lc.state(), WorkerState::Starting);
    }

    #[test]
    fn test_first_outcome_wins() {
        let mut lc = Lifecycle::new(0);
        assert!(lc.finish(WorkerOutcome::Failed("store".into())));
        assert!(!lc.finish(WorkerOutcome::Stopped));
        assert_eq!(lc.outcome(), Some(&WorkerOutcome::Failed("store".into())));
        assert_eq!(lc.outcome().and_then(|o| o.failure_reason()), Some("store"));
        assert_eq!(WorkerOutcome::Stopped.failure_reason(), None);
    }

    #[test]
    fn test_destroy_once() {
        let mut lc = Lifecycle::new(0);
        assert!(lc.destroy());
        assert!(!lc.destroy());
        assert!(lc.begin_start().is_err());
    }

    #[test]
    fn test_bound_only_counts_after_start() {
        let mut lc = Lifecycle::new(0);
        lc.mark_bound();
        assert!(!lc.is_bound());
    }
}
