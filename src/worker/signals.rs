//! Exit-status analysis for worker processes.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Exited on its own with a status code.
    Exited(i32),
    /// Killed with SIGKILL (by the supervisor's escalation or the OOM killer).
    Killed,
    /// Terminated by SIGTERM or SIGINT.
    Interrupted(Signal),
    /// Crashed: SIGSEGV, SIGBUS, SIGABRT or SIGILL.
    Crashed(Signal),
    /// Any other signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Exit status could not be determined.
    Unknown,
}

impl TerminationReason {
    /// Whether the process exited with status 0.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether the process had to be killed rather than exiting by itself.
    pub fn was_forced(&self) -> bool {
        matches!(self, Self::Killed | Self::Interrupted(_))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Killed => write!(f, "killed (SIGKILL)"),
            Self::Interrupted(sig) => write!(f, "terminated by {}", sig.as_str()),
            Self::Crashed(sig) => write!(f, "crashed with {}", sig.as_str()),
            Self::Signaled(sig) => write!(f, "killed by signal {}", sig.as_str()),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Classify a `WaitStatus`.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGTERM | Signal::SIGINT => TerminationReason::Interrupted(signal),
            Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT | Signal::SIGILL => {
                TerminationReason::Crashed(signal)
            }
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
