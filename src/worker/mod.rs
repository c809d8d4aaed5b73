//! Process-per-worker listener pool.
//!
//! The supervisor spawns N copies of the running binary in
//! `--internal-worker` mode. Each one owns a listener bound to the same
//! address with `SO_REUSEPORT`, a store connection, and a single-threaded
//! runtime serving the ingestion service.
//!
//! # Features
//!
//! - **Process isolation**: a crashed worker takes down only its own listener
//! - **Bind barrier**: no worker accepts traffic until every worker has bound
//! - **All-or-nothing shutdown**: every spawned worker is destroyed exactly once

mod channel;
mod handle;
mod pool;
mod proc;
mod protocol;
mod signals;
mod spawn;
mod state;
pub mod worker_main;

pub use pool::{DEFAULT_WORKERS, SupervisorConfig, run};
pub use worker_main::run_worker_main;
