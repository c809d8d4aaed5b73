//! Command-line interface definitions using clap.

use crate::logging::LogFormat;
use crate::reserve::DEFAULT_PORT;
use crate::service::{DEFAULT_LIST_KEY, DEFAULT_MAX_BATCH, IngestOptions};
use crate::store::{DEFAULT_STORE_PORT, RetryPolicy, StoreParams};
use crate::worker::{DEFAULT_WORKERS, SupervisorConfig};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Log ingestion listener running a pool of worker processes on one port.
#[derive(Parser, Debug)]
#[command(name = "ingestd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, global = true, value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the worker pool.
    Serve(ServeArgs),

    /// Reserve a port and report whether it can be shared.
    Probe(ProbeArgs),
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Host every worker binds.
    #[arg(long, env = "INGESTD_HOST", default_value = "localhost")]
    pub host: String,

    /// Port to share (0 picks a free one).
    #[arg(short, long, env = "INGESTD_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Worker processes when the port can be shared.
    #[arg(short, long, env = "INGESTD_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Backing store host.
    #[arg(long, env = "INGESTD_STORE_HOST", default_value = "localhost")]
    pub store_host: String,

    /// Backing store port.
    #[arg(long, env = "INGESTD_STORE_PORT", default_value_t = DEFAULT_STORE_PORT)]
    pub store_port: u16,

    /// Backing store username (ACL auth).
    #[arg(long, env = "INGESTD_STORE_USERNAME")]
    pub store_username: Option<String>,

    /// Backing store password.
    #[arg(long, env = "INGESTD_STORE_PASSWORD", hide_env_values = true)]
    pub store_password: Option<String>,

    /// Attempts when connecting to the store times out.
    #[arg(long, env = "INGESTD_STORE_ATTEMPTS", default_value_t = 3)]
    pub store_attempts: u32,

    /// Store list receiving records.
    #[arg(long, env = "INGESTD_LIST_KEY", default_value = DEFAULT_LIST_KEY)]
    pub list_key: String,

    /// Maximum records per request.
    #[arg(long, env = "INGESTD_MAX_BATCH", default_value_t = DEFAULT_MAX_BATCH)]
    pub max_batch: usize,

    /// Seconds a worker gets to exit before it is signalled.
    #[arg(long, env = "INGESTD_STOP_TIMEOUT", default_value_t = 10)]
    pub stop_timeout: u64,

    /// Seconds a spawned worker gets to report ready.
    #[arg(long, env = "INGESTD_READY_TIMEOUT", default_value_t = 30)]
    pub ready_timeout: u64,

    /// Run as a pool worker (internal use).
    #[arg(long, hide = true)]
    pub internal_worker: bool,
}

impl ServeArgs {
    /// Build the supervisor configuration.
    pub fn to_config(&self) -> SupervisorConfig {
        let store = StoreParams {
            username: self.store_username.clone(),
            password: self.store_password.clone(),
            retry: RetryPolicy {
                attempts: self.store_attempts,
                ..Default::default()
            },
            ..StoreParams::new(self.store_host.clone(), self.store_port)
        };

        SupervisorConfig {
            host: self.host.clone(),
            port: self.port,
            worker_count: self.workers,
            store,
            ingest: IngestOptions {
                list_key: self.list_key.clone(),
                max_batch: self.max_batch,
            },
            ready_timeout: Duration::from_secs(self.ready_timeout),
            stop_timeout: Duration::from_secs(self.stop_timeout),
            worker_env: Vec::new(),
        }
    }
}

/// Arguments for the probe command.
#[derive(Parser, Debug)]
pub struct ProbeArgs {
    /// Port to probe (0 picks a free one).
    #[arg(short, long, env = "INGESTD_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = ProbeFormat::Text)]
    pub format: ProbeFormat,
}

/// Output format for probe results.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProbeFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// JSON object.
    Json,
}
