//! ingestd - log ingestion listener with a process-per-worker pool

mod cli;
mod error;
mod logging;
mod net;
mod reserve;
mod service;
mod store;
mod worker;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, Commands, ProbeFormat};
use logging::LogConfig;

/// Program entry point: parses CLI arguments, sets up logging, dispatches
/// the selected command, and prints the error chain on failure before
/// exiting with status code 1.
fn main() {
    let cli = Cli::parse();

    let log_config = log_config(&cli);
    logging::init(log_config.clone());
    let _span = tracing::info_span!("ingestd", pid = std::process::id()).entered();

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(args, &log_config),
        Commands::Probe(args) => cmd_probe(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Combine the global flags with environment overrides.
fn log_config(cli: &Cli) -> LogConfig {
    let mut config = LogConfig::from_verbosity(cli.verbose, cli.quiet).with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    config
}

/// Run the worker pool, or a single worker when invoked by the supervisor.
fn cmd_serve(args: &cli::ServeArgs, log_config: &LogConfig) -> Result<()> {
    if args.internal_worker {
        worker::run_worker_main();
    }

    let mut config = args.to_config();
    config.worker_env = log_config.worker_env();

    let summary = worker::run(&config)?;
    for (id, reason) in &summary.failures {
        tracing::warn!(worker_id = id, reason = %reason, "Worker did not shut down cleanly");
    }
    if summary.all_failed() {
        let first = summary
            .failures
            .first()
            .map_or("unknown", |(_, reason)| reason.as_str());
        anyhow::bail!(
            "All {} workers on port {} failed: {}",
            summary.pool_size,
            summary.port,
            first
        );
    }
    Ok(())
}

/// Reserve a port, release it, and report what was found.
fn cmd_probe(args: &cli::ProbeArgs) -> Result<()> {
    let reserved = reserve::reserve_port(args.port)?;
    match args.format {
        ProbeFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&reserved)?);
        }
        ProbeFormat::Text => {
            let sharing = if reserved.shared_binding_supported {
                "supported".if_supports_color(owo_colors::Stream::Stdout, |t| t.green()).to_string()
            } else {
                "unsupported".if_supports_color(owo_colors::Stream::Stdout, |t| t.yellow()).to_string()
            };
            println!("Port:            {}", reserved.port);
            println!("Shared binding:  {}", sharing);
            println!(
                "Pool size:       {} (for {} requested)",
                reserved.pool_size(worker::DEFAULT_WORKERS),
                worker::DEFAULT_WORKERS
            );
        }
    }
    Ok(())
}
