//! Worker subprocess main entry point.
//!
//! This module runs when `ingestd serve --internal-worker` is invoked. The
//! process talks to its supervisor over stdin/stdout, owns one listener and
//! one store connection, and serves requests on a single-threaded runtime.

use super::channel::{MessageReader, MessageWriter, PipeFd};
use super::protocol::{ControlRequest, WorkerConfig, WorkerEvent};
use crate::error::{IngestError, Result};
use crate::net;
use crate::service::{LogIngestService, ServiceHandler};
use crate::store::{StoreClient, StoreConnection};
use nix::sys::signal::{self, SigHandler, Signal};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};

/// How long a stopping worker waits for its store connection to close.
const STORE_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the worker subprocess main function. Never returns.
pub fn run_worker_main() -> ! {
    // The supervisor owns Ctrl-C; pipe errors surface as io::Error.
    ignore_signal(Signal::SIGINT);
    ignore_signal(Signal::SIGPIPE);

    // Safety: file descriptors 0 and 1 are always valid for stdin/stdout
    let reader = MessageReader::new(unsafe { PipeFd::from_raw(0) });
    let writer = MessageWriter::new(unsafe { PipeFd::from_raw(1) });

    match worker_loop(reader, writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "Worker failed");
            std::process::exit(1);
        }
    }
}

fn ignore_signal(sig: Signal) {
    // Safety: SIG_IGN installs no handler code.
    if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigIgn) } {
        warn!(signal = sig.as_str(), error = %e, "Failed to ignore signal");
    }
}

fn worker_loop(
    mut reader: MessageReader<ControlRequest>,
    mut writer: MessageWriter<WorkerEvent>,
) -> Result<()> {
    writer.send(&WorkerEvent::Ready {
        pid: std::process::id(),
    })?;

    let (worker_id, config) = loop {
        match reader.recv() {
            Ok(Some(ControlRequest::Start { worker_id, config })) => break (worker_id, config),
            Ok(Some(ControlRequest::Stop | ControlRequest::Exit)) | Ok(None) => return Ok(()),
            Ok(Some(ControlRequest::Serve)) => warn!("Serve received before start, ignoring"),
            Err(e @ IngestError::Io(_)) => return Err(e),
            Err(e) => warn!(error = %e, "Ignoring malformed control message"),
        }
    };

    let span = tracing::info_span!("worker", worker_id, addr = %config.bind_address);
    let _enter = span.enter();

    let control = spawn_control_reader(reader)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let service = LogIngestService::new(worker_id, config.ingest.clone());
    match runtime.block_on(serve_worker(config, &service, &mut writer, control)) {
        Ok(()) => {
            writer.send(&WorkerEvent::Stopped)?;
            Ok(())
        }
        Err(e) => {
            let _ = writer.send(&WorkerEvent::failed(e.to_string()));
            Err(e)
        }
    }
}

/// Move blocking stdin reads onto their own thread.
fn spawn_control_reader(
    mut reader: MessageReader<ControlRequest>,
) -> Result<UnboundedReceiver<ControlRequest>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("control-reader".into())
        .spawn(move || {
            loop {
                match reader.recv() {
                    Ok(Some(request)) => {
                        if tx.send(request).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(IngestError::Io(e)) => {
                        warn!(error = %e, "Control pipe failed");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed control message"),
                }
            }
        })?;
    Ok(rx)
}

/// Resolve once the supervisor asks to stop or goes away.
async fn wait_for_stop(control: &mut UnboundedReceiver<ControlRequest>) {
    loop {
        match control.recv().await {
            Some(ControlRequest::Stop | ControlRequest::Exit) | None => return,
            Some(other) => debug!(request = ?other, "Ignoring control request"),
        }
    }
}

/// Wait for the bind barrier. Returns `false` if told to stop instead.
async fn wait_for_serve(control: &mut UnboundedReceiver<ControlRequest>) -> bool {
    loop {
        match control.recv().await {
            Some(ControlRequest::Serve) => return true,
            Some(ControlRequest::Stop | ControlRequest::Exit) | None => return false,
            Some(other) => debug!(request = ?other, "Ignoring control request"),
        }
    }
}

/// Connect the store, bind, wait for the barrier, then serve until stopped.
///
/// `Bound` and `Serving` are reported through `events`; the final
/// `Stopped`/`Failed` is left to the caller.
async fn serve_worker<H: ServiceHandler>(
    config: WorkerConfig,
    service: &H,
    events: &mut MessageWriter<WorkerEvent>,
    mut control: UnboundedReceiver<ControlRequest>,
) -> Result<()> {
    let store = tokio::select! {
        conn = StoreConnection::connect(&config.store) => conn?,
        () = wait_for_stop(&mut control) => {
            info!("Stopped while connecting to store");
            return Ok(());
        }
    };
    debug!(endpoint = store.endpoint(), "Store connected");

    let listener = net::bind_shared(&config.bind_address).map_err(|e| {
        IngestError::Worker(format!("Failed to bind {}: {}", config.bind_address, e))
    })?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let addr = listener.local_addr()?.to_string();
    events.send(&WorkerEvent::Bound { addr: addr.clone() })?;

    if !wait_for_serve(&mut control).await {
        info!("Stopped before serving");
        let _ = store.close().await;
        return Ok(());
    }

    let (store, store_task) = StoreClient::spawn(store);
    let router = service.router(store.clone());
    events.send(&WorkerEvent::Serving { addr: addr.clone() })?;
    info!(addr = %addr, "Accepting connections");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { wait_for_stop(&mut control).await })
        .await?;
    info!("Listener closed");

    // The connection task closes the store once the last client is gone.
    drop(store);
    match tokio::time::timeout(STORE_CLOSE_TIMEOUT, store_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Store connection task failed"),
        Err(_) => debug!("Store connection still in use, dropping"),
    }
    Ok(())
}
