//! Port reservation.
//!
//! Before any worker is spawned the supervisor binds a short-lived probe
//! socket to find out which port the pool will use and whether the kernel
//! lets several processes bind it at once. The probe is released before
//! returning so the workers can bind the real listeners.

use crate::error::{IngestError, Result};
use crate::net::{request_shared_binding, tcp_socket};
use serde::Serialize;
use socket2::{Domain, SockAddr, Socket};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Well-known port the ingestion listener binds by default.
pub const DEFAULT_PORT: u16 = 50051;

/// Outcome of a port reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReservedPort {
    /// Port number every worker will bind.
    pub port: u16,
    /// Whether the kernel accepted the shared-binding option on the probe.
    pub shared_binding_supported: bool,
}

impl ReservedPort {
    /// Number of workers a pool may run on this reservation.
    ///
    /// Without shared binding only one process can own the port.
    pub fn pool_size(&self, configured: usize) -> usize {
        if self.shared_binding_supported {
            configured.max(1)
        } else {
            1
        }
    }
}

/// Probe socket that is closed when dropped.
struct ProbeSocket {
    socket: Socket,
    wildcard: SocketAddr,
}

impl ProbeSocket {
    /// Open a socket on the IPv6 wildcard, falling back to IPv4.
    fn open(port: u16) -> std::io::Result<Self> {
        let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        match tcp_socket(Domain::IPV6) {
            Ok(socket) => Ok(Self {
                socket,
                wildcard: v6,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "IPv6 unavailable, probing on IPv4 wildcard");
                Ok(Self {
                    socket: tcp_socket(Domain::IPV4)?,
                    wildcard: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
                })
            }
        }
    }
}

/// Reserve `port` (0 for an OS-assigned port) and detect shared-binding support.
///
/// An unsupported option is not an error: it is logged and reported through
/// [`ReservedPort::shared_binding_supported`]. A failure to bind the probe is
/// fatal and returned as [`IngestError::PortBind`].
pub fn reserve_port(port: u16) -> Result<ReservedPort> {
    let probe =
        ProbeSocket::open(port).map_err(|source| IngestError::PortBind { port, source })?;

    let shared_binding_supported = match request_shared_binding(&probe.socket) {
        Ok(()) => true,
        Err(e) => {
            tracing::info!(
                error = %e,
                "SO_REUSEPORT not supported on this platform, falling back to a single worker"
            );
            false
        }
    };

    probe
        .socket
        .bind(&SockAddr::from(probe.wildcard))
        .map_err(|source| IngestError::PortBind { port, source })?;

    let bound = probe
        .socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .map(|addr| addr.port())
        .ok_or_else(|| IngestError::PortBind {
            port,
            source: std::io::Error::other("probe socket has no local address"),
        })?;

    drop(probe);

    tracing::info!(port = bound, shared_binding_supported, "Reserved port");

    Ok(ReservedPort {
        port: bound,
        shared_binding_supported,
    })
}
