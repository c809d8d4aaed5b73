//! Socket construction for kernel-level port sharing.
//!
//! Both the reservation probe and the worker listeners go through this module
//! so that they request `SO_REUSEPORT` the same way.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

/// Listen backlog for worker listeners.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Create a TCP socket for the given domain.
pub fn tcp_socket(domain: Domain) -> io::Result<Socket> {
    Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
}

/// Ask the kernel to allow other sockets to bind the same address and port.
///
/// Returns `ErrorKind::Unsupported` on targets that have no such option.
#[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
pub fn request_shared_binding(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

/// Ask the kernel to allow other sockets to bind the same address and port.
///
/// Returns `ErrorKind::Unsupported` on targets that have no such option.
#[cfg(not(all(unix, not(target_os = "solaris"), not(target_os = "illumos"))))]
pub fn request_shared_binding(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_REUSEPORT is not available on this platform",
    ))
}

/// Resolve a `host:port` string to every candidate socket address.
pub fn resolve(addr: &str) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no socket addresses found for '{}'", addr),
        ));
    }
    Ok(addrs)
}

/// Bind a listening socket on `addr` with shared binding requested.
///
/// Each resolved address is tried in order and the first that binds wins,
/// so every worker given the same `addr` ends up on the same socket address.
/// Failing to set the option is logged and ignored: on a single-worker pool
/// there is nobody to share with.
pub fn bind_shared(addr: &str) -> io::Result<TcpListener> {
    let mut last_err = None;

    for candidate in resolve(addr)? {
        let domain = Domain::for_address(candidate);
        let socket = match tcp_socket(domain) {
            Ok(s) => s,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        if let Err(e) = request_shared_binding(&socket) {
            tracing::debug!(addr = %candidate, error = %e, "Shared binding not applied");
        }

        if let Err(e) = socket.bind(&SockAddr::from(candidate)) {
            last_err = Some(e);
            continue;
        }

        if let Err(e) = socket.listen(LISTEN_BACKLOG) {
            last_err = Some(e);
            continue;
        }

        socket.set_nonblocking(true)?;
        return Ok(socket.into());
    }

    Err(last_err.unwrap_or_else(|| io::Error::other("failed to bind any address")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ip_literal() {
        let addrs = resolve("127.0.0.1:8080").unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn test_resolve_rejects_missing_port() {
        assert!(resolve("127.0.0.1").is_err());
    }

    #[test]
    fn test_bind_shared_ephemeral_port() {
        let listener = bind_shared("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_two_listeners_share_one_port() {
        let first = bind_shared("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();

        let second = bind_shared(&format!("127.0.0.1:{}", port)).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_bind_shared_conflicts_with_exclusive_listener() {
        let exclusive = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = exclusive.local_addr().unwrap().port();

        let err = bind_shared(&format!("127.0.0.1:{}", port)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
