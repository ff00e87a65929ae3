//! Host Forwards (spec.md §4.10): three relay kinds between host TCP,
//! host Unix sockets, and TCP sockets living inside the user-space
//! stack. Each forward maintains no flow state beyond its byte pump;
//! shutdown propagates as half-close.

use std::net::SocketAddr;

use tokio::io;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::netstack::forwarder::tcp::pump_generic;

/// Accepted TCP connections bound to `0.0.0.0` must reject non-loopback
/// peers to avoid exposing the forward publicly (§4.10).
pub fn should_reject_non_loopback(listen_addr: SocketAddr, peer_addr: SocketAddr) -> bool {
    listen_addr.ip().is_unspecified() && !peer_addr.ip().is_loopback()
}

/// TCP-on-host -> host-unix relay. Accepts on `listener`, dialing
/// `unix_path` for each connection.
pub async fn serve_tcp_to_unix(listener: TcpListener, unix_path: std::path::PathBuf) {
    let listen_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "failed to read host forward listen address");
            return;
        }
    };
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "host forward accept failed");
                continue;
            }
        };
        if should_reject_non_loopback(listen_addr, peer) {
            debug!(%peer, "rejecting non-loopback peer on wildcard-bound host forward");
            continue;
        }
        let unix_path = unix_path.clone();
        tokio::spawn(async move {
            match UnixStream::connect(&unix_path).await {
                Ok(unix) => {
                    if let Err(e) = pump_generic(tcp, unix).await {
                        debug!(error = %e, "host forward pump ended with error");
                    }
                }
                Err(e) => warn!(error = %e, path = %unix_path.display(), "failed to dial host-unix forward target"),
            }
        });
    }
}

/// host-unix -> TCP-in-stack relay. Accepts on a host Unix listener,
/// dialing a TCP endpoint reachable only inside the user-space stack
/// (host-control addresses per §6).
pub async fn serve_unix_to_stack_tcp(listener: UnixListener, stack_addr: SocketAddr, dial: impl Fn(SocketAddr) -> io::Result<TcpStream> + Send + Sync + 'static) {
    let dial = std::sync::Arc::new(dial);
    loop {
        let (unix, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "host-unix forward accept failed");
                continue;
            }
        };
        let dial = dial.clone();
        tokio::spawn(async move {
            match dial(stack_addr) {
                Ok(stack_tcp) => {
                    if let Err(e) = pump_generic(unix, stack_tcp).await {
                        debug!(error = %e, "host-unix forward pump ended with error");
                    }
                }
                Err(e) => warn!(error = %e, "failed to dial stack-internal forward target"),
            }
        });
    }
}

/// TCP-in-stack -> host-unix relay: the mirror image, used when the
/// guest-visible listener lives inside the stack and forwards out to
/// a host service over a Unix socket.
pub async fn relay_stack_tcp_to_unix(stack_tcp: TcpStream, unix_path: &std::path::Path) -> io::Result<(u64, u64)> {
    let unix = UnixStream::connect(unix_path).await?;
    pump_generic(stack_tcp, unix).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_listener_rejects_non_loopback_peer() {
        let listen: SocketAddr = "0.0.0.0:2222".parse().unwrap();
        let peer: SocketAddr = "203.0.113.9:51000".parse().unwrap();
        assert!(should_reject_non_loopback(listen, peer));
    }

    #[test]
    fn wildcard_listener_accepts_loopback_peer() {
        let listen: SocketAddr = "0.0.0.0:2222".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:51000".parse().unwrap();
        assert!(!should_reject_non_loopback(listen, peer));
    }

    #[test]
    fn non_wildcard_listener_never_rejects() {
        let listen: SocketAddr = "127.0.0.1:2222".parse().unwrap();
        let peer: SocketAddr = "203.0.113.9:51000".parse().unwrap();
        assert!(!should_reject_non_loopback(listen, peer));
    }
}
