//! Forwarding (C2b/C2c): per-flow decisions that turn an accepted
//! guest TCP SYN or a guest UDP datagram into a host-side socket.

pub mod tcp;
pub mod udp;

pub use tcp::ForwardError;
