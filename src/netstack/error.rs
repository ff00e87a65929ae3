//! Network stack error taxonomy (spec.md §7's "Forwarding (C2)" row):
//! dial failures map to a guest-visible signal locally and never reach
//! here; these variants are for stack-level setup/configuration
//! failures that abort `serve`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetstackError {
    #[error("failed to bring up link device: {0}")]
    Link(String),

    #[error("invalid static configuration: {0}")]
    Configuration(String),

    #[error("host socket error: {0}")]
    HostSocket(#[from] std::io::Error),

    #[error("proxy configuration error: {0}")]
    Proxy(String),
}

pub type NetstackResult<T> = std::result::Result<T, NetstackError>;
