//! Ready-event bus (spec.md §4.10): a listen TCP port inside the stack
//! accepts newline-delimited service names, each marking "service is
//! ready." Callers can wait on a name or register a handler.
//!
//! Reuses [`crate::events::EventBus`] almost directly: "wait on a
//! name" is a subscribe-and-filter loop (or an immediate return if
//! already armed), "register a handler" is a spawned task over the
//! same subscription.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::events::EventBus;

#[derive(Debug, Clone)]
pub struct Ready(pub String);

/// Tracks names already marked ready so a late "wait" call against a
/// name that fired before the caller subscribed still resolves
/// immediately (§4.10: "late names create a pre-armed waitable
/// entry").
pub struct ReadyBus {
    bus: EventBus<Ready>,
    armed: Mutex<HashSet<String>>,
}

impl Default for ReadyBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyBus {
    pub fn new() -> Self {
        Self {
            bus: EventBus::new(),
            armed: Mutex::new(HashSet::new()),
        }
    }

    pub fn mark_ready(&self, name: &str) {
        let newly_armed = self.armed.lock().insert(name.to_string());
        if newly_armed {
            self.bus.publish(Ready(name.to_string()));
        }
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.armed.lock().contains(name)
    }

    /// Blocks until `name` is ready, resolving immediately if it
    /// already is.
    pub async fn wait(&self, name: &str) {
        if self.is_ready(name) {
            return;
        }
        let mut rx = self.bus.subscribe();
        // Re-check after subscribing to close the race between the
        // is_ready check above and the subscribe call.
        if self.is_ready(name) {
            return;
        }
        while let Ok(event) = rx.recv().await {
            if event.0 == name {
                return;
            }
        }
    }

    /// Registers a handler that fires once: immediately (on a spawned
    /// task) if `name` is already ready, otherwise on the first
    /// transition.
    pub fn on_ready<F>(self: &Arc<Self>, name: &str, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let bus = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            bus.wait(&name).await;
            handler();
        });
    }
}

/// Accepts connections on the ready-event bus's reserved port and
/// treats each newline-delimited line as a service name to mark
/// ready.
pub async fn serve_ready_listener(listener: TcpListener, bus: Arc<ReadyBus>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "ready-event bus accept failed");
                continue;
            }
        };
        debug!(%peer, "ready-event bus connection accepted");
        let bus = bus.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_ready_connection(stream, &bus).await {
                warn!(error = %e, "ready-event bus connection ended with error");
            }
        });
    }
}

async fn handle_ready_connection(stream: TcpStream, bus: &ReadyBus) -> tokio::io::Result<()> {
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let name = line.trim();
        if !name.is_empty() {
            bus.mark_ready(name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn wait_resolves_after_mark_ready() {
        let bus = Arc::new(ReadyBus::new());
        let bus_clone = bus.clone();
        let waiter = tokio::spawn(async move {
            bus_clone.wait("dns").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.mark_ready("dns");
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_resolves_immediately_for_already_ready_name() {
        let bus = Arc::new(ReadyBus::new());
        bus.mark_ready("ssh");
        tokio::time::timeout(Duration::from_millis(50), bus.wait("ssh")).await.unwrap();
    }

    #[tokio::test]
    async fn on_ready_fires_immediately_when_already_armed() {
        let bus = Arc::new(ReadyBus::new());
        bus.mark_ready("ntp");
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        bus.on_ready("ntp", move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn on_ready_fires_on_first_transition() {
        let bus = Arc::new(ReadyBus::new());
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        bus.on_ready("control", move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        assert!(!fired.load(Ordering::SeqCst));
        bus.mark_ready("control");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repeated_mark_ready_does_not_republish() {
        let bus = Arc::new(ReadyBus::new());
        bus.mark_ready("dns");
        bus.mark_ready("dns");
        assert!(bus.is_ready("dns"));
    }
}
