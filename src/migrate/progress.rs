//! Progress event broadcast (spec.md §4.1: "Progress events are emitted
//! as a fraction"). Grounded on `events/bus.rs`'s broadcast-channel
//! pattern, reused generically via [`crate::events::EventBus`].

use crate::events::EventBus;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PhaseChanged(Phase),
    EntityStarted { kind: &'static str, source_id: String },
    EntityFinished { kind: &'static str, source_id: String, ok: bool },
    /// Completed / total, matching "progress events are emitted as a
    /// fraction".
    Fraction { completed: u32, total: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    EnumerateAndFilter,
    DaemonConfig,
    RedirectContextSocket,
    StartAgent,
    CheckDiskSpace,
    StartSyncServer,
    MigrateNonContainers,
    MigrateContainers,
    MigrateCredentials,
    RestoreContext,
}

/// Tracks the fixed total (§4.1: "1 (daemon config) + images + volumes +
/// networks + containers") and publishes a `Fraction` event each time an
/// entity finishes.
pub struct ProgressTracker {
    bus: EventBus<ProgressEvent>,
    total: std::sync::atomic::AtomicU32,
    completed: std::sync::atomic::AtomicU32,
}

impl ProgressTracker {
    pub fn new(total: u32) -> Self {
        Self {
            bus: EventBus::with_capacity(total.max(16) as usize),
            total: std::sync::atomic::AtomicU32::new(total),
            completed: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Raises the known total once enumeration has counted every
    /// retained entity; callers that subscribed before this point keep
    /// their receiver.
    pub fn set_total(&self, total: u32) {
        self.total.store(total, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.bus.subscribe()
    }

    pub fn phase(&self, phase: Phase) {
        self.bus.publish(ProgressEvent::PhaseChanged(phase));
    }

    pub fn started(&self, kind: &'static str, source_id: &str) {
        self.bus.publish(ProgressEvent::EntityStarted {
            kind,
            source_id: source_id.to_string(),
        });
    }

    /// Signals "one finished" exactly once per entity, per spec.md §4.1.
    pub fn finished(&self, kind: &'static str, source_id: &str, ok: bool) {
        self.bus.publish(ProgressEvent::EntityFinished {
            kind,
            source_id: source_id.to_string(),
            ok,
        });
        let completed = self
            .completed
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        self.bus.publish(ProgressEvent::Fraction {
            completed,
            total: self.total.load(std::sync::atomic::Ordering::SeqCst),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finished_publishes_fraction() {
        let tracker = ProgressTracker::new(2);
        let mut rx = tracker.subscribe();

        tracker.finished("image", "sha256:abc", true);

        let _ = rx.recv().await.unwrap(); // EntityFinished
        match rx.recv().await.unwrap() {
            ProgressEvent::Fraction { completed, total } => {
                assert_eq!(completed, 1);
                assert_eq!(total, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
