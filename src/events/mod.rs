//! Generic broadcast pub/sub used by both the migrator's progress stream
//! and the network stack's ready-event bus.

mod bus;

pub use bus::EventBus;
