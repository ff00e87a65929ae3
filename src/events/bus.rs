//! Broadcast event bus.
//!
//! Thin wrapper around [`tokio::sync::broadcast`] that keeps a receiver of
//! its own alive so the channel never closes while the bus itself is held,
//! and whose `Clone` impl resubscribes rather than sharing a receiver.

use tokio::sync::broadcast;

pub struct EventBus<T: Clone + Send + 'static> {
    sender: broadcast::Sender<T>,
    _receiver: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    /// Subscribe to the bus. The receiver only observes events published
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Publish an event. Silently dropped if there are no subscribers.
    /// Returns the number of receivers that observed it.
    pub fn publish(&self, event: T) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pubsub_roundtrip() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(42);
        assert_eq!(rx.recv().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus: EventBus<&'static str> = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish("hello");
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[test]
    fn subscriber_count_tracks_subscriptions() {
        let bus: EventBus<()> = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }
}
