use tokio::sync::mpsc;

/// Ordered publish/subscribe fan-out. Every subscriber owns an unbounded
/// receiver and sees events in publish order; receivers that were dropped
/// are pruned on the next publish.
#[derive(Debug)]
pub struct EventBus<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
}

impl<E: Clone> EventBus<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Returns the number of subscribers the event reached.
    pub fn publish(&mut self, event: E) -> usize {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        self.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_publish_order_to_every_subscriber() {
        let mut bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.publish(1), 2);
        assert_eq!(bus.publish(2), 2);

        assert_eq!(first.try_recv().unwrap(), 1);
        assert_eq!(first.try_recv().unwrap(), 2);
        assert_eq!(second.try_recv().unwrap(), 1);
        assert_eq!(second.try_recv().unwrap(), 2);
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut bus = EventBus::new();
        let kept = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);

        assert_eq!(bus.publish("changed"), 1);
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
        assert_eq!(bus.publish("changed"), 0);
    }
}
