use crate::messages::MarketEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// The process-wide publish point for [`MarketEvent`]s.
///
/// Cloning is cheap and every clone publishes into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MarketEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes to every current receiver and returns how many there were.
    /// Having no receivers is normal before the UI has attached.
    pub fn publish(&self, event: MarketEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!(event = name, "No broadcast receivers attached; event dropped.");
                0
            }
        }
    }

    /// A receiver for every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.sender.subscribe()
    }

    /// A receiver that only yields events whose [`MarketEvent::name`] is `name`.
    pub fn subscribe_to(&self, name: &str) -> NamedReceiver {
        NamedReceiver {
            name: name.to_string(),
            inner: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A broadcast receiver filtered by event name.
#[derive(Debug)]
pub struct NamedReceiver {
    name: String,
    inner: broadcast::Receiver<MarketEvent>,
}

impl NamedReceiver {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next event with the matching name.
    pub async fn recv(&mut self) -> Result<MarketEvent, RecvError> {
        loop {
            let event = self.inner.recv().await?;
            if event.name() == self.name {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ConnectionPhase;

    #[test]
    fn publish_without_receivers_is_not_an_error() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(MarketEvent::connection_status(ConnectionPhase::Connecting, None)), 0);
    }

    #[tokio::test]
    async fn named_receiver_skips_other_events() {
        let bus = EventBus::new(8);
        let mut all = bus.subscribe();
        let mut statuses = bus.subscribe_to(MarketEvent::CONNECTION_STATUS);
        let mut alerts = bus.subscribe_to(MarketEvent::PRICE_ALERT);

        bus.publish(MarketEvent::connection_status(ConnectionPhase::Connected, None));

        assert_eq!(all.recv().await.unwrap().name(), "connection-status");
        assert_eq!(statuses.recv().await.unwrap().name(), "connection-status");
        assert!(alerts.inner.try_recv().is_ok());
        assert!(alerts.inner.try_recv().is_err());
    }
}
