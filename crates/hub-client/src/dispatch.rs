//! Fans a raw wire message out to every registered consumer and republishes
//! it on the broadcast channel.
//!
//! Consumers are called in subscription order. Each call is isolated: a
//! synchronous panic is caught, and the returned future is queued on that
//! registration's worker task, which runs its futures one at a time in
//! arrival order and logs any panic or `Err`. Dispatch never awaits a consumer.

use crate::lock;
use crate::normalizer::normalize_routed;
use crate::routes::EventRoute;
use chrono::Utc;
use core_types::{EventFamily, NormalizedEvent};
use events::{EventBus, IndexUpdate, MarketEvent, NewsUpdate, PriceAlert, PriceUpdate};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub type ConsumerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A subscriber callback. Identity (for unsubscribing) is the `Arc` allocation.
pub type Consumer = Arc<dyn Fn(NormalizedEvent) -> ConsumerFuture + Send + Sync>;

/// Wraps an async closure as a [`Consumer`].
pub fn consumer<F, Fut>(f: F) -> Consumer
where
    F: Fn(NormalizedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// One registration of a [`Consumer`] with its own delivery queue.
///
/// The worker draining the queue starts with the first delivery and ends once
/// the subscriber is dropped and the queue is empty.
pub struct Subscriber {
    consumer: Consumer,
    queue: Mutex<Option<mpsc::UnboundedSender<ConsumerFuture>>>,
}

impl Subscriber {
    pub fn new(consumer: Consumer) -> Arc<Self> {
        Arc::new(Self {
            consumer,
            queue: Mutex::new(None),
        })
    }

    /// Whether this registration was made with `consumer` (same allocation).
    pub fn wraps(&self, consumer: &Consumer) -> bool {
        Arc::ptr_eq(&self.consumer, consumer)
    }

    /// Queues `future` behind the ones already delivered. Returns `false` when
    /// there is no runtime to run it on.
    fn enqueue(&self, event_name: &str, mut future: ConsumerFuture) -> bool {
        let mut queue = lock(&self.queue);
        if let Some(tx) = queue.as_ref() {
            match tx.send(future) {
                Ok(()) => return true,
                // The worker went away with its runtime; start a new one.
                Err(mpsc::error::SendError(returned)) => future = returned,
            }
        }

        let Ok(runtime) = Handle::try_current() else {
            return false;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(future);
        runtime.spawn(drain(event_name.to_string(), rx));
        *queue = Some(tx);
        true
    }
}

async fn drain(event_name: String, mut queue: mpsc::UnboundedReceiver<ConsumerFuture>) {
    while let Some(future) = queue.recv().await {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(event = %event_name, error = %e, "Consumer failed.");
            }
            Err(payload) => {
                tracing::error!(
                    event = %event_name,
                    panic = %panic_message(payload.as_ref()),
                    "Consumer task panicked."
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchBridge {
    bus: EventBus,
}

impl DispatchBridge {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Normalizes the first wire argument once, hands it to every subscriber
    /// and publishes the family's broadcast event. Returns the normalized event.
    pub fn dispatch(
        &self,
        event_name: &str,
        route: &EventRoute,
        arguments: &[Value],
        subscribers: &[Arc<Subscriber>],
    ) -> NormalizedEvent {
        let raw = arguments.first().cloned().unwrap_or(Value::Null);
        let event = normalize_routed(&raw, event_name, route);
        tracing::debug!(event = event_name, consumers = subscribers.len(), "Dispatching hub event.");

        for (index, subscriber) in subscribers.iter().enumerate() {
            self.call(event_name, index, subscriber, event.clone());
        }

        if let Some(published) = republish(route, &event) {
            self.bus.publish(published);
        }
        event
    }

    fn call(&self, event_name: &str, index: usize, subscriber: &Subscriber, event: NormalizedEvent) {
        let future = match panic::catch_unwind(AssertUnwindSafe(|| (subscriber.consumer)(event))) {
            Ok(future) => future,
            Err(payload) => {
                tracing::error!(
                    event = event_name,
                    consumer = index,
                    panic = %panic_message(payload.as_ref()),
                    "Consumer panicked."
                );
                return;
            }
        };

        if !subscriber.enqueue(event_name, future) {
            tracing::error!(event = event_name, consumer = index, "No async runtime to run the consumer on; dropped.");
        }
    }
}

/// The broadcast event for a normalized event, decided by its route's family.
pub fn republish(route: &EventRoute, event: &NormalizedEvent) -> Option<MarketEvent> {
    let source = event.event.clone();
    let timestamp = event.parsed_timestamp().unwrap_or_else(Utc::now);

    match route.family {
        EventFamily::PriceUpdate => Some(MarketEvent::PriceUpdate(PriceUpdate {
            source,
            exchange: event.exchange.tag().to_string(),
            timestamp,
            data: event.clone(),
        })),
        EventFamily::IndexUpdate => Some(MarketEvent::IndexUpdate(IndexUpdate {
            source,
            timestamp,
            data: event.clone(),
        })),
        EventFamily::PriceAlert => Some(MarketEvent::PriceAlert(PriceAlert {
            source,
            message: event.message.clone(),
            time: timestamp,
            user_id: user_id_of(event),
            exchange: event.exchange.tag().to_string(),
        })),
        EventFamily::News => Some(MarketEvent::NewsUpdate(NewsUpdate {
            source,
            message: event.message.clone(),
            timestamp,
            count: event.count,
            data: event.clone(),
        })),
        EventFamily::Other => None,
    }
}

fn user_id_of(event: &NormalizedEvent) -> Option<String> {
    match event.field("userId").or_else(|| event.field("user_id"))? {
        Value::String(id) => Some(id.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{builtin_routes, names};
    use core_types::Exchange;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn recording(tag: &'static str, tx: mpsc::UnboundedSender<(&'static str, NormalizedEvent)>) -> Arc<Subscriber> {
        subscribed(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((tag, event));
                Ok(())
            }
        })
    }

    fn subscribed<F, Fut>(f: F) -> Arc<Subscriber>
    where
        F: Fn(NormalizedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Subscriber::new(consumer(f))
    }

    async fn fails(_event: NormalizedEvent) -> anyhow::Result<()> {
        anyhow::bail!("async failure")
    }

    async fn explodes(_event: NormalizedEvent) -> anyhow::Result<()> {
        panic!("async boom")
    }

    #[tokio::test]
    async fn every_consumer_sees_the_same_event() {
        let bridge = DispatchBridge::new(EventBus::new(8));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumers = vec![recording("first", tx.clone()), recording("second", tx)];
        let route = builtin_routes().resolve(names::HSX_STOCK_UPDATE);

        let event = bridge.dispatch(names::HSX_STOCK_UPDATE, &route, &[json!({"message": "tick"})], &consumers);

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by_key(|(tag, _)| *tag);
        assert_eq!(seen[0], ("first", event.clone()));
        assert_eq!(seen[1], ("second", event));
    }

    #[tokio::test]
    async fn failing_consumers_do_not_affect_the_rest() {
        let bridge = DispatchBridge::new(EventBus::new(8));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sync_panic: Consumer = Arc::new(|_event: NormalizedEvent| -> ConsumerFuture { panic!("sync boom") });
        let consumers = vec![
            Subscriber::new(sync_panic),
            subscribed(fails),
            subscribed(explodes),
            recording("survivor", tx),
        ];
        let route = builtin_routes().resolve(names::NEWS_UPDATE);

        bridge.dispatch(names::NEWS_UPDATE, &route, &[json!("5 stocks in the news")], &consumers);

        let (tag, event) = rx.recv().await.unwrap();
        assert_eq!(tag, "survivor");
        assert_eq!(event.count, Some(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn a_slow_event_holds_back_the_next_one_for_that_consumer() {
        let bridge = DispatchBridge::new(EventBus::new(8));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscribers = [subscribed(move |event: NormalizedEvent| {
            let tx = tx.clone();
            async move {
                if event.message == "first" {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                let _ = tx.send(event.message);
                Ok(())
            }
        })];
        let route = builtin_routes().resolve(names::NEWS_UPDATE);

        bridge.dispatch(names::NEWS_UPDATE, &route, &[json!("first")], &subscribers);
        bridge.dispatch(names::NEWS_UPDATE, &route, &[json!("second")], &subscribers);

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn a_panicking_event_does_not_stop_later_deliveries() {
        let bridge = DispatchBridge::new(EventBus::new(8));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscribers = [subscribed(move |event: NormalizedEvent| {
            let tx = tx.clone();
            async move {
                if event.message == "bad" {
                    panic!("cannot handle {}", event.message);
                }
                let _ = tx.send(event.message);
                Ok(())
            }
        })];
        let route = builtin_routes().resolve(names::NEWS_UPDATE);

        bridge.dispatch(names::NEWS_UPDATE, &route, &[json!("bad")], &subscribers);
        bridge.dispatch(names::NEWS_UPDATE, &route, &[json!("good")], &subscribers);

        assert_eq!(rx.recv().await.unwrap(), "good");
    }

    #[tokio::test]
    async fn missing_argument_is_normalized_as_null() {
        let bridge = DispatchBridge::new(EventBus::new(8));
        let route = builtin_routes().resolve("ReceiveBanner");
        let event = bridge.dispatch("ReceiveBanner", &route, &[], &[]);
        assert_eq!(event.message, "null");
        assert_eq!(event.exchange, Exchange::Unknown);
    }

    #[tokio::test]
    async fn price_updates_are_republished_with_the_lowercase_tag() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let bridge = DispatchBridge::new(bus);
        let route = builtin_routes().resolve(names::HSX_STOCK_UPDATE);

        bridge.dispatch(
            names::HSX_STOCK_UPDATE,
            &route,
            &[json!(r#"{"Timestamp":"2024-05-01T03:00:00Z","Message":"tick"}"#)],
            &[],
        );

        match rx.recv().await.unwrap() {
            MarketEvent::PriceUpdate(update) => {
                assert_eq!(update.exchange, "hsx");
                assert_eq!(update.source, names::HSX_STOCK_UPDATE);
                assert_eq!(update.timestamp.to_rfc3339(), "2024-05-01T03:00:00+00:00");
                assert_eq!(update.data.message, "tick");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn alerts_carry_the_user_id() {
        let route = builtin_routes().resolve(names::PRICE_ALERT);
        let event = crate::normalizer::normalize(
            &json!({"message": "VNM crossed 70", "userId": 42, "exchange": "HSX"}),
            names::PRICE_ALERT,
        );
        match republish(&route, &event) {
            Some(MarketEvent::PriceAlert(alert)) => {
                assert_eq!(alert.user_id.as_deref(), Some("42"));
                assert_eq!(alert.message, "VNM crossed 70");
                assert_eq!(alert.exchange, "hsx");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn other_family_publishes_nothing() {
        let route = builtin_routes().resolve("ReceiveBanner");
        let event = NormalizedEvent::new("ReceiveBanner", "hello", Exchange::Unknown);
        assert!(republish(&route, &event).is_none());
    }

    #[test]
    fn dispatch_without_a_runtime_only_logs() {
        let bridge = DispatchBridge::new(EventBus::new(8));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let consumers = vec![subscribed(move |_event| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Ok(()) }
        })];
        let route = builtin_routes().resolve(names::NEWS_UPDATE);
        bridge.dispatch(names::NEWS_UPDATE, &route, &[json!("quiet")], &consumers);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
