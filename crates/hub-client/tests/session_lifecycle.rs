//! Connection lifecycle of the hub client against the in-memory transport.

use configuration::Settings;
use core_types::ConnectionPhase;
use events::MarketEvent;
use hub_client::mock::MockConnector;
use hub_client::{HubClient, HubConnection, SessionError, StaticToken, TransportError, consumer, names};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn client_with(connector: &Arc<MockConnector>) -> Arc<HubClient> {
    HubClient::init(&Settings::default(), connector.clone(), Arc::new(StaticToken::new("token"))).unwrap()
}

fn status_of(event: MarketEvent) -> ConnectionPhase {
    match event {
        MarketEvent::ConnectionStatus(change) => change.status,
        other => panic!("expected a status change, got {:?}", other),
    }
}

#[tokio::test]
async fn stop_is_idempotent() {
    let connector = MockConnector::new();
    let client = client_with(&connector);

    client.stop().await;
    client.stop().await;
    assert_eq!(client.is_connected().phase, ConnectionPhase::Idle);

    client.connect().await.unwrap();
    assert!(client.is_connected().active);

    client.stop().await;
    client.stop().await;
    let status = client.is_connected();
    assert_eq!(status.phase, ConnectionPhase::Idle);
    assert!(!status.active);
    assert!(connector.last_connection().unwrap().is_stopped());
}

#[tokio::test(start_paused = true)]
async fn gives_up_at_the_retry_ceiling() {
    let connector = MockConnector::rejecting(TransportError::HandshakeRejected("Unauthorized".into()));
    let client = client_with(&connector);

    let error = client.connect().await.err().unwrap();
    match error {
        SessionError::MaxAttemptsExceeded { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(
                *last,
                SessionError::Transport(TransportError::HandshakeRejected("Unauthorized".into()))
            );
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(connector.attempts(), 3);

    let status = client.is_connected();
    assert!(status.failed);
    assert_eq!(status.attempts, status.max_attempts);
    assert_eq!(status.phase, ConnectionPhase::Disconnected);
    assert_eq!(
        client.session().last_error(),
        Some(SessionError::Transport(TransportError::HandshakeRejected("Unauthorized".into())))
    );

    // Nothing retries on its own once failed.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 3);

    // An explicit connect starts a fresh count.
    connector.fail_always(None);
    client.connect().await.unwrap();
    let status = client.is_connected();
    assert!(status.active);
    assert!(!status.failed);
    assert_eq!(status.attempts, 0);
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn missing_credentials_count_toward_the_ceiling() {
    let connector = MockConnector::new();
    let client = HubClient::init(&Settings::default(), connector.clone(), Arc::new(|| None::<String>)).unwrap();

    let error = client.connect().await.err().unwrap();
    assert!(matches!(
        error,
        SessionError::MaxAttemptsExceeded { attempts: 3, ref last } if **last == SessionError::MissingCredential
    ));
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn a_stopped_attempt_does_not_count_against_the_next_connect() {
    let connector = MockConnector::rejecting(TransportError::Connect("refused".into()));
    let client = client_with(&connector);

    let stale = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect().await }
    });
    while connector.attempts() == 0 {
        tokio::task::yield_now().await;
    }
    client.stop().await;

    let error = client.connect().await.err().unwrap();
    assert!(matches!(error, SessionError::MaxAttemptsExceeded { attempts: 3, .. }));
    assert_eq!(client.is_connected().attempts, 3);
    assert_eq!(connector.attempts(), 4);
    assert_eq!(stale.await.unwrap().err().unwrap(), SessionError::Stopped);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let connector = MockConnector::new();
    connector.fail_next(TransportError::Connect("refused".into()));
    connector.fail_next(TransportError::HandshakeTimeout(Duration::from_secs(15)));
    let client = client_with(&connector);

    client.connect().await.unwrap();
    assert_eq!(connector.attempts(), 3);
    assert_eq!(client.is_connected().attempts, 0);
}

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let connector = MockConnector::new();
    let client = client_with(&connector);

    let (first, second) = tokio::join!(client.connect(), client.connect());
    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    assert_eq!(connector.attempts(), 1);

    client.connect().await.unwrap();
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn status_changes_are_broadcast() {
    let connector = MockConnector::new();
    let client = client_with(&connector);
    let mut statuses = client.events_named(MarketEvent::CONNECTION_STATUS);

    client.connect().await.unwrap();
    assert_eq!(status_of(statuses.recv().await.unwrap()), ConnectionPhase::Connecting);
    assert_eq!(status_of(statuses.recv().await.unwrap()), ConnectionPhase::Connected);

    client.stop().await;
    assert_eq!(status_of(statuses.recv().await.unwrap()), ConnectionPhase::Idle);
}

#[tokio::test]
async fn price_update_reaches_the_broadcast_channel() {
    let connector = MockConnector::new();
    let client = client_with(&connector);
    let mut prices = client.events_named(MarketEvent::PRICE_UPDATE);

    client.connect().await.unwrap();
    assert!(client.subscribe(names::HSX_STOCK_UPDATE, consumer(|_event| async { Ok(()) })));

    let connection = connector.last_connection().unwrap();
    assert!(connection.emit(
        names::HSX_STOCK_UPDATE,
        vec![json!(r#"{"Timestamp":"2024-05-01T03:00:00Z","Message":"tick"}"#)]
    ));

    match prices.recv().await.unwrap() {
        MarketEvent::PriceUpdate(update) => {
            assert_eq!(update.exchange, "hsx");
            assert_eq!(update.data.timestamp, "2024-05-01T03:00:00Z");
            assert_eq!(update.timestamp.to_rfc3339(), "2024-05-01T03:00:00+00:00");
            assert_eq!(update.data.message, "tick");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_schedules_one_reconnect() {
    let connector = MockConnector::new();
    let client = client_with(&connector);
    client.connect().await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.subscribe(
        names::NEWS_UPDATE,
        consumer(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.message);
                Ok(())
            }
        }),
    );

    let first = connector.last_connection().unwrap();
    first.simulate_close(Some(TransportError::ConnectionLost("reset by peer".into())));
    let status = client.is_connected();
    assert_eq!(status.phase, ConnectionPhase::Disconnected);
    assert!(!status.active);

    // A second close report from the same connection is stale.
    first.simulate_close(Some(TransportError::ConnectionLost("again".into())));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(connector.connections().len(), 2);
    assert_eq!(client.is_connected().phase, ConnectionPhase::Connected);

    let second = connector.last_connection().unwrap();
    assert!(second.has_listener(names::NEWS_UPDATE));
    second.emit(names::NEWS_UPDATE, vec![json!("back online")]);
    assert_eq!(rx.recv().await.unwrap(), "back online");
}

#[tokio::test(start_paused = true)]
async fn clean_close_does_not_reconnect() {
    let connector = MockConnector::new();
    let client = client_with(&connector);
    client.connect().await.unwrap();

    connector.last_connection().unwrap().simulate_close(None);
    assert_eq!(client.is_connected().phase, ConnectionPhase::Idle);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_a_pending_reconnect() {
    let connector = MockConnector::new();
    let client = client_with(&connector);
    client.connect().await.unwrap();

    connector
        .last_connection()
        .unwrap()
        .simulate_close(Some(TransportError::ServerTimeout(Duration::from_secs(30))));
    client.stop().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(client.is_connected().phase, ConnectionPhase::Idle);
}

#[tokio::test]
async fn transport_recovery_moves_through_reconnecting() {
    let connector = MockConnector::new();
    let client = client_with(&connector);
    client.connect().await.unwrap();
    let connection = connector.last_connection().unwrap();

    connection.simulate_reconnecting(TransportError::ConnectionLost("wifi".into()));
    let status = client.is_connected();
    assert_eq!(status.phase, ConnectionPhase::Reconnecting);
    assert!(!status.active);

    // The handle stays usable while the transport recovers it.
    let handle = client.connect().await.unwrap();
    assert_eq!(handle.connection_id(), connection.connection_id());

    connection.simulate_reconnected();
    let status = client.is_connected();
    assert_eq!(status.phase, ConnectionPhase::Connected);
    assert!(status.active);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn callbacks_from_a_replaced_connection_are_ignored() {
    let connector = MockConnector::new();
    let client = client_with(&connector);
    client.connect().await.unwrap();
    let old = connector.last_connection().unwrap();

    client.stop().await;
    client.connect().await.unwrap();

    old.simulate_reconnecting(TransportError::ConnectionLost("late".into()));
    old.simulate_close(Some(TransportError::ConnectionLost("late".into())));
    assert_eq!(client.is_connected().phase, ConnectionPhase::Connected);
    assert_eq!(connector.attempts(), 2);
}
