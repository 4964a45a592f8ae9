use crate::credentials::{self, CredentialSource};
use crate::dispatch::{Consumer, DispatchBridge};
use crate::error::SessionError;
use crate::live_connector::LiveConnector;
use crate::registry::SubscriptionRegistry;
use crate::routes::RouteTable;
use crate::session::{ConnectionStatus, SessionConfig, SessionObserver, TransportSession};
use crate::transport::{ConnectionHandle, Connector};
use configuration::Settings;
use events::{EventBus, MarketEvent, NamedReceiver};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The result of `HubClient::invoke`. Invocation never returns an error;
/// failures are reported here instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvokeOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvokeOutcome {
    fn succeeded(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// The application root: one session, its subscription registry and the
/// broadcast channel, wired together.
pub struct HubClient {
    session: Arc<TransportSession>,
    registry: Arc<SubscriptionRegistry>,
    bus: EventBus,
}

impl HubClient {
    /// Builds a client over any transport. Nothing connects until `connect()`.
    pub fn init(
        settings: &Settings,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Arc<Self>, SessionError> {
        let config = SessionConfig::from_settings(settings)?;
        let bus = EventBus::new(settings.broadcast.capacity);
        tracing::info!(endpoint = %config.endpoint, max_attempts = config.max_attempts, "Initialising hub client.");

        let session = TransportSession::new(config, connector, credentials, bus.clone());
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&session),
            DispatchBridge::new(bus.clone()),
            RouteTable::with_overrides(&settings.routes),
        ));
        let observer: Arc<dyn SessionObserver> = registry.clone();
        session.set_observer(Arc::downgrade(&observer));

        Ok(Arc::new(Self {
            session,
            registry,
            bus,
        }))
    }

    /// Builds a client over the WebSocket transport with the configured credential store.
    pub fn with_live_transport(settings: &Settings) -> Result<Arc<Self>, SessionError> {
        let credentials = credentials::from_settings(&settings.credentials);
        let connector = Arc::new(LiveConnector::new(
            settings.transport.clone(),
            Arc::clone(&credentials),
        ));
        Self::init(settings, connector, credentials)
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down hub client.");
        self.session.stop().await;
    }

    pub async fn connect(&self) -> Result<ConnectionHandle, SessionError> {
        self.session.connect().await
    }

    pub async fn stop(&self) {
        self.session.stop().await;
    }

    pub fn subscribe(&self, event_name: &str, consumer: Consumer) -> bool {
        self.registry.subscribe(event_name, consumer)
    }

    pub fn unsubscribe(&self, event_name: &str, consumer: Option<&Consumer>) {
        self.registry.unsubscribe(event_name, consumer);
    }

    /// Calls a hub method, connecting first if needed.
    pub async fn invoke(&self, method: &str, arguments: Vec<Value>) -> InvokeOutcome {
        let connection = match self.session.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(method, error = %e, "Cannot invoke hub method without a connection.");
                return InvokeOutcome::failed(e);
            }
        };

        match connection.invoke(method, arguments).await {
            Ok(result) => InvokeOutcome::succeeded(result),
            Err(e) => {
                tracing::warn!(method, error = %e, "Hub method invocation failed.");
                InvokeOutcome::failed(e)
            }
        }
    }

    pub fn is_connected(&self) -> ConnectionStatus {
        self.session.status()
    }

    pub fn events(&self) -> broadcast::Receiver<MarketEvent> {
        self.bus.subscribe()
    }

    /// A receiver limited to one broadcast event name, e.g. `"price-update"`.
    pub fn events_named(&self, name: &str) -> NamedReceiver {
        self.bus.subscribe_to(name)
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticToken;
    use crate::error::TransportError;
    use crate::mock::MockConnector;
    use serde_json::json;

    #[tokio::test]
    async fn invoke_connects_on_demand() {
        let connector = MockConnector::new();
        let client = HubClient::init(&Settings::default(), connector.clone(), Arc::new(StaticToken::new("tok"))).unwrap();

        let outcome = client.invoke("JoinGroup", vec![json!("HSX")]).await;
        assert_eq!(outcome, InvokeOutcome::succeeded(Value::Null));

        let connection = connector.last_connection().unwrap();
        assert_eq!(connection.invocations(), vec![("JoinGroup".to_string(), vec![json!("HSX")])]);
        assert_eq!(connector.tokens(), vec!["tok".to_string()]);
        assert_eq!(connector.endpoints()[0].as_str(), "http://localhost:5000/stockHub");
    }

    #[tokio::test]
    async fn invoke_reports_hub_errors_softly() {
        let connector = MockConnector::new();
        let client = HubClient::init(&Settings::default(), connector.clone(), Arc::new(StaticToken::new("tok"))).unwrap();
        client.connect().await.unwrap();
        connector.last_connection().unwrap().respond(
            "GetQuote",
            Err(TransportError::Invocation {
                method: "GetQuote".into(),
                message: "unknown symbol".into(),
            }),
        );

        let outcome = client.invoke("GetQuote", vec![json!("ZZZ")]).await;
        assert!(!outcome.success);
        assert_eq!(outcome.result, None);
        assert!(outcome.error.unwrap().contains("unknown symbol"));
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_without_credentials_fails_softly() {
        let connector = MockConnector::new();
        let client = HubClient::init(&Settings::default(), connector.clone(), Arc::new(|| None::<String>)).unwrap();

        let outcome = client.invoke("Ping", vec![]).await;
        assert!(!outcome.success);
        assert_eq!(connector.attempts(), 0);
        assert!(client.is_connected().failed);
    }
}
