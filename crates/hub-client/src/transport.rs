//! The seam between the session and a physical hub connection.
//!
//! `LiveConnector` implements these traits over a WebSocket; `mock` implements
//! them in memory for tests.

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Receives the raw arguments of every hub invocation for one event name.
pub type WireHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Called with `None` when the connection was stopped on purpose.
pub type CloseHandler = Arc<dyn Fn(Option<TransportError>) + Send + Sync>;
pub type ReconnectingHandler = Arc<dyn Fn(Option<TransportError>) + Send + Sync>;
/// Called with the new connection id once the transport has recovered.
pub type ReconnectedHandler = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// The three lifecycle callbacks a session installs on a fresh connection.
#[derive(Clone)]
pub struct LifecycleHandlers {
    pub on_close: CloseHandler,
    pub on_reconnecting: ReconnectingHandler,
    pub on_reconnected: ReconnectedHandler,
}

/// A live connection to the hub.
#[async_trait]
pub trait HubConnection: Send + Sync {
    fn connection_id(&self) -> Option<String>;

    /// Installs the wire listener for `event`, replacing any previous one.
    /// Event names match case-insensitively.
    fn on(&self, event: &str, handler: WireHandler);

    /// Removes the wire listener for `event`, if any.
    fn off(&self, event: &str);

    fn set_lifecycle(&self, handlers: LifecycleHandlers);

    /// Calls a hub method and waits for its completion.
    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, TransportError>;

    /// Closes the connection. Reports `on_close(None)` and is idempotent.
    async fn stop(&self);
}

pub type ConnectionHandle = Arc<dyn HubConnection>;

/// Opens hub connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a socket to `endpoint` with `token` and completes the handshake.
    async fn connect(&self, endpoint: &Url, token: &str) -> Result<ConnectionHandle, TransportError>;
}
