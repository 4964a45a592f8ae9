//! An in-memory hub transport for tests.
//!
//! `MockConnector` hands out `MockConnection`s (or scripted failures) and
//! remembers every one of them; a `MockConnection` records wire listeners and
//! invocations and lets a test push wire messages or lifecycle events.

use crate::error::TransportError;
use crate::lock;
use crate::transport::{ConnectionHandle, Connector, HubConnection, LifecycleHandlers, WireHandler};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;
use uuid::Uuid;

#[derive(Default)]
pub struct MockConnector {
    scripted: Mutex<VecDeque<TransportError>>,
    always: Mutex<Option<TransportError>>,
    attempts: AtomicU32,
    tokens: Mutex<Vec<String>>,
    endpoints: Mutex<Vec<Url>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A connector whose every handshake fails with `error`.
    pub fn rejecting(error: TransportError) -> Arc<Self> {
        let connector = Self::new();
        connector.fail_always(Some(error));
        connector
    }

    /// Fails the next connect with `error`; queued failures are used in order.
    pub fn fail_next(&self, error: TransportError) {
        lock(&self.scripted).push_back(error);
    }

    /// Fails every connect with `error` until called with `None`.
    pub fn fail_always(&self, error: Option<TransportError>) {
        *lock(&self.always) = error;
    }

    /// Connect calls made so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        lock(&self.tokens).clone()
    }

    pub fn endpoints(&self) -> Vec<Url> {
        lock(&self.endpoints).clone()
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.connections).clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        lock(&self.connections).last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Url, token: &str) -> Result<ConnectionHandle, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        lock(&self.tokens).push(token.to_string());
        lock(&self.endpoints).push(endpoint.clone());

        if let Some(error) = lock(&self.always).clone() {
            return Err(error);
        }
        if let Some(error) = lock(&self.scripted).pop_front() {
            return Err(error);
        }

        let connection = Arc::new(MockConnection::new());
        lock(&self.connections).push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct MockConnection {
    id: Mutex<Option<String>>,
    listeners: Mutex<HashMap<String, WireHandler>>,
    lifecycle: Mutex<Option<LifecycleHandlers>>,
    invocations: Mutex<Vec<(String, Vec<Value>)>>,
    responses: Mutex<HashMap<String, Result<Value, TransportError>>>,
    on_calls: AtomicUsize,
    stopped: AtomicBool,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            id: Mutex::new(Some(Uuid::new_v4().to_string())),
            listeners: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(None),
            invocations: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            on_calls: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Delivers a wire message as the hub would. Returns whether a listener took it.
    pub fn emit(&self, event: &str, arguments: Vec<Value>) -> bool {
        let handler = lock(&self.listeners).get(&event.to_ascii_lowercase()).cloned();
        match handler {
            Some(handler) => {
                handler(arguments);
                true
            }
            None => false,
        }
    }

    pub fn has_listener(&self, event: &str) -> bool {
        lock(&self.listeners).contains_key(&event.to_ascii_lowercase())
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// How many times `on` was called, replacements included.
    pub fn on_calls(&self) -> usize {
        self.on_calls.load(Ordering::SeqCst)
    }

    /// Scripts the outcome of invoking `method`; unscripted methods return `null`.
    pub fn respond(&self, method: &str, outcome: Result<Value, TransportError>) {
        lock(&self.responses).insert(method.to_string(), outcome);
    }

    pub fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        lock(&self.invocations).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn simulate_reconnecting(&self, error: TransportError) {
        if let Some(handlers) = self.handlers() {
            (handlers.on_reconnecting)(Some(error));
        }
    }

    /// Recovers the transport under a new connection id. Wire listeners are
    /// dropped first, as a transport that rebuilt its socket would have lost them.
    pub fn simulate_reconnected(&self) {
        lock(&self.listeners).clear();
        let id = Uuid::new_v4().to_string();
        *lock(&self.id) = Some(id.clone());
        if let Some(handlers) = self.handlers() {
            (handlers.on_reconnected)(Some(id));
        }
    }

    /// Closes the connection from the hub's side.
    pub fn simulate_close(&self, error: Option<TransportError>) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handlers) = self.handlers() {
            (handlers.on_close)(error);
        }
    }

    fn handlers(&self) -> Option<LifecycleHandlers> {
        lock(&self.lifecycle).clone()
    }
}

#[async_trait]
impl HubConnection for MockConnection {
    fn connection_id(&self) -> Option<String> {
        lock(&self.id).clone()
    }

    fn on(&self, event: &str, handler: WireHandler) {
        self.on_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).insert(event.to_ascii_lowercase(), handler);
    }

    fn off(&self, event: &str) {
        lock(&self.listeners).remove(&event.to_ascii_lowercase());
    }

    fn set_lifecycle(&self, handlers: LifecycleHandlers) {
        *lock(&self.lifecycle) = Some(handlers);
    }

    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, TransportError> {
        if self.is_stopped() {
            return Err(TransportError::NotConnected);
        }
        lock(&self.invocations).push((method.to_string(), arguments));
        lock(&self.responses)
            .get(method)
            .cloned()
            .unwrap_or(Ok(Value::Null))
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            if let Some(handlers) = self.handlers() {
                (handlers.on_close)(None);
            }
        }
    }
}
