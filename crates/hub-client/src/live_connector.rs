use crate::credentials::CredentialSource;
use crate::error::TransportError;
use crate::lock;
use crate::protocol::{self, HubMessage};
use crate::retry::ReconnectPolicy;
use crate::transport::{ConnectionHandle, Connector, HubConnection, LifecycleHandlers, WireHandler};
use async_trait::async_trait;
use configuration::TransportSettings;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;
use uuid::Uuid;

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections to the hub. No negotiation round-trip: the
/// socket is opened directly and the token travels as `access_token`.
pub struct LiveConnector {
    settings: TransportSettings,
    credentials: Arc<dyn CredentialSource>,
}

impl LiveConnector {
    /// `credentials` is consulted again for every transport-level reconnect.
    pub fn new(settings: TransportSettings, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            settings,
            credentials,
        }
    }
}

#[async_trait]
impl Connector for LiveConnector {
    async fn connect(&self, endpoint: &Url, token: &str) -> Result<ConnectionHandle, TransportError> {
        let url = socket_url(endpoint, token)?;
        tracing::info!(endpoint = %endpoint, "Opening hub socket.");

        let (socket, backlog) = open_socket(&url, self.settings.handshake_timeout()).await?;
        tracing::info!(endpoint = %endpoint, "Hub handshake completed.");

        Ok(Arc::new(LiveConnection::start(
            endpoint.clone(),
            self.settings.clone(),
            Arc::clone(&self.credentials),
            socket,
            backlog,
        )))
    }
}

/// Maps the `http(s)` hub endpoint onto its `ws(s)` socket URL and appends the token.
pub fn socket_url(endpoint: &Url, token: &str) -> Result<Url, TransportError> {
    let scheme = match endpoint.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Connect(format!("unsupported scheme '{}'", other)));
        }
    };
    let mut url = endpoint.clone();
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Connect(format!("cannot use scheme '{}' for {}", scheme, endpoint)))?;
    url.query_pairs_mut().append_pair("access_token", token);
    Ok(url)
}

async fn open_socket(url: &Url, handshake_timeout: Duration) -> Result<(HubSocket, Vec<String>), TransportError> {
    timeout(handshake_timeout, handshake(url))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(handshake_timeout))?
}

/// Opens the socket and exchanges the protocol handshake. Records that arrive
/// in the same frame as the handshake response are returned as a backlog.
async fn handshake(url: &Url) -> Result<(HubSocket, Vec<String>), TransportError> {
    let (mut socket, _) = connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    socket
        .send(Message::text(protocol::handshake_request()))
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    while let Some(frame) = socket.next().await {
        match frame.map_err(|e| TransportError::Connect(e.to_string()))? {
            Message::Text(text) => {
                let mut records = protocol::split_records(text.as_str());
                if let Some(first) = records.next() {
                    protocol::parse_handshake_response(first)?;
                    let backlog = records.map(str::to_string).collect();
                    return Ok((socket, backlog));
                }
            }
            Message::Close(frame) => {
                return Err(TransportError::HandshakeRejected(close_reason(frame.as_ref())));
            }
            _ => {}
        }
    }
    Err(TransportError::ConnectionLost("socket closed during handshake".to_string()))
}

fn close_reason(frame: Option<&CloseFrame>) -> String {
    frame
        .map(|f| f.reason.as_str().to_string())
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| "no reason given".to_string())
}

/// Resolves once `stop()` has been requested or the connection was dropped.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

/// How a single socket ended.
enum SocketOutcome {
    Stopped,
    /// The hub closed the connection and does not want a reconnect.
    Closed(Option<TransportError>),
    Failed(TransportError),
}

enum Recovery {
    Recovered(HubSocket, Vec<String>),
    Stopped,
    GaveUp(TransportError),
}

/// A lifecycle callback raised before any handlers were installed.
enum LifecycleEvent {
    Close(Option<TransportError>),
    Reconnecting(Option<TransportError>),
    Reconnected(Option<String>),
}

impl LifecycleEvent {
    fn deliver(self, handlers: &LifecycleHandlers) {
        match self {
            LifecycleEvent::Close(error) => (handlers.on_close)(error),
            LifecycleEvent::Reconnecting(error) => (handlers.on_reconnecting)(error),
            LifecycleEvent::Reconnected(id) => (handlers.on_reconnected)(id),
        }
    }
}

/// Installed handlers, or the events they missed so far.
#[derive(Default)]
struct Lifecycle {
    handlers: Option<LifecycleHandlers>,
    missed: Vec<LifecycleEvent>,
}

struct PendingInvocation {
    method: String,
    reply: oneshot::Sender<Result<Value, TransportError>>,
}

/// State shared between a `LiveConnection` handle and its supervisor task.
struct Shared {
    endpoint: Url,
    settings: TransportSettings,
    credentials: Arc<dyn CredentialSource>,
    policy: ReconnectPolicy,
    listeners: Mutex<HashMap<String, WireHandler>>,
    lifecycle: Mutex<Lifecycle>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<String, PendingInvocation>>,
    next_invocation_id: AtomicU64,
    connection_id: Mutex<Option<String>>,
}

/// A hub connection over a WebSocket, recovered transparently by a supervisor
/// task when the socket drops.
pub struct LiveConnection {
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl LiveConnection {
    fn start(
        endpoint: Url,
        settings: TransportSettings,
        credentials: Arc<dyn CredentialSource>,
        socket: HubSocket,
        backlog: Vec<String>,
    ) -> Self {
        let policy = ReconnectPolicy::new(settings.max_reconnect_attempts);
        let shared = Arc::new(Shared {
            endpoint,
            settings,
            credentials,
            policy,
            listeners: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_invocation_id: AtomicU64::new(0),
            connection_id: Mutex::new(Some(Uuid::new_v4().to_string())),
        });

        let outbound = shared.open_outbound();
        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), socket, backlog, outbound, stop_rx));

        Self {
            shared,
            stop_tx,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }
}

#[async_trait]
impl HubConnection for LiveConnection {
    fn connection_id(&self) -> Option<String> {
        lock(&self.shared.connection_id).clone()
    }

    fn on(&self, event: &str, handler: WireHandler) {
        lock(&self.shared.listeners).insert(event.to_ascii_lowercase(), handler);
    }

    fn off(&self, event: &str) {
        lock(&self.shared.listeners).remove(&event.to_ascii_lowercase());
    }

    /// Events the supervisor raised before this call are replayed, in order,
    /// to the new handlers.
    fn set_lifecycle(&self, handlers: LifecycleHandlers) {
        let mut lifecycle = lock(&self.shared.lifecycle);
        for event in std::mem::take(&mut lifecycle.missed) {
            event.deliver(&handlers);
        }
        lifecycle.handlers = Some(handlers);
    }

    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, TransportError> {
        let id = self
            .shared
            .next_invocation_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (reply, response) = oneshot::channel();
        lock(&self.shared.pending).insert(
            id.clone(),
            PendingInvocation {
                method: method.to_string(),
                reply,
            },
        );

        let frame = Message::text(protocol::encode_invocation(&id, method, &arguments));
        let sent = lock(&self.shared.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok());
        if !sent {
            lock(&self.shared.pending).remove(&id);
            return Err(TransportError::NotConnected);
        }

        tracing::debug!(method, invocation_id = %id, "Invoked hub method.");
        response.await.unwrap_or_else(|_| {
            Err(TransportError::ConnectionLost(format!(
                "invocation of '{}' was abandoned",
                method
            )))
        })
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let supervisor = lock(&self.supervisor).take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Hub supervisor task ended abnormally.");
            }
        }
    }
}

/// Owns the socket for the lifetime of the connection: pumps frames, and on
/// an unexpected drop walks the reconnect policy before reporting a close.
async fn supervise(
    shared: Arc<Shared>,
    mut socket: HubSocket,
    mut backlog: Vec<String>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let outcome = shared.pump(socket, backlog, outbound, &mut stop_rx).await;
        shared.close_outbound();

        match outcome {
            SocketOutcome::Stopped => {
                shared.fail_pending("connection stopped");
                tracing::info!("Hub socket closed.");
                shared.fire_close(None);
                return;
            }
            SocketOutcome::Closed(error) => {
                shared.fail_pending("connection closed by the hub");
                tracing::warn!(error = ?error, "Hub closed the connection.");
                shared.fire_close(error);
                return;
            }
            SocketOutcome::Failed(error) => {
                shared.fail_pending(&error.to_string());
                tracing::warn!(error = %error, "Hub socket dropped. Reconnecting...");
                shared.fire_reconnecting(Some(error.clone()));

                match shared.recover(error, &mut stop_rx).await {
                    Recovery::Recovered(new_socket, new_backlog) => {
                        let id = Uuid::new_v4().to_string();
                        *lock(&shared.connection_id) = Some(id.clone());
                        outbound = shared.open_outbound();
                        socket = new_socket;
                        backlog = new_backlog;
                        shared.fire_reconnected(Some(id));
                    }
                    Recovery::Stopped => {
                        shared.fire_close(None);
                        return;
                    }
                    Recovery::GaveUp(error) => {
                        tracing::error!(error = %error, "Hub reconnect attempts exhausted.");
                        shared.fire_close(Some(error));
                        return;
                    }
                }
            }
        }
    }
}

impl Shared {
    fn open_outbound(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.outbound) = Some(tx);
        rx
    }

    fn close_outbound(&self) {
        lock(&self.outbound).take();
    }

    async fn pump(
        &self,
        socket: HubSocket,
        backlog: Vec<String>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> SocketOutcome {
        let (mut sink, mut stream) = socket.split();

        for record in &backlog {
            if let Some(outcome) = self.handle_record(record) {
                let _ = sink.close().await;
                return outcome;
            }
        }

        let keep_alive = self.settings.keep_alive_interval();
        let server_timeout = self.settings.server_timeout();
        let mut ping = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
        let mut deadline = Instant::now() + server_timeout;

        let outcome = loop {
            tokio::select! {
                _ = stop_requested(stop_rx) => {
                    let _ = sink.send(Message::text(protocol::encode_close())).await;
                    break SocketOutcome::Stopped;
                }
                Some(message) = outbound.recv() => {
                    if let Err(e) = sink.send(message).await {
                        break SocketOutcome::Failed(TransportError::ConnectionLost(e.to_string()));
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Message::text(protocol::encode_ping())).await {
                        break SocketOutcome::Failed(TransportError::ConnectionLost(e.to_string()));
                    }
                }
                _ = sleep_until(deadline) => {
                    break SocketOutcome::Failed(TransportError::ServerTimeout(server_timeout));
                }
                frame = stream.next() => {
                    deadline = Instant::now() + server_timeout;
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(outcome) = self.handle_frame(text.as_str()) {
                                break outcome;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break SocketOutcome::Failed(TransportError::ConnectionLost(close_reason(frame.as_ref())));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break SocketOutcome::Failed(TransportError::ConnectionLost(e.to_string()));
                        }
                        None => {
                            break SocketOutcome::Failed(TransportError::ConnectionLost("socket closed by peer".to_string()));
                        }
                    }
                }
            }
        };

        let _ = sink.close().await;
        outcome
    }

    fn handle_frame(&self, text: &str) -> Option<SocketOutcome> {
        protocol::split_records(text).find_map(|record| self.handle_record(record))
    }

    fn handle_record(&self, record: &str) -> Option<SocketOutcome> {
        match protocol::parse_message(record) {
            Ok(HubMessage::Invocation { target, arguments, .. }) => self.deliver(&target, arguments),
            Ok(HubMessage::Completion {
                invocation_id,
                result,
                error,
            }) => self.complete(&invocation_id, result, error),
            Ok(HubMessage::Ping) => {}
            Ok(HubMessage::Close {
                error,
                allow_reconnect,
            }) => {
                let error = error.map(TransportError::ServerClosed);
                return Some(match (error, allow_reconnect) {
                    (Some(error), true) => SocketOutcome::Failed(error),
                    (None, true) => SocketOutcome::Failed(TransportError::ServerClosed(
                        "hub requested a reconnect".to_string(),
                    )),
                    (error, false) => SocketOutcome::Closed(error),
                });
            }
            Ok(HubMessage::Other(kind)) => {
                tracing::debug!(kind, "Ignoring unsupported hub message type.");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed hub record.");
            }
        }
        None
    }

    fn deliver(&self, target: &str, arguments: Vec<Value>) {
        let handler = lock(&self.listeners).get(&target.to_ascii_lowercase()).cloned();
        match handler {
            Some(handler) => handler(arguments),
            None => tracing::debug!(target, "No wire listener for hub event; dropping it."),
        }
    }

    fn complete(&self, invocation_id: &str, result: Value, error: Option<String>) {
        let Some(pending) = lock(&self.pending).remove(invocation_id) else {
            tracing::debug!(invocation_id, "Completion for an unknown invocation.");
            return;
        };
        let outcome = match error {
            Some(message) => Err(TransportError::Invocation {
                method: pending.method,
                message,
            }),
            None => Ok(result),
        };
        let _ = pending.reply.send(outcome);
    }

    fn fail_pending(&self, reason: &str) {
        let pending: Vec<PendingInvocation> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for invocation in pending {
            let _ = invocation
                .reply
                .send(Err(TransportError::ConnectionLost(reason.to_string())));
        }
    }

    async fn recover(&self, mut last_error: TransportError, stop_rx: &mut watch::Receiver<bool>) -> Recovery {
        let mut attempt = 0;
        loop {
            let Some(delay) = self.policy.next_delay(attempt) else {
                return Recovery::GaveUp(last_error);
            };
            tokio::select! {
                _ = stop_requested(stop_rx) => return Recovery::Stopped,
                _ = sleep(delay) => {}
            }
            attempt += 1;

            let Some(token) = self.credentials.bearer_token() else {
                tracing::warn!(attempt, "Hub reconnect skipped: no bearer token available.");
                last_error = TransportError::Connect("no bearer token available".to_string());
                continue;
            };
            let url = match socket_url(&self.endpoint, &token) {
                Ok(url) => url,
                Err(e) => return Recovery::GaveUp(e),
            };

            tokio::select! {
                _ = stop_requested(stop_rx) => return Recovery::Stopped,
                result = open_socket(&url, self.settings.handshake_timeout()) => match result {
                    Ok((socket, backlog)) => {
                        tracing::info!(attempt, "Hub socket re-established.");
                        return Recovery::Recovered(socket, backlog);
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "Hub reconnect attempt failed.");
                        last_error = e;
                    }
                }
            }
        }
    }

    fn fire_close(&self, error: Option<TransportError>) {
        self.fire(LifecycleEvent::Close(error));
    }

    fn fire_reconnecting(&self, error: Option<TransportError>) {
        self.fire(LifecycleEvent::Reconnecting(error));
    }

    fn fire_reconnected(&self, connection_id: Option<String>) {
        self.fire(LifecycleEvent::Reconnected(connection_id));
    }

    /// Handlers run under the lifecycle lock so a replay in `set_lifecycle`
    /// and a live event cannot interleave.
    fn fire(&self, event: LifecycleEvent) {
        let mut guard = lock(&self.lifecycle);
        let lifecycle = &mut *guard;
        match &lifecycle.handlers {
            Some(handlers) => event.deliver(handlers),
            None => lifecycle.missed.push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_switches_scheme_and_adds_token() {
        let endpoint = Url::parse("https://api.example.com/stockHub").unwrap();
        let url = socket_url(&endpoint, "abc def").unwrap();
        assert_eq!(url.as_str(), "wss://api.example.com/stockHub?access_token=abc+def");

        let endpoint = Url::parse("http://localhost:5000/stockHub").unwrap();
        assert_eq!(socket_url(&endpoint, "t").unwrap().scheme(), "ws");
    }

    #[test]
    fn socket_url_rejects_other_schemes() {
        let endpoint = Url::parse("ftp://example.com/hub").unwrap();
        assert!(matches!(socket_url(&endpoint, "t"), Err(TransportError::Connect(_))));
    }
}
