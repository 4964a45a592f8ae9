//! The transport session: owns the single upstream hub connection, its
//! lifecycle phase and the session-level retry ceiling.

use crate::credentials::CredentialSource;
use crate::error::{SessionError, TransportError};
use crate::lock;
use crate::transport::{ConnectionHandle, Connector, HubConnection, LifecycleHandlers};
use configuration::Settings;
use core_types::ConnectionPhase;
use events::{EventBus, MarketEvent};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use url::Url;

/// Where to connect and how hard to try.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Url,
    /// The retry ceiling: consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Wait between failed attempts, and before the reconnect scheduled after
    /// an unexpected close.
    pub retry_delay: Duration,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, SessionError> {
        let raw = format!(
            "{}{}",
            settings.hub.base_url.trim_end_matches('/'),
            settings.hub.hub_path
        );
        let endpoint = Url::parse(&raw).map_err(|e| SessionError::InvalidEndpoint(format!("{}: {}", raw, e)))?;
        Ok(Self {
            endpoint,
            max_attempts: settings.session.max_attempts.max(1),
            retry_delay: settings.session.retry_delay(),
        })
    }
}

/// A snapshot of the session, as reported by `HubClient::is_connected`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub active: bool,
    pub failed: bool,
    pub attempts: u32,
    pub max_attempts: u32,
    pub phase: ConnectionPhase,
}

/// Notified when a connection becomes usable and before one is stopped.
///
/// The subscription registry implements this to replay and detach its wire
/// listeners.
pub trait SessionObserver: Send + Sync {
    fn connected(&self, connection: &ConnectionHandle);
    fn stopping(&self, connection: &ConnectionHandle);
}

type ConnectFuture = Shared<BoxFuture<'static, Result<ConnectionHandle, SessionError>>>;

#[derive(Default)]
struct State {
    connection: Option<ConnectionHandle>,
    phase: ConnectionPhase,
    attempts: u32,
    failed: bool,
    last_error: Option<SessionError>,
    in_flight: Option<ConnectFuture>,
    retry_timer: Option<JoinHandle<()>>,
    /// Bumped by `stop()`; attempts started under an older epoch are discarded.
    epoch: u64,
}

impl State {
    fn is_current(&self, connection: &Weak<dyn HubConnection>) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), connection.as_ptr()))
    }
}

pub struct TransportSession {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    bus: EventBus,
    observer: Mutex<Option<Weak<dyn SessionObserver>>>,
    state: Mutex<State>,
    this: Weak<TransportSession>,
}

impl TransportSession {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            connector,
            credentials,
            bus,
            observer: Mutex::new(None),
            state: Mutex::new(State::default()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_observer(&self, observer: Weak<dyn SessionObserver>) {
        *lock(&self.observer) = Some(observer);
    }

    /// Connects, or joins the attempt already in flight.
    ///
    /// Returns the live handle straight away when connected (or while the
    /// transport is recovering it). Otherwise attempts are made until one
    /// succeeds or the retry ceiling is reached, after which the session stays
    /// failed until `connect()` is called again.
    pub async fn connect(&self) -> Result<ConnectionHandle, SessionError> {
        let future = {
            let mut state = lock(&self.state);
            if let Some(connection) = &state.connection {
                return Ok(Arc::clone(connection));
            }
            match &state.in_flight {
                Some(in_flight) => in_flight.clone(),
                None => {
                    if state.failed {
                        state.failed = false;
                        state.attempts = 0;
                    }
                    state.phase = ConnectionPhase::Connecting;
                    let epoch = state.epoch;
                    let session = self.this.clone();
                    let future = async move {
                        match session.upgrade() {
                            Some(session) => session.run_attempts(epoch).await,
                            None => Err(SessionError::Stopped),
                        }
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some(future.clone());
                    future
                }
            }
        };
        future.await
    }

    /// The live connection, if there is one.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        lock(&self.state).connection.clone()
    }

    /// The error behind the latest failed attempt or unexpected close.
    pub fn last_error(&self) -> Option<SessionError> {
        lock(&self.state).last_error.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = lock(&self.state);
        ConnectionStatus {
            active: state.connection.is_some() && state.phase == ConnectionPhase::Connected,
            failed: state.failed,
            attempts: state.attempts,
            max_attempts: self.config.max_attempts,
            phase: state.phase,
        }
    }

    /// Detaches every wire listener, closes the connection, cancels a pending
    /// reconnect and returns the session to `Idle`. Idempotent.
    pub async fn stop(&self) {
        let (connection, timer, previous) = {
            let mut state = lock(&self.state);
            state.epoch += 1;
            state.in_flight = None;
            state.attempts = 0;
            state.failed = false;
            state.last_error = None;
            let previous = std::mem::replace(&mut state.phase, ConnectionPhase::Idle);
            (state.connection.take(), state.retry_timer.take(), previous)
        };

        if let Some(timer) = timer {
            timer.abort();
            tracing::debug!("Cancelled the pending hub reconnect.");
        }

        if let Some(connection) = connection {
            if let Some(observer) = self.observer() {
                observer.stopping(&connection);
            }
            connection.stop().await;
            tracing::info!("Hub connection stopped.");
        }

        if previous != ConnectionPhase::Idle {
            self.publish_status(ConnectionPhase::Idle, None);
        }
    }

    async fn run_attempts(&self, epoch: u64) -> Result<ConnectionHandle, SessionError> {
        self.publish_status(ConnectionPhase::Connecting, None);

        loop {
            let attempt = {
                let mut state = lock(&self.state);
                if state.epoch != epoch {
                    return Err(SessionError::Stopped);
                }
                state.attempts += 1;
                state.attempts
            };
            tracing::info!(attempt, max_attempts = self.config.max_attempts, endpoint = %self.config.endpoint, "Connecting to hub...");

            let error = match self.attempt().await {
                Ok(connection) => return self.install(connection, epoch).await,
                Err(error) => error,
            };
            tracing::warn!(attempt, error = %error, "Hub connection attempt failed.");

            let exhausted = {
                let mut state = lock(&self.state);
                if state.epoch != epoch {
                    return Err(SessionError::Stopped);
                }
                state.last_error = Some(error.clone());
                if state.attempts >= self.config.max_attempts {
                    state.failed = true;
                    state.in_flight = None;
                    state.phase = ConnectionPhase::Disconnected;
                    Some(state.attempts)
                } else {
                    None
                }
            };

            if let Some(attempts) = exhausted {
                tracing::error!(attempts, error = %error, "Giving up on the hub until connect() is called again.");
                self.publish_status(ConnectionPhase::Disconnected, Some(error.to_string()));
                return Err(SessionError::MaxAttemptsExceeded {
                    attempts,
                    last: Box::new(error),
                });
            }
            sleep(self.config.retry_delay).await;
        }
    }

    async fn attempt(&self) -> Result<ConnectionHandle, SessionError> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or(SessionError::MissingCredential)?;
        Ok(self.connector.connect(&self.config.endpoint, &token).await?)
    }

    async fn install(&self, connection: ConnectionHandle, epoch: u64) -> Result<ConnectionHandle, SessionError> {
        let installed = {
            let mut state = lock(&self.state);
            if state.epoch != epoch {
                false
            } else {
                state.connection = Some(Arc::clone(&connection));
                state.phase = ConnectionPhase::Connected;
                state.attempts = 0;
                state.failed = false;
                state.last_error = None;
                state.in_flight = None;
                true
            }
        };

        if !installed {
            tracing::info!("Discarding a hub connection that completed after stop().");
            connection.stop().await;
            return Err(SessionError::Stopped);
        }

        tracing::info!(connection_id = ?connection.connection_id(), "Connected to hub.");
        self.publish_status(ConnectionPhase::Connected, None);
        self.notify_connected(&connection);
        // Last, so a close the transport saw during the handshake is the
        // final transition rather than being overwritten by `Connected`.
        connection.set_lifecycle(self.lifecycle_handlers(&connection));
        Ok(connection)
    }

    fn lifecycle_handlers(&self, connection: &ConnectionHandle) -> LifecycleHandlers {
        let on_close = {
            let session = self.this.clone();
            let connection = Arc::downgrade(connection);
            Arc::new(move |error: Option<TransportError>| {
                if let Some(session) = session.upgrade() {
                    session.handle_close(&connection, error);
                }
            })
        };
        let on_reconnecting = {
            let session = self.this.clone();
            let connection = Arc::downgrade(connection);
            Arc::new(move |error: Option<TransportError>| {
                if let Some(session) = session.upgrade() {
                    session.handle_reconnecting(&connection, error);
                }
            })
        };
        let on_reconnected = {
            let session = self.this.clone();
            let connection = Arc::downgrade(connection);
            Arc::new(move |connection_id: Option<String>| {
                if let Some(session) = session.upgrade() {
                    session.handle_reconnected(&connection, connection_id);
                }
            })
        };
        LifecycleHandlers {
            on_close,
            on_reconnecting,
            on_reconnected,
        }
    }

    fn handle_close(&self, connection: &Weak<dyn HubConnection>, error: Option<TransportError>) {
        {
            let mut state = lock(&self.state);
            if !state.is_current(connection) {
                tracing::debug!("Ignoring close from a stale hub connection.");
                return;
            }
            state.connection = None;
            match &error {
                Some(error) => {
                    state.phase = ConnectionPhase::Disconnected;
                    state.last_error = Some(SessionError::Transport(error.clone()));
                    self.schedule_retry(&mut state);
                }
                None => {
                    state.phase = ConnectionPhase::Idle;
                    state.attempts = 0;
                }
            }
        }

        match error {
            Some(error) => {
                tracing::warn!(error = %error, retry_in = ?self.config.retry_delay, "Hub connection closed with an error.");
                self.publish_status(ConnectionPhase::Disconnected, Some(error.to_string()));
            }
            None => {
                tracing::info!("Hub connection closed.");
                self.publish_status(ConnectionPhase::Idle, None);
            }
        }
    }

    fn handle_reconnecting(&self, connection: &Weak<dyn HubConnection>, error: Option<TransportError>) {
        {
            let mut state = lock(&self.state);
            if !state.is_current(connection) {
                return;
            }
            state.phase = ConnectionPhase::Reconnecting;
        }
        tracing::warn!(error = ?error, "Hub transport is reconnecting.");
        self.publish_status(ConnectionPhase::Reconnecting, error.map(|e| e.to_string()));
    }

    fn handle_reconnected(&self, connection: &Weak<dyn HubConnection>, connection_id: Option<String>) {
        let current = {
            let mut state = lock(&self.state);
            if !state.is_current(connection) {
                return;
            }
            state.phase = ConnectionPhase::Connected;
            state.attempts = 0;
            state.connection.clone()
        };
        tracing::info!(connection_id = ?connection_id, "Hub transport reconnected.");
        self.publish_status(ConnectionPhase::Connected, None);
        if let Some(connection) = current {
            self.notify_connected(&connection);
        }
    }

    /// Spawns the single delayed `connect()` that follows an unexpected close.
    fn schedule_retry(&self, state: &mut State) {
        if state
            .retry_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
        {
            tracing::debug!("A hub reconnect is already pending.");
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("No async runtime to schedule the hub reconnect on.");
            return;
        };

        let session = self.this.clone();
        let delay = self.config.retry_delay;
        let epoch = state.epoch;
        state.retry_timer = Some(runtime.spawn(async move {
            sleep(delay).await;
            if let Some(session) = session.upgrade() {
                session.retry_after_close(epoch).await;
            }
        }));
    }

    async fn retry_after_close(&self, epoch: u64) {
        {
            let mut state = lock(&self.state);
            if state.epoch != epoch || state.failed {
                return;
            }
            state.retry_timer = None;
        }
        tracing::info!("Reconnecting to hub after an unexpected close.");
        if let Err(e) = self.connect().await {
            tracing::warn!(error = %e, "Scheduled hub reconnect failed.");
        }
    }

    fn observer(&self) -> Option<Arc<dyn SessionObserver>> {
        lock(&self.observer).as_ref().and_then(Weak::upgrade)
    }

    fn notify_connected(&self, connection: &ConnectionHandle) {
        if let Some(observer) = self.observer() {
            observer.connected(connection);
        }
    }

    fn publish_status(&self, phase: ConnectionPhase, error: Option<String>) {
        self.bus.publish(MarketEvent::connection_status(phase, error));
    }
}
