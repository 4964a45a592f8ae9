//! Real-time client for the stock hub.
//!
//! A [`HubClient`] keeps one auto-reconnecting connection to the hub, fans the
//! events it pushes out to subscribed consumers and republishes them on the
//! process-wide [`events::EventBus`].
//!
//! Layers, each depending only on the ones before it:
//! - [`session`]: the single upstream connection, its phases and retry ceiling.
//! - [`registry`]: event name → consumers, replayed on every (re)connect.
//! - [`normalizer`]: raw payload → [`core_types::NormalizedEvent`].
//! - [`dispatch`]: isolated consumer calls and broadcast republishing.

pub mod client;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod live_connector;
pub mod mock;
pub mod normalizer;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod routes;
pub mod session;
pub mod transport;

pub use client::{HubClient, InvokeOutcome};
pub use credentials::{CredentialSource, EnvToken, FileToken, StaticToken};
pub use dispatch::{Consumer, DispatchBridge, Subscriber, consumer};
pub use error::{SessionError, TransportError};
pub use live_connector::LiveConnector;
pub use normalizer::normalize;
pub use registry::SubscriptionRegistry;
pub use routes::{EventRoute, RouteTable, names};
pub use session::{ConnectionStatus, SessionConfig, SessionObserver, TransportSession};
pub use transport::{ConnectionHandle, Connector, HubConnection};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
/// Every critical section in this crate leaves its data consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
