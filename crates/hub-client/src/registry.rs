//! Event name → ordered consumer list, surviving reconnects.
//!
//! Each event name with at least one consumer has exactly one wire listener
//! on the current connection. Consumer lists outlive connections: `stop()`
//! detaches listeners but keeps the lists, and every (re)connect replays them.

use crate::dispatch::{Consumer, DispatchBridge, Subscriber};
use crate::lock;
use crate::routes::{EventRoute, RouteTable};
use crate::session::{SessionObserver, TransportSession};
use crate::transport::{ConnectionHandle, HubConnection, WireHandler};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

struct Entry {
    /// The spelling the event was first subscribed with.
    name: String,
    route: EventRoute,
    consumers: Vec<Arc<Subscriber>>,
    /// The connection this entry's wire listener is installed on.
    listener: Option<Weak<dyn HubConnection>>,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

pub struct SubscriptionRegistry {
    session: Arc<TransportSession>,
    bridge: DispatchBridge,
    routes: RouteTable,
    entries: Entries,
}

impl SubscriptionRegistry {
    pub fn new(session: Arc<TransportSession>, bridge: DispatchBridge, routes: RouteTable) -> Self {
        Self {
            session,
            bridge,
            routes,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Appends `consumer` to the list for `event_name`, installing the wire
    /// listener if the event has none on the live connection.
    ///
    /// Returns `false` (and logs) when there is no live connection.
    pub fn subscribe(&self, event_name: &str, consumer: Consumer) -> bool {
        let Some(connection) = self.session.connection() else {
            tracing::warn!(event = event_name, "Cannot subscribe without a live hub connection.");
            return false;
        };

        let install = {
            let mut entries = lock(&self.entries);
            let entry = entries.entry(key(event_name)).or_insert_with(|| Entry {
                name: event_name.to_string(),
                route: self.routes.resolve(event_name),
                consumers: Vec::new(),
                listener: None,
            });
            entry.consumers.push(Subscriber::new(consumer));

            let wired = entry
                .listener
                .as_ref()
                .is_some_and(|listener| same_connection(listener, &connection));
            if !wired {
                entry.listener = Some(Arc::downgrade(&connection));
            }
            (!wired).then(|| entry.name.clone())
        };

        if let Some(name) = install {
            connection.on(&name, self.wire_handler(&name));
            tracing::debug!(event = %name, "Installed wire listener.");
        }
        true
    }

    /// Removes `consumer` (every registration of that same `Arc`) from the
    /// list, or the whole entry when `consumer` is `None`. The wire listener
    /// goes away once the list is empty; an emptied entry is kept.
    pub fn unsubscribe(&self, event_name: &str, consumer: Option<&Consumer>) {
        let detached = {
            let mut entries = lock(&self.entries);
            let key = key(event_name);
            match consumer {
                Some(target) => match entries.get_mut(&key) {
                    Some(entry) => {
                        entry.consumers.retain(|subscriber| !subscriber.wraps(target));
                        if entry.consumers.is_empty() {
                            entry.listener.take().map(|listener| (entry.name.clone(), listener))
                        } else {
                            None
                        }
                    }
                    None => None,
                },
                None => entries
                    .remove(&key)
                    .and_then(|entry| entry.listener.map(|listener| (entry.name, listener))),
            }
        };

        if let Some((name, listener)) = detached {
            if let Some(connection) = listener.upgrade() {
                connection.off(&name);
                tracing::debug!(event = %name, "Removed wire listener.");
            }
        }
    }

    /// Re-installs a fresh wire listener for every event with consumers on the
    /// session's current connection. Returns how many events were replayed.
    pub fn replay_all(&self) -> usize {
        match self.session.connection() {
            Some(connection) => self.replay_on(&connection),
            None => {
                tracing::debug!("No live hub connection to replay subscriptions on.");
                0
            }
        }
    }

    fn replay_on(&self, connection: &ConnectionHandle) -> usize {
        let names: Vec<String> = {
            let mut entries = lock(&self.entries);
            entries
                .values_mut()
                .filter(|entry| !entry.consumers.is_empty())
                .map(|entry| {
                    entry.listener = Some(Arc::downgrade(connection));
                    entry.name.clone()
                })
                .collect()
        };

        for name in &names {
            connection.off(name);
            connection.on(name, self.wire_handler(name));
        }
        if !names.is_empty() {
            tracing::info!(events = names.len(), "Replayed hub subscriptions.");
        }
        names.len()
    }

    /// Removes every wire listener from `connection`, keeping consumer lists.
    pub fn detach_all(&self, connection: &ConnectionHandle) {
        let names: Vec<String> = {
            let mut entries = lock(&self.entries);
            entries
                .values_mut()
                .map(|entry| {
                    entry.listener = None;
                    entry.name.clone()
                })
                .collect()
        };
        for name in &names {
            connection.off(name);
        }
        tracing::debug!(events = names.len(), "Detached wire listeners.");
    }

    /// Every event name with an entry, empty lists included.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.entries)
            .values()
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Consumers registered for `event_name`, or `None` when it has no entry.
    pub fn consumer_count(&self, event_name: &str) -> Option<usize> {
        lock(&self.entries)
            .get(&key(event_name))
            .map(|entry| entry.consumers.len())
    }

    /// Whether `event_name` has a wire listener on a connection that is still alive.
    pub fn is_wired(&self, event_name: &str) -> bool {
        lock(&self.entries)
            .get(&key(event_name))
            .and_then(|entry| entry.listener.as_ref())
            .is_some_and(|listener| listener.strong_count() > 0)
    }

    fn wire_handler(&self, event_name: &str) -> WireHandler {
        let entries = Arc::clone(&self.entries);
        let bridge = self.bridge.clone();
        let key = key(event_name);
        Arc::new(move |arguments: Vec<Value>| {
            let snapshot = lock(&entries)
                .get(&key)
                .map(|entry| (entry.name.clone(), entry.route, entry.consumers.clone()));
            match snapshot {
                Some((name, route, consumers)) => {
                    bridge.dispatch(&name, &route, &arguments, &consumers);
                }
                None => tracing::debug!(event = %key, "Wire message for an unsubscribed event."),
            }
        })
    }
}

impl SessionObserver for SubscriptionRegistry {
    fn connected(&self, connection: &ConnectionHandle) {
        self.replay_on(connection);
    }

    fn stopping(&self, connection: &ConnectionHandle) {
        self.detach_all(connection);
    }
}

fn key(event_name: &str) -> String {
    event_name.to_ascii_lowercase()
}

fn same_connection(listener: &Weak<dyn HubConnection>, connection: &ConnectionHandle) -> bool {
    std::ptr::addr_eq(listener.as_ptr(), Arc::as_ptr(connection))
}
