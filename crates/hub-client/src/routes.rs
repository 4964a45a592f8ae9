//! Event-name routing: which family an event belongs to and which exchange it
//! speaks for, decided once when the event is first subscribed.

use configuration::RouteSettings;
use core_types::{EventFamily, Exchange};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Event names pushed by the stock hub.
pub mod names {
    pub const HSX_STOCK_UPDATE: &str = "ReceiveHSXStockUpdate";
    pub const HNX_STOCK_UPDATE: &str = "ReceiveHNXStockUpdate";
    pub const UPCOM_STOCK_UPDATE: &str = "ReceiveUPCOMStockUpdate";
    pub const MARKET_INDEX_UPDATE: &str = "ReceiveMarketIndexUpdate";
    pub const PRICE_ALERT: &str = "ReceivePriceAlert";
    pub const NOTIFICATION: &str = "ReceiveNotification";
    pub const NEWS_UPDATE: &str = "ReceiveNewsUpdate";

    /// Everything the `watch` command listens to by default.
    pub const ALL: [&str; 7] = [
        HSX_STOCK_UPDATE,
        HNX_STOCK_UPDATE,
        UPCOM_STOCK_UPDATE,
        MARKET_INDEX_UPDATE,
        PRICE_ALERT,
        NOTIFICATION,
        NEWS_UPDATE,
    ];
}

/// Where an event name leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRoute {
    pub family: EventFamily,
    /// `None` when the exchange must be read from the payload itself.
    pub exchange: Option<Exchange>,
    /// Whether the route came from the table rather than being inferred.
    pub known: bool,
}

impl EventRoute {
    pub const fn new(family: EventFamily, exchange: Option<Exchange>) -> Self {
        Self {
            family,
            exchange,
            known: true,
        }
    }

    /// The route for an event name no table entry covers.
    pub fn inferred(event_name: &str) -> Self {
        Self {
            family: EventFamily::Other,
            exchange: Exchange::find_in(event_name),
            known: false,
        }
    }
}

/// Case-insensitive map from event name to route.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, EventRoute>,
}

impl RouteTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The routes for the events the hub is known to push.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (name, family, exchange) in [
            (names::HSX_STOCK_UPDATE, EventFamily::PriceUpdate, Some(Exchange::Hsx)),
            (names::HNX_STOCK_UPDATE, EventFamily::PriceUpdate, Some(Exchange::Hnx)),
            (names::UPCOM_STOCK_UPDATE, EventFamily::PriceUpdate, Some(Exchange::Upcom)),
            (names::MARKET_INDEX_UPDATE, EventFamily::IndexUpdate, None),
            (names::PRICE_ALERT, EventFamily::PriceAlert, None),
            (names::NOTIFICATION, EventFamily::PriceAlert, None),
            (names::NEWS_UPDATE, EventFamily::News, None),
        ] {
            table.insert(name, EventRoute::new(family, exchange));
        }
        table
    }

    /// The built-in table extended (or overridden) by configured routes.
    pub fn with_overrides(overrides: &[RouteSettings]) -> Self {
        let mut table = Self::builtin();
        for route in overrides {
            table.insert(&route.event, EventRoute::new(route.family, route.exchange));
        }
        table
    }

    pub fn insert(&mut self, event_name: &str, route: EventRoute) {
        self.routes.insert(event_name.to_ascii_lowercase(), route);
    }

    pub fn get(&self, event_name: &str) -> Option<EventRoute> {
        self.routes.get(&event_name.to_ascii_lowercase()).copied()
    }

    /// The route for `event_name`, inferred when the table has no entry.
    pub fn resolve(&self, event_name: &str) -> EventRoute {
        self.get(event_name)
            .unwrap_or_else(|| EventRoute::inferred(event_name))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

static BUILTIN: Lazy<RouteTable> = Lazy::new(RouteTable::builtin);

/// The shared built-in table.
pub fn builtin_routes() -> &'static RouteTable {
    &BUILTIN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_routes_cover_every_hub_event() {
        let table = builtin_routes();
        assert_eq!(table.len(), names::ALL.len());

        let hnx = table.resolve("ReceiveHNXStockUpdate");
        assert_eq!(hnx.family, EventFamily::PriceUpdate);
        assert_eq!(hnx.exchange, Some(Exchange::Hnx));

        let alert = table.resolve(names::NOTIFICATION);
        assert_eq!(alert, EventRoute::new(EventFamily::PriceAlert, None));
    }

    #[test]
    fn lookup_ignores_case() {
        let route = builtin_routes().resolve("receiveupcomstockupdate");
        assert_eq!(route.exchange, Some(Exchange::Upcom));
        assert!(route.known);
    }

    #[test]
    fn unknown_names_infer_the_exchange() {
        let route = builtin_routes().resolve("HnxDerivativeTick");
        assert_eq!(route.family, EventFamily::Other);
        assert_eq!(route.exchange, Some(Exchange::Hnx));
        assert!(!route.known);

        assert_eq!(builtin_routes().resolve("Heartbeat").exchange, None);
    }

    #[test]
    fn configured_routes_extend_and_override() {
        let table = RouteTable::with_overrides(&[
            RouteSettings {
                event: "ReceiveDerivativeUpdate".into(),
                family: EventFamily::PriceUpdate,
                exchange: Some(Exchange::Hnx),
            },
            RouteSettings {
                event: "ReceiveNewsUpdate".into(),
                family: EventFamily::News,
                exchange: Some(Exchange::Hsx),
            },
        ]);
        assert_eq!(
            table.resolve("ReceiveDerivativeUpdate"),
            EventRoute::new(EventFamily::PriceUpdate, Some(Exchange::Hnx))
        );
        assert_eq!(table.resolve("ReceiveNewsUpdate").exchange, Some(Exchange::Hsx));
        assert_eq!(table.len(), names::ALL.len() + 1);
    }
}
