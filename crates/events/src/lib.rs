//! # StockHub Events
//!
//! This crate defines the broadcast channel that decouples the hub client from
//! UI code, and the event structures carried on it.
//!
//! As a Layer 0 crate, it depends only on `core-types` and provides the definitive
//! language every collaborator listens to: connection-status changes, per-exchange
//! price updates, index updates, price alerts and news.

// Declare the modules that make up this crate.
pub mod bus;
pub mod error;
pub mod messages;

// Re-export the core types to provide a clean public API.
pub use bus::{EventBus, NamedReceiver};
pub use error::EventsError;
pub use messages::{
    ConnectionStatusChange, IndexUpdate, MarketEvent, NewsUpdate, PriceAlert, PriceUpdate,
};
