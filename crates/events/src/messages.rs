use crate::error::EventsError;
use chrono::{DateTime, Utc};
use core_types::{ConnectionPhase, NormalizedEvent};
use serde::{Deserialize, Serialize};

/// A change of the hub connection's lifecycle phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatusChange {
    pub status: ConnectionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A per-exchange price tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// The wire event name the tick arrived on.
    pub source: String,
    /// Lower-case exchange tag, e.g. `"hsx"`.
    pub exchange: String,
    pub timestamp: DateTime<Utc>,
    pub data: NormalizedEvent,
}

/// A market index update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexUpdate {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: NormalizedEvent,
}

/// A price-alert notification addressed to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub source: String,
    pub message: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub exchange: String,
}

/// A news headline update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsUpdate {
    pub source: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    pub data: NormalizedEvent,
}

/// The top-level broadcast message enum.
/// Everything UI collaborators hear from the hub client is one of these variants.
///
/// Serialized with `#[serde(tag = "type", content = "payload")]`, so a status
/// change looks like:
/// `{
///   "type": "ConnectionStatus",
///   "payload": { "status": "connected", "timestamp": "..." }
/// }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MarketEvent {
    ConnectionStatus(ConnectionStatusChange),
    PriceUpdate(PriceUpdate),
    IndexUpdate(IndexUpdate),
    PriceAlert(PriceAlert),
    NewsUpdate(NewsUpdate),
}

impl MarketEvent {
    pub const CONNECTION_STATUS: &'static str = "connection-status";
    pub const PRICE_UPDATE: &'static str = "price-update";
    pub const INDEX_UPDATE: &'static str = "index-update";
    pub const PRICE_ALERT: &'static str = "price-alert";
    pub const NEWS_UPDATE: &'static str = "news-update";

    /// The stable channel name collaborators filter on.
    pub fn name(&self) -> &'static str {
        match self {
            MarketEvent::ConnectionStatus(_) => Self::CONNECTION_STATUS,
            MarketEvent::PriceUpdate(_) => Self::PRICE_UPDATE,
            MarketEvent::IndexUpdate(_) => Self::INDEX_UPDATE,
            MarketEvent::PriceAlert(_) => Self::PRICE_ALERT,
            MarketEvent::NewsUpdate(_) => Self::NEWS_UPDATE,
        }
    }

    pub fn connection_status(status: ConnectionPhase, error: Option<String>) -> Self {
        MarketEvent::ConnectionStatus(ConnectionStatusChange {
            status,
            error,
            timestamp: Utc::now(),
        })
    }

    pub fn to_json(&self) -> Result<String, EventsError> {
        serde_json::to_string(self).map_err(|e| EventsError::Serialization(e.to_string()))
    }
}
