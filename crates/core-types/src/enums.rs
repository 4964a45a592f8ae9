use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The exchange floor a market event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    #[serde(rename = "HSX", alias = "hsx", alias = "HOSE")]
    Hsx,
    #[serde(rename = "HNX", alias = "hnx")]
    Hnx,
    #[serde(rename = "UPCOM", alias = "upcom")]
    Upcom,
    Unknown,
}

impl Exchange {
    /// Exchanges that can be recognised inside an event name or message text.
    /// HNX is checked first so that a name mentioning it is never read as HSX.
    pub const KNOWN: [Exchange; 3] = [Exchange::Hnx, Exchange::Upcom, Exchange::Hsx];

    /// The upper-case code used on the wire (`"HSX"`).
    pub fn code(&self) -> &'static str {
        match self {
            Exchange::Hsx => "HSX",
            Exchange::Hnx => "HNX",
            Exchange::Upcom => "UPCOM",
            Exchange::Unknown => "Unknown",
        }
    }

    /// The lower-case source tag used on the broadcast channel (`"hsx"`).
    pub fn tag(&self) -> &'static str {
        match self {
            Exchange::Hsx => "hsx",
            Exchange::Hnx => "hnx",
            Exchange::Upcom => "upcom",
            Exchange::Unknown => "unknown",
        }
    }

    /// Finds the first known exchange code contained in `text`, ignoring case.
    pub fn find_in(text: &str) -> Option<Exchange> {
        let upper = text.to_ascii_uppercase();
        Self::KNOWN
            .into_iter()
            .find(|exchange| upper.contains(exchange.code()))
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Exchange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HSX" | "HOSE" => Ok(Exchange::Hsx),
            "HNX" => Ok(Exchange::Hnx),
            "UPCOM" => Ok(Exchange::Upcom),
            "UNKNOWN" => Ok(Exchange::Unknown),
            other => Err(CoreError::UnknownExchange(other.to_string())),
        }
    }
}

/// Lifecycle phase of the hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Reconnecting => "reconnecting",
            ConnectionPhase::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The family of hub events an event name belongs to. Decides how the
/// dispatch bridge republishes a normalized event on the broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFamily {
    PriceUpdate,
    IndexUpdate,
    PriceAlert,
    News,
    Other,
}
