use crate::error::ConfigError;
use core_types::{EventFamily, Exchange};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// The root configuration structure for the hub client.
///
/// Every section is optional in `config.toml`; omitted values fall back to the
/// defaults below, which mirror the behaviour the dashboard shipped with.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub hub: HubSettings,
    pub session: SessionSettings,
    pub transport: TransportSettings,
    pub broadcast: BroadcastSettings,
    pub credentials: CredentialSettings,
    pub logging: LoggingSettings,
    /// Extra event routes layered on top of the built-in route table.
    pub routes: Vec<RouteSettings>,
}

/// Where the hub lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Base URL of the API host (e.g. "https://api.example.com").
    pub base_url: String,
    /// Fixed sub-path identifying the hub on that host.
    pub hub_path: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            hub_path: "/stockHub".to_string(),
        }
    }
}

/// Session-level retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Consecutive failed handshakes before the session gives up.
    pub max_attempts: u32,
    /// Fixed delay before a session-level reconnect.
    pub retry_delay_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 5_000,
        }
    }
}

impl SessionSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Socket-level timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub handshake_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub server_timeout_ms: u64,
    /// Transport reconnect attempts before the connection reports a close.
    /// `None` keeps retrying forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 15_000,
            keep_alive_interval_ms: 15_000,
            server_timeout_ms: 30_000,
            max_reconnect_attempts: None,
        }
    }
}

impl TransportSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Buffered events per broadcast receiver before it starts lagging.
    pub capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Where the bearer token is read from. `token_file` wins over `token_env`
/// when both are set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    pub token_env: String,
    pub token_file: Option<PathBuf>,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            token_env: "STOCKHUB_TOKEN".to_string(),
            token_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// When set, logs are also written to a daily-rolling file in this directory.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "stockhub.log".to_string(),
        }
    }
}

/// One extra entry for the event route table.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSettings {
    pub event: String,
    pub family: EventFamily,
    #[serde(default)]
    pub exchange: Option<Exchange>,
}

impl Settings {
    /// Checks the invariants the rest of the client relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.hub.base_url).map_err(|e| {
            ConfigError::ValidationError(format!("hub.base_url '{}' is invalid: {}", self.hub.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(ConfigError::ValidationError(format!(
                "hub.base_url must use http, https, ws or wss, got '{}'",
                url.scheme()
            )));
        }
        if !self.hub.hub_path.starts_with('/') {
            return Err(ConfigError::ValidationError(
                "hub.hub_path must start with '/'".to_string(),
            ));
        }
        if self.session.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.transport.server_timeout_ms <= self.transport.keep_alive_interval_ms {
            return Err(ConfigError::ValidationError(
                "transport.server_timeout_ms must be greater than transport.keep_alive_interval_ms"
                    .to_string(),
            ));
        }
        if self.broadcast.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "broadcast.capacity must be at least 1".to_string(),
            ));
        }
        if let Some(route) = self.routes.iter().find(|r| r.event.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "route for family {:?} has an empty event name",
                route.family
            )));
        }
        Ok(())
    }
}
