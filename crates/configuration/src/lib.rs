use crate::error::ConfigError;
use std::path::Path;

// Declare the modules that make up this crate.
pub mod error;
pub mod logging;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use logging::init_tracing;
pub use settings::{
    BroadcastSettings, CredentialSettings, HubSettings, LoggingSettings, RouteSettings,
    SessionSettings, Settings, TransportSettings,
};

/// Prefix for environment overrides, e.g. `STOCKHUB__HUB__BASE_URL`.
const ENV_PREFIX: &str = "STOCKHUB";

/// Loads the application configuration from `config.toml` in the working
/// directory (if present), layered with `STOCKHUB__*` environment variables.
///
/// This function is the primary entry point for this crate. It reads the configuration file,
/// deserializes it into our strongly-typed `Settings` struct, validates it, and returns it.
pub fn load_config() -> Result<Settings, ConfigError> {
    build(config::File::with_name("config.toml").required(false))
}

/// Same as [`load_config`] but for an explicit file, which must exist.
pub fn load_config_from(path: &Path) -> Result<Settings, ConfigError> {
    build(config::File::from(path).required(true))
}

fn build<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let builder = config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Attempt to deserialize the entire configuration into our `Settings` struct
    let settings = builder.try_deserialize::<Settings>()?;
    settings.validate()?;

    Ok(settings)
}
