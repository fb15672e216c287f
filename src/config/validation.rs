//! Configuration validation logic.

use thiserror::Error;
use url::Url;

use crate::config::schema::ConnectorConfig;

/// Error type for configuration validation failures.
///
/// These are fatal: `Connector::connect` returns them synchronously and
/// starts nothing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("requires service_name")]
    MissingServiceName,

    #[error("requires service_url")]
    MissingServiceUrl,

    #[error("invalid service_url '{url}': {source}")]
    InvalidServiceUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("sliding window must be greater than 0")]
    InvalidWindow,

    #[error("connector already started")]
    AlreadyStarted,
}

/// Validate a ConnectorConfig and the requested sliding window, returning
/// the parsed service URL on success.
pub fn validate_config(config: &ConnectorConfig, window: usize) -> Result<Url, ConfigError> {
    if config.service_name.is_empty() {
        return Err(ConfigError::MissingServiceName);
    }

    if config.service_url.is_empty() {
        return Err(ConfigError::MissingServiceUrl);
    }

    if window == 0 {
        return Err(ConfigError::InvalidWindow);
    }

    Url::parse(&config.service_url).map_err(|source| ConfigError::InvalidServiceUrl {
        url: config.service_url.clone(),
        source,
    })
}
