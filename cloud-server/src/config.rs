//! Configuration module

use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{0} is not a valid number: {1}")]
    Invalid(&'static str, String),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Shared HMAC secret, same value the agents sign with
    pub hmac_key: Vec<u8>,

    /// Alerts kept in memory before the oldest are evicted
    pub max_alerts: usize,
}

fn number<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables. `RTM_HMAC_KEY` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let hmac_key = env::var("RTM_HMAC_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::Missing("RTM_HMAC_KEY"))?
            .into_bytes();

        Ok(Self {
            port: number("PORT", 8080)?,
            hmac_key,
            max_alerts: number("RTM_MAX_ALERTS", 10_000usize)?.max(1),
        })
    }
}
