//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values are wrapped in secrecy::SecretString to
//! prevent log leaks.

pub mod secrets;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Endpoint for the `webhook` channel. Without it only `console` is
    /// registered.
    pub webhook_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Reconciles running at once in `herald serve`.
    pub max_concurrent: usize,
    /// Hard limit on a single channel send.
    pub send_timeout: Duration,
    /// Extra sanitizer rules (TOML) appended after the built-in ones.
    pub sanitizer_rules: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            webhook_url: optional_var("WEBHOOK_URL").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            max_concurrent: parsed_var("HERALD_MAX_CONCURRENT")?.unwrap_or(8),
            send_timeout: Duration::from_secs(
                parsed_var("HERALD_SEND_TIMEOUT_SECS")?.unwrap_or(10),
            ),
            sanitizer_rules: optional_var("HERALD_SANITIZER_RULES").map(PathBuf::from),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty are the same thing.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}")))
        })
        .transpose()
}
