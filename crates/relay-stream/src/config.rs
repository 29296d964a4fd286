use std::path::Path;
use std::time::Duration;

use crate::errors::RelayError;

/// Loads `.env` from the crate directory and the working directory, if present.
pub fn load_dotenv() {
    let _ = dotenvy::from_path(Path::new(
        format!("{}/.env", env!("CARGO_MANIFEST_DIR")).as_str(),
    ));
    dotenvy::dotenv().ok();
}

/// Reads a non-empty environment variable.
pub(crate) fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Reads and parses an environment variable, logging and falling back to
/// `default` when it does not parse.
pub(crate) fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_or(key, env_opt(key), default)
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::error!("Error parsing {}", key);
                default
            }
        },
        None => default,
    }
}

/// Tunables for the session manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Longest gap between chunks before an active session fails with `Timeout`.
    pub idle_timeout: Duration,
    /// How long `start` waits for a superseded session to finalize.
    pub cancel_grace: Duration,
    /// Capacity of the per-session event channel.
    pub update_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(90),
            cancel_grace: Duration::from_secs(2),
            update_buffer: 128,
        }
    }
}

impl SessionConfig {
    /// Reads `RELAY_IDLE_TIMEOUT_SECS`, `RELAY_CANCEL_GRACE_MS` and
    /// `RELAY_UPDATE_BUFFER`, keeping defaults for unset or unparsable values.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(env_opt)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RelayError> {
        let defaults = Self::default();
        let read = |key: &str, default: u64| parse_or(key, lookup(key), default);
        let config = Self {
            idle_timeout: Duration::from_secs(read(
                "RELAY_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )),
            cancel_grace: Duration::from_millis(read(
                "RELAY_CANCEL_GRACE_MS",
                defaults.cancel_grace.as_millis() as u64,
            )),
            update_buffer: read("RELAY_UPDATE_BUFFER", defaults.update_buffer as u64) as usize,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn cancel_grace(mut self, cancel_grace: Duration) -> Self {
        self.cancel_grace = cancel_grace;
        self
    }

    pub fn update_buffer(mut self, update_buffer: usize) -> Self {
        self.update_buffer = update_buffer;
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.idle_timeout.is_zero() {
            return Err(RelayError::Config("idle_timeout must be positive".into()));
        }
        if self.update_buffer == 0 {
            return Err(RelayError::Config("update_buffer must be positive".into()));
        }
        Ok(())
    }
}
