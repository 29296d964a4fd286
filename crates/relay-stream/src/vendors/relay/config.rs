use std::time::Duration;

use crate::config::env_opt;
use crate::errors::RelayError;
use crate::model::Backend;

/// Configuration for the relay chat endpoints.
#[derive(Clone, Debug)]
pub struct RelayBackendConfig {
    /// Origin serving `/api/chat/*`.
    pub base_url: String,
    /// Timeout for blocking requests.
    pub timeout: Duration,
    /// Optional bearer token.
    pub auth_token: Option<String>,
}

impl RelayBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(120),
            auth_token: None,
        }
    }

    /// Builds a config from `RELAY_BASE_URL` (and `RELAY_AUTH_TOKEN` when set).
    pub fn from_env() -> Result<Self, RelayError> {
        let base_url = env_opt("RELAY_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(RelayError::Config(
                "missing RELAY_BASE_URL for relay backend".into(),
            ));
        }
        let mut config = Self::new(base_url);
        config.auth_token = env_opt("RELAY_AUTH_TOKEN").filter(|t| !t.trim().is_empty());
        Ok(config)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub(crate) fn endpoint(&self, backend: Backend) -> String {
        let path = match backend {
            Backend::Mojo => "mojo",
            Backend::MojoPlus => "mojo-plus",
        };
        format!("{}/api/chat/{path}", self.base_url.trim_end_matches('/'))
    }
}
