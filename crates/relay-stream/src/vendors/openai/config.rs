use std::time::Duration;

use crate::config::{env_opt, env_or};
use crate::errors::RelayError;
use crate::model::Backend;

/// A remote tool server exposed to the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McpServer {
    pub label: String,
    pub url: String,
}

impl McpServer {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// Configuration for the Responses API backend.
#[derive(Clone, Debug)]
pub struct OpenAiBackendConfig {
    /// API key used for bearer auth.
    pub api_key: String,
    /// Base URL for the OpenAI-compatible endpoint.
    ///
    /// Useful for proxies or local test servers.
    pub base_url: String,
    /// Default HTTP timeout for blocking requests.
    pub timeout: Duration,
    /// Model used for [`Backend::Mojo`].
    pub mojo_model: String,
    /// Model used for [`Backend::MojoPlus`].
    pub mojo_plus_model: String,
    /// System instructions sent with every request.
    pub instructions: Option<String>,
    /// Sampling temperature, sent to the non-reasoning backend only.
    pub temperature: Option<f32>,
    pub max_output_tokens: u32,
    pub image_generation: bool,
    pub code_interpreter: bool,
    pub mcp_servers: Vec<McpServer>,
}

impl OpenAiBackendConfig {
    /// Creates a config with the default models and tools.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
            timeout: Duration::from_secs(120),
            mojo_model: "gpt-4.1".to_string(),
            mojo_plus_model: "o3".to_string(),
            instructions: None,
            temperature: Some(0.7),
            max_output_tokens: 2000,
            image_generation: true,
            code_interpreter: true,
            mcp_servers: vec![
                McpServer::new("exa", "https://mcp.exa.ai/mcp"),
                McpServer::new("context7", "https://mcp.context7.com/mcp"),
            ],
        }
    }

    /// Builds a config from `OPENAI_API_KEY`, honouring `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self, RelayError> {
        let api_key = env_opt("OPENAI_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(RelayError::Config(
                "missing OPENAI_API_KEY for OpenAI backend".into(),
            ));
        }
        let mut config = Self::new(api_key);
        config.base_url = env_or("OPENAI_BASE_URL", config.base_url);
        Ok(config)
    }

    /// Overrides the API base URL (for proxies or test servers).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the default HTTP timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn models(mut self, mojo: impl Into<String>, mojo_plus: impl Into<String>) -> Self {
        self.mojo_model = mojo.into();
        self.mojo_plus_model = mojo_plus.into();
        self
    }

    /// Replaces the remote tool servers.
    pub fn mcp_servers(mut self, servers: Vec<McpServer>) -> Self {
        self.mcp_servers = servers;
        self
    }

    /// Disables every tool.
    pub fn without_tools(mut self) -> Self {
        self.image_generation = false;
        self.code_interpreter = false;
        self.mcp_servers.clear();
        self
    }

    pub fn model_for(&self, backend: Backend) -> &str {
        match backend {
            Backend::Mojo => &self.mojo_model,
            Backend::MojoPlus => &self.mojo_plus_model,
        }
    }

    pub(crate) fn responses_url(&self) -> String {
        format!("{}/v1/responses", self.base_url.trim_end_matches('/'))
    }
}
