use tracing::debug;

use crate::errors::{GatewayError, RelayError};
use crate::gateway::BackendAdapter;
use crate::model::{Backend, ChatRequest, ChatResponse, Role, Usage};
use crate::parser::{ChunkDecoder, ChunkStream, chunk_stream};
use crate::vendors::{parse_usage, status_error};

use super::config::OpenAiBackendConfig;
use super::transport::{OpenAiRecords, extract_output_text, extract_tool_events};

/// Backend adapter for OpenAI's Responses API.
///
/// Serves both backends; the model, temperature and reasoning effort are
/// picked per request.
pub struct OpenAiBackend {
    client: reqwest::Client,
    config: OpenAiBackendConfig,
}

impl OpenAiBackend {
    /// Creates an adapter from explicit configuration.
    pub fn new(config: OpenAiBackendConfig) -> Result<Self, RelayError> {
        if config.api_key.trim().is_empty() {
            return Err(RelayError::Config(
                "OpenAI backend config api_key must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build OpenAI client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates an adapter using `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::new(OpenAiBackendConfig::from_env()?)
    }

    async fn post(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, GatewayError> {
        let body = build_request_body(&self.config, req, stream);
        debug!(backend = %req.backend, model = self.config.model_for(req.backend), stream, "posting OpenAI responses request");
        let mut http_req = self
            .client
            .post(self.config.responses_url())
            .bearer_auth(&self.config.api_key)
            .json(&body);
        // Streams are bounded by the session idle timeout instead.
        if !stream {
            http_req = http_req.timeout(self.config.timeout);
        }
        let response = http_req.send().await.map_err(|e| {
            GatewayError::transport(req.backend, format!("OpenAI request failed: {e}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(status_error(req.backend, status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl BackendAdapter for OpenAiBackend {
    fn id(&self) -> &'static str {
        "openai"
    }

    async fn open_stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        let response = self.post(req, true).await?;
        Ok(chunk_stream(
            req.backend,
            response.bytes_stream(),
            ChunkDecoder::new(OpenAiRecords::new(req.backend)),
        ))
    }

    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, GatewayError> {
        let response = self.post(req, false).await?;
        let value: serde_json::Value = response.json().await.map_err(|e| {
            GatewayError::protocol(req.backend, format!("invalid OpenAI response body: {e}"))
        })?;
        let text = extract_output_text(&value).unwrap_or_default();
        let tool_events = extract_tool_events(&value);
        if text.is_empty() && tool_events.is_empty() {
            return Err(GatewayError::protocol(req.backend, "no response generated"));
        }
        let usage = value
            .get("usage")
            .and_then(parse_usage)
            .or_else(|| Some(Usage::estimate(&text)));
        Ok(ChatResponse {
            text,
            tool_events,
            usage,
        })
    }
}

/// Renders the history as one `User:` / `Assistant:` transcript.
pub(crate) fn conversation_text(req: &ChatRequest) -> String {
    req.prior_messages
        .iter()
        .map(|message| {
            let speaker = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{speaker}: {}", message.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn build_request_body(
    config: &OpenAiBackendConfig,
    req: &ChatRequest,
    stream: bool,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": config.model_for(req.backend),
        "input": conversation_text(req),
        "stream": stream,
        "store": false,
        "max_output_tokens": config.max_output_tokens,
    });

    if let Some(instructions) = config
        .instructions
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        body["instructions"] = serde_json::json!(instructions);
    }

    let tools = request_tools(config);
    if !tools.is_empty() {
        body["tools"] = serde_json::Value::Array(tools);
    }

    match req.backend {
        Backend::Mojo => {
            if let Some(temperature) = config.temperature {
                body["temperature"] = serde_json::json!(temperature);
            }
        }
        Backend::MojoPlus => {}
    }

    if let Some(effort) = req.effective_reasoning_effort() {
        body["reasoning"] = serde_json::json!({ "effort": effort });
    }
    if let Some(user) = req.options.requester_id.as_deref() {
        body["user"] = serde_json::json!(user);
    }

    body
}

fn request_tools(config: &OpenAiBackendConfig) -> Vec<serde_json::Value> {
    let mut tools = Vec::new();
    if config.image_generation {
        tools.push(serde_json::json!({ "type": "image_generation" }));
    }
    if config.code_interpreter {
        tools.push(serde_json::json!({
            "type": "code_interpreter",
            "container": { "type": "auto" },
        }));
    }
    for server in &config.mcp_servers {
        tools.push(serde_json::json!({
            "type": "mcp",
            "server_label": server.label,
            "server_url": server.url,
            "require_approval": "never",
        }));
    }
    tools
}
