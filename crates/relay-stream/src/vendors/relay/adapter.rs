use tracing::debug;

use crate::chunk::ToolEvent;
use crate::errors::{GatewayError, RelayError};
use crate::gateway::BackendAdapter;
use crate::model::{ChatRequest, ChatResponse, Usage};
use crate::parser::{ChunkDecoder, ChunkStream, chunk_stream};
use crate::vendors::{parse_usage, status_error, tool_kind_for_item};

use super::config::RelayBackendConfig;

/// Adapter for endpoints speaking the relay record format directly.
pub struct RelayBackend {
    client: reqwest::Client,
    config: RelayBackendConfig,
}

impl RelayBackend {
    pub fn new(config: RelayBackendConfig) -> Result<Self, RelayError> {
        if config.base_url.trim().is_empty() {
            return Err(RelayError::Config(
                "relay backend base_url must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build relay client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, RelayError> {
        Self::new(RelayBackendConfig::from_env()?)
    }

    async fn post(&self, req: &ChatRequest) -> Result<reqwest::Response, GatewayError> {
        let url = self.config.endpoint(req.backend);
        debug!(backend = %req.backend, %url, streaming = req.streaming, "posting relay chat request");
        let mut http_req = self.client.post(url).json(&request_body(req));
        if let Some(token) = self.config.auth_token.as_deref() {
            http_req = http_req.bearer_auth(token);
        }
        if !req.streaming {
            http_req = http_req.timeout(self.config.timeout);
        }
        let response = http_req.send().await.map_err(|e| {
            GatewayError::transport(req.backend, format!("relay request failed: {e}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(req.backend, status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl BackendAdapter for RelayBackend {
    fn id(&self) -> &'static str {
        "relay"
    }

    async fn open_stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        let req = req.clone().streaming(true);
        let response = self.post(&req).await?;
        Ok(chunk_stream(
            req.backend,
            response.bytes_stream(),
            ChunkDecoder::default(),
        ))
    }

    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, GatewayError> {
        let req = req.clone().streaming(false);
        let response = self.post(&req).await?;
        let value: serde_json::Value = response.json().await.map_err(|e| {
            GatewayError::protocol(req.backend, format!("invalid relay response body: {e}"))
        })?;
        parse_complete_response(&req, &value)
    }
}

pub(crate) fn request_body(req: &ChatRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "messages": req.prior_messages,
        "stream": req.streaming,
    });
    if let Some(effort) = req.effective_reasoning_effort() {
        body["reasoning_effort"] = serde_json::json!(effort);
    }
    if let Some(user_id) = req.options.requester_id.as_deref() {
        body["userId"] = serde_json::json!(user_id);
    }
    body
}

pub(crate) fn parse_complete_response(
    req: &ChatRequest,
    value: &serde_json::Value,
) -> Result<ChatResponse, GatewayError> {
    let message = value.get("message").ok_or_else(|| {
        GatewayError::protocol(req.backend, "relay response is missing `message`")
    })?;
    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let tool_events: Vec<ToolEvent> = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let kind = item
                        .get("type")
                        .and_then(|v| v.as_str())
                        .and_then(tool_kind_for_item)?;
                    Some(ToolEvent::new(kind, item.clone()))
                })
                .collect()
        })
        .unwrap_or_default();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ToolKind;
    use crate::model::Backend;
    use crate::vendors::relay::RelayBackendConfig;

    #[test]
    fn endpoints_follow_backend() {
        let config = RelayBackendConfig::new("http://localhost:3000/");
        assert_eq!(
            config.endpoint(Backend::Mojo),
            "http://localhost:3000/api/chat/mojo"
        );
        assert_eq!(
            config.endpoint(Backend::MojoPlus),
            "http://localhost:3000/api/chat/mojo-plus"
        );
    }

    #[test]
    fn body_carries_history_and_reasoning_default() {
        let req = ChatRequest::new(Backend::MojoPlus)
            .user("hi")
            .assistant("hello")
            .requester_id("u-1");
        let body = request_body(&req);
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["stream"], true);
        assert_eq!(body["reasoning_effort"], "medium");
        assert_eq!(body["userId"], "u-1");

        let plain = request_body(&ChatRequest::new(Backend::Mojo).user("hi").streaming(false));
        assert!(plain.get("reasoning_effort").is_none());
        assert_eq!(plain["stream"], false);
    }

    #[test]
    fn complete_response_maps_text_tools_and_usage() {
        let req = ChatRequest::new(Backend::Mojo).user("draw");
        let value = serde_json::json!({
            "message": {
                "role": "assistant",
                "content": "Here it is",
                "tool_calls": [
                    {"type": "image_generation_call", "id": "ig_1"},
                    {"type": "web_search_call", "id": "ws_1"}
                ]
            },
            "usage": {"input_tokens": 5, "output_tokens": 3, "total_tokens": 8},
            "model": "mojo"
        });
        let response = parse_complete_response(&req, &value).expect("response");
        assert_eq!(response.text, "Here it is");
        assert_eq!(response.tool_events.len(), 1);
        assert_eq!(response.tool_events[0].kind, ToolKind::ImageGeneration);
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(8));
    }

    #[test]
    fn empty_complete_response_is_a_protocol_error() {
        let req = ChatRequest::new(Backend::Mojo).user("hi");
        let err = parse_complete_response(&req, &serde_json::json!({"message": {"content": ""}}))
            .expect_err("empty");
        assert!(matches!(err, GatewayError::Protocol { .. }));
    }
}
