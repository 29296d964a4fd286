use crate::chunk::{StreamChunk, ToolEvent};
use crate::errors::{ErrorKind, GatewayError};
use crate::model::Backend;
use crate::parser::{Record, RecordDecoder};
use crate::vendors::{classify_error_code, error_fields, tool_kind_for_item};

/// Record decoder for Responses API server-sent events.
///
/// Only `data:` payloads are inspected; the `event:` lines repeat the `type`
/// field and are dropped by the line framing.
#[derive(Clone, Copy, Debug)]
pub(crate) struct OpenAiRecords {
    backend: Backend,
}

impl OpenAiRecords {
    pub(crate) fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

impl RecordDecoder for OpenAiRecords {
    fn decode(&mut self, payload: &str) -> Result<Record, GatewayError> {
        let payload = payload.trim();
        if payload == "[DONE]" {
            return Ok(Record::Chunk(StreamChunk::Terminal));
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            return Ok(Record::Malformed);
        };
        map_openai_event(self.backend, &value)
    }
}

pub(crate) fn map_openai_event(
    backend: Backend,
    value: &serde_json::Value,
) -> Result<Record, GatewayError> {
    let Some(event_type) = value.get("type").and_then(|v| v.as_str()) else {
        return Ok(Record::Ignored);
    };
    match event_type {
        "response.output_text.delta" => Ok(value
            .get("delta")
            .and_then(|v| v.as_str())
            .filter(|delta| !delta.is_empty())
            .map(|delta| Record::Chunk(StreamChunk::TextDelta(delta.to_string())))
            .unwrap_or(Record::Ignored)),
        // Tool items are reported once they are done so the payload carries
        // their results.
        "response.output_item.done" => Ok(value
            .get("item")
            .and_then(tool_event_from_item)
            .map(|event| Record::Chunk(StreamChunk::ToolEvent(event)))
            .unwrap_or(Record::Ignored)),
        "response.completed" | "response.incomplete" => Ok(Record::Chunk(StreamChunk::Terminal)),
        "response.mcp_call.failed" | "response.mcp_list_tools.failed" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|v| v.as_str())
                .unwrap_or("remote tool server failed");
            Err(GatewayError::backend(
                backend,
                ErrorKind::AuxiliaryToolUnreachable,
                message,
                None,
            ))
        }
        "error" | "response.error" | "response.failed" => {
            let envelope = value.get("response").unwrap_or(value);
            let (code, message) = error_fields(envelope);
            let (code, message) = match (code, message) {
                (None, None) => error_fields(value),
                other => other,
            };
            let kind = code
                .as_deref()
                .and_then(classify_error_code)
                .unwrap_or(ErrorKind::BackendUnavailable);
            Err(GatewayError::backend(
                backend,
                kind,
                message.unwrap_or_else(|| "OpenAI stream error".to_string()),
                None,
            ))
        }
        _ => Ok(Record::Ignored),
    }
}

fn tool_event_from_item(item: &serde_json::Value) -> Option<ToolEvent> {
    let kind = item
        .get("type")
        .and_then(|v| v.as_str())
        .and_then(tool_kind_for_item)?;
    Some(ToolEvent::new(kind, item.clone()))
}

/// Tool events carried by a complete response's `output` items.
pub(crate) fn extract_tool_events(response: &serde_json::Value) -> Vec<ToolEvent> {
    response
        .get("output")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(tool_event_from_item).collect())
        .unwrap_or_default()
}

pub(crate) fn extract_output_text(response: &serde_json::Value) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(items) = response.get("output").and_then(|v| v.as_array()) {
        for item in items {
            if item.get("type").and_then(|v| v.as_str()) != Some("message") {
                continue;
            }
            if let Some(content) = item.get("content").and_then(|v| v.as_array()) {
                for c in content {
                    if let Some(text) = c.get("text").and_then(|v| v.as_str()) {
                        parts.push(text.to_string());
                    }
                }
            }
        }
    }
    if !parts.is_empty() {
        return Some(parts.join(""));
    }
    response
        .get("output_text")
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned)
}
