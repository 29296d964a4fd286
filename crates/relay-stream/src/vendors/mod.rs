//! Backend integrations.
//!
//! Each vendor module owns its request body and wire decoding; the helpers
//! here classify failures the same way for every vendor.
pub mod openai;
pub mod relay;

use crate::chunk::ToolKind;
use crate::errors::{ErrorKind, GatewayError};
use crate::model::{Backend, Usage};

/// Maps an in-band or HTTP error code to an error kind.
pub(crate) fn classify_error_code(code: &str) -> Option<ErrorKind> {
    match code {
        "insufficient_quota" | "quota_exceeded" => Some(ErrorKind::QuotaExceeded),
        "rate_limit_exceeded" | "rate_limited" => Some(ErrorKind::RateLimited),
        "model_not_found" | "server_error" | "service_unavailable" => {
            Some(ErrorKind::BackendUnavailable)
        }
        code if code.starts_with("mcp") || code.contains("tool_server") => {
            Some(ErrorKind::AuxiliaryToolUnreachable)
        }
        _ => None,
    }
}

/// Maps an unsuccessful HTTP status (and its body) to an error kind.
pub(crate) fn classify_status(status: u16, body: &str) -> ErrorKind {
    let lowered = body.to_ascii_lowercase();
    match status {
        429 if lowered.contains("quota") => ErrorKind::QuotaExceeded,
        429 => ErrorKind::RateLimited,
        424 => ErrorKind::AuxiliaryToolUnreachable,
        _ if lowered.contains("mcp") && (lowered.contains("unreachable") || lowered.contains("failed")) => {
            ErrorKind::AuxiliaryToolUnreachable
        }
        _ => ErrorKind::BackendUnavailable,
    }
}

/// Pulls `(code, message)` out of the error envelopes backends use:
/// `{"error": "msg"}`, `{"error": {"code", "message"}}` or `{"code", "message"}`.
pub(crate) fn error_fields(value: &serde_json::Value) -> (Option<String>, Option<String>) {
    let error = value.get("error").unwrap_or(value);
    if let Some(message) = error.as_str() {
        return (None, Some(message.to_string()));
    }
    let code = error
        .get("code")
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned);
    let message = error
        .get("message")
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned);
    (code, message)
}

/// Builds the gateway error for an unsuccessful HTTP response.
pub(crate) fn status_error(backend: Backend, status: u16, body: &str) -> GatewayError {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let (code, message) = parsed
        .as_ref()
        .map(error_fields)
        .unwrap_or((None, None));
    let kind = code
        .as_deref()
        .and_then(classify_error_code)
        .unwrap_or_else(|| classify_status(status, body));
    let message = message.unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("request failed with status {status}")
        } else {
            body.to_string()
        }
    });
    GatewayError::backend(backend, kind, message, Some(status))
}

/// Tool kind for a Responses-style output item type.
pub(crate) fn tool_kind_for_item(item_type: &str) -> Option<ToolKind> {
    match item_type {
        "image_generation_call" => Some(ToolKind::ImageGeneration),
        "code_interpreter_call" => Some(ToolKind::CodeInterpreter),
        "mcp_call" => Some(ToolKind::RemoteToolCall),
        _ => None,
    }
}

/// Reads usage counters in either the chat (`prompt_tokens`) or the
/// responses (`input_tokens`) naming.
pub(crate) fn parse_usage(value: &serde_json::Value) -> Option<Usage> {
    let field = |names: [&str; 2]| {
        names
            .iter()
            .find_map(|name| value.get(*name).and_then(|v| v.as_u64()))
    };
    let prompt_tokens = field(["prompt_tokens", "input_tokens"]);
    let completion_tokens = field(["completion_tokens", "output_tokens"]);
    let total_tokens = value.get("total_tokens").and_then(|v| v.as_u64());
    if prompt_tokens.is_none() && completion_tokens.is_none() && total_tokens.is_none() {
        return None;
    }
    let prompt_tokens = prompt_tokens.unwrap_or(0);
    let completion_tokens = completion_tokens.unwrap_or(0);
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: total_tokens.unwrap_or(prompt_tokens + completion_tokens),
    })
}
