//! OpenAI Responses API integration.
//!
//! Vendor-specific configuration lives here so the gateway stays
//! backend-agnostic.
mod adapter;
mod config;
pub(crate) mod transport;

pub use adapter::OpenAiBackend;
pub use config::{McpServer, OpenAiBackendConfig};
