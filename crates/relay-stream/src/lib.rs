//! Streaming side of the chat relay: chunk parsing, backend routing and
//! cancellable stream sessions.
//!
//! Vendor-specific adapters are namespaced under `vendors::*`.
//!
//! # Streaming a reply
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use relay_stream::prelude::*;
//! use relay_stream::vendors::openai::OpenAiBackend;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), RelayError> {
//! let backend = Arc::new(OpenAiBackend::from_env()?);
//! let gateway = Gateway::builder()
//!     .route(Backend::Mojo, backend.clone())
//!     .route(Backend::MojoPlus, backend)
//!     .build()?;
//! let sessions = SessionManager::new(gateway, SessionConfig::from_env()?)?;
//!
//! let mut handle = sessions
//!     .start("reply-1", ChatRequest::new(Backend::Mojo).user("Say hello"))
//!     .await?;
//! while let Some(event) = handle.next_event().await {
//!     if let SessionEvent::Progress { chunk: StreamChunk::TextDelta(text), .. } = event {
//!         print!("{text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Stream chunks and cumulative session content.
pub mod chunk;
/// Environment-driven configuration.
pub mod config;
/// Error taxonomy and public error types.
pub mod errors;
/// Backend routing and the adapter contract.
pub mod gateway;
/// Backends, requests and responses.
pub mod model;
/// Tracing subscriber setup.
pub mod observability;
/// Line-framed record decoding.
pub mod parser;
/// Common imports for typical usage.
pub mod prelude;
/// Session task and cancellation handle.
pub mod run;
/// Session registry and consumer handle.
pub mod session;
/// Session identities, states and events.
pub mod stream;
/// Backend integrations.
pub mod vendors;

pub use chunk::{SessionContent, StreamChunk, ToolEvent, ToolKind};
pub use config::SessionConfig;
pub use errors::{ErrorKind, GatewayError, RelayError, SessionFailure};
pub use gateway::{BackendAdapter, Gateway, GatewayBuilder, GatewayReply};
pub use model::{
    Backend, ChatMessage, ChatRequest, ChatResponse, ReasoningEffort, RequestOptions, Role, Usage,
};
pub use observability::{LogOutput, LogSettings, init_observability, init_with};
pub use parser::{ChunkDecoder, ChunkStream, RecordDecoder, chunk_stream};
pub use run::AbortHandle;
pub use session::{SessionHandle, SessionManager};
pub use stream::{SessionEvent, SessionId, SessionOutcome, SessionStatus};
