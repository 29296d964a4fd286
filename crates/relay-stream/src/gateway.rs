use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::{GatewayError, RelayError};
use crate::model::{Backend, ChatRequest, ChatResponse};
use crate::parser::ChunkStream;

/// Contract implemented by each model backend integration.
///
/// Adapters own every wire-format quirk of their backend; what leaves an
/// adapter is already a normalized [`ChunkStream`] or [`ChatResponse`].
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short stable name used in logs (for example `relay` or `openai`).
    fn id(&self) -> &'static str;

    /// Starts a streaming generation.
    async fn open_stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError>;

    /// Runs a blocking generation and returns the complete answer.
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, GatewayError>;
}

/// What `Gateway::execute` returns, selected by `ChatRequest::streaming`.
pub enum GatewayReply {
    Complete(ChatResponse),
    Stream(ChunkStream),
}

impl std::fmt::Debug for GatewayReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Routes requests to the adapter registered for their backend.
#[derive(Clone)]
pub struct Gateway {
    routes: Arc<HashMap<Backend, Arc<dyn BackendAdapter>>>,
}

impl Gateway {
    /// Starts a builder for registering adapters.
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Returns the adapter routed for `backend`.
    pub fn adapter(&self, backend: Backend) -> Result<Arc<dyn BackendAdapter>, GatewayError> {
        self.routes
            .get(&backend)
            .cloned()
            .ok_or(GatewayError::NotRouted { backend })
    }

    /// Whether an adapter is routed for `backend`.
    pub fn is_routed(&self, backend: Backend) -> bool {
        self.routes.contains_key(&backend)
    }

    /// Runs the request on the path it asks for.
    pub async fn execute(&self, req: &ChatRequest) -> Result<GatewayReply, RelayError> {
        req.validate()?;
        let adapter = self.adapter(req.backend)?;
        debug!(backend = %req.backend, adapter = adapter.id(), streaming = req.streaming, "executing chat request");
        if req.streaming {
            Ok(GatewayReply::Stream(adapter.open_stream(req).await?))
        } else {
            Ok(GatewayReply::Complete(adapter.complete(req).await?))
        }
    }

    /// Always yields a chunk stream.
    ///
    /// For non-streaming requests the complete answer is awaited and replayed
    /// as `[TextDelta, ToolEvent*, Terminal]`.
    pub async fn open_stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        let adapter = self.adapter(req.backend)?;
        debug!(backend = %req.backend, adapter = adapter.id(), streaming = req.streaming, "opening chunk stream");
        if req.streaming {
            return adapter.open_stream(req).await;
        }
        let response = adapter.complete(req).await?;
        Ok(stream::iter(response.into_chunks().into_iter().map(Ok)).boxed())
    }
}

/// Builder used to route backends before creating a `Gateway`.
#[derive(Default)]
pub struct GatewayBuilder {
    routes: Vec<(Backend, Arc<dyn BackendAdapter>)>,
}

impl GatewayBuilder {
    /// Routes `backend` to `adapter`. One adapter may serve several backends.
    pub fn route(mut self, backend: Backend, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.routes.push((backend, adapter));
        self
    }

    /// Builds the gateway, rejecting duplicate routes.
    pub fn build(self) -> Result<Gateway, RelayError> {
        let mut routes: HashMap<Backend, Arc<dyn BackendAdapter>> = HashMap::new();
        for (backend, adapter) in self.routes {
            if routes.insert(backend, adapter).is_some() {
                return Err(RelayError::Config(format!(
                    "duplicate route for backend {backend}"
                )));
            }
        }
        Ok(Gateway {
            routes: Arc::new(routes),
        })
    }
}
