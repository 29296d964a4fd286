use std::fmt;

use crate::model::Backend;

/// Failure taxonomy shared by the gateway and the session manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Account quota exhausted. The caller may retry later.
    QuotaExceeded,
    /// Too many requests. The caller may retry after a delay.
    RateLimited,
    /// The backend could not start or continue a generation.
    BackendUnavailable,
    /// A remote tool server needed mid-generation failed.
    AuxiliaryToolUnreachable,
    /// A single record failed to decode. Absorbed by the parser.
    MalformedFrame,
    /// No forward progress within the idle bound.
    Timeout,
    /// User-initiated stop.
    Cancelled,
    /// Internal invariant violation.
    Protocol,
}

impl ErrorKind {
    /// Whether the caller may reasonably retry the same request after a delay.
    ///
    /// Nothing inside this crate retries automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaExceeded | Self::RateLimited)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimited => "rate_limited",
            Self::BackendUnavailable => "backend_unavailable",
            Self::AuxiliaryToolUnreachable => "auxiliary_tool_unreachable",
            Self::MalformedFrame => "malformed_frame",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a backend adapter before they reach a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The backend answered with an application-level failure.
    #[error("backend error ({backend}, {kind}): {message}")]
    Backend {
        backend: Backend,
        kind: ErrorKind,
        message: String,
        status_code: Option<u16>,
    },
    /// Transport or stream I/O failed.
    #[error("transport error ({backend}): {message}")]
    Transport { backend: Backend, message: String },
    /// The backend's response shape was unusable.
    #[error("protocol error ({backend}): {message}")]
    Protocol { backend: Backend, message: String },
    /// No adapter is routed for the requested backend.
    #[error("no adapter routed for backend {backend}")]
    NotRouted { backend: Backend },
}

impl GatewayError {
    /// Creates a backend-level error.
    pub fn backend(
        backend: Backend,
        kind: ErrorKind,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Backend {
            backend,
            kind,
            message: message.into(),
            status_code,
        }
    }

    /// Creates a transport-level error.
    pub fn transport(backend: Backend, message: impl Into<String>) -> Self {
        Self::Transport {
            backend,
            message: message.into(),
        }
    }

    /// Creates a protocol-level error.
    pub fn protocol(backend: Backend, message: impl Into<String>) -> Self {
        Self::Protocol {
            backend,
            message: message.into(),
        }
    }

    /// Classification used by callers to decide between retry and surfacing.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend { kind, .. } => *kind,
            Self::Transport { .. } | Self::NotRouted { .. } => ErrorKind::BackendUnavailable,
            Self::Protocol { .. } => ErrorKind::Protocol,
        }
    }

    pub fn backend_id(&self) -> Backend {
        match self {
            Self::Backend { backend, .. }
            | Self::Transport { backend, .. }
            | Self::Protocol { backend, .. }
            | Self::NotRouted { backend } => *backend,
        }
    }
}

/// Terminal failure carried by a `Failed` session outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("{kind}: {message}")]
pub struct SessionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&GatewayError> for SessionFailure {
    fn from(err: &GatewayError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Top-level error type for the public API of this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Invalid gateway/adapter/session configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid request built by the caller.
    #[error("validation error: {0}")]
    Validation(String),
    /// Requested backend has no adapter.
    #[error("no adapter routed for backend {backend}")]
    NotRouted { backend: Backend },
    /// Gateway failure outside a session (for example a blocking `complete`).
    #[error(transparent)]
    Gateway(GatewayError),
}

impl RelayError {
    /// Classification of the underlying failure, when there is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Gateway(err) => Some(err.kind()),
            Self::NotRouted { .. } => Some(ErrorKind::BackendUnavailable),
            Self::Config(_) | Self::Validation(_) => None,
        }
    }
}

impl From<GatewayError> for RelayError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::NotRouted { backend } => RelayError::NotRouted { backend },
            other => RelayError::Gateway(other),
        }
    }
}
