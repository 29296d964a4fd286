use std::fmt;

/// Tool invocation kinds a backend may interleave with text output.
///
/// The set is closed; unknown kinds on the wire are ignored by the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ToolKind {
    /// `image_generation`
    #[serde(rename = "image_generation")]
    ImageGeneration,
    /// `code_interpreter`
    #[serde(rename = "code_interpreter")]
    CodeInterpreter,
    /// `mcp_call`: a call routed to a remote tool server.
    #[serde(rename = "mcp_call")]
    RemoteToolCall,
}

impl ToolKind {
    /// Wire name used by the relay record format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImageGeneration => "image_generation",
            Self::CodeInterpreter => "code_interpreter",
            Self::RemoteToolCall => "mcp_call",
        }
    }

    /// Parses a relay wire discriminator.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "image_generation" => Some(Self::ImageGeneration),
            "code_interpreter" => Some(Self::CodeInterpreter),
            "mcp_call" => Some(Self::RemoteToolCall),
            _ => None,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool event with its opaque backend payload.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolEvent {
    pub kind: ToolKind,
    pub payload: serde_json::Value,
}

impl ToolEvent {
    pub fn new(kind: ToolKind, payload: serde_json::Value) -> Self {
        Self { kind, payload }
    }
}

/// One decoded unit of an incremental response.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamChunk {
    /// Text fragment to append.
    TextDelta(String),
    /// Tool invocation interleaved with the text.
    ToolEvent(ToolEvent),
    /// No further chunks follow.
    Terminal,
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal)
    }
}

/// Cumulative content of a session: everything applied so far, in arrival order.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionContent {
    /// Concatenation of every text delta.
    pub text: String,
    /// Tool events in insertion order.
    pub tool_events: Vec<ToolEvent>,
    /// Number of text/tool chunks applied.
    pub chunks: u64,
}

impl SessionContent {
    /// Folds one chunk into the content. Returns `false` for `Terminal`, which
    /// carries nothing to apply.
    pub fn apply(&mut self, chunk: &StreamChunk) -> bool {
        match chunk {
            StreamChunk::TextDelta(text) => self.text.push_str(text),
            StreamChunk::ToolEvent(event) => self.tool_events.push(event.clone()),
            StreamChunk::Terminal => return false,
        }
        self.chunks = self.chunks.saturating_add(1);
        true
    }

    /// True when neither text nor tool events have been received.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.tool_events.is_empty()
    }
}
