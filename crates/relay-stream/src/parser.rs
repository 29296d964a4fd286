//! Line-framed record decoding.
//!
//! Backends emit `data: <payload>` lines. [`LineBuffer`] handles the framing
//! (a record is only decoded once its whole line has arrived), and a
//! [`RecordDecoder`] maps each payload to a [`StreamChunk`]. The relay wire is
//! decoded by [`RelayRecords`]; other backends plug in their own decoder.
use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use tracing::debug;

use crate::chunk::{StreamChunk, ToolEvent, ToolKind};
use crate::errors::GatewayError;
use crate::model::Backend;

/// Normalized chunk sequence produced by every backend adapter.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, GatewayError>>;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Result of decoding one record payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    /// The payload maps to a chunk.
    Chunk(StreamChunk),
    /// Well-formed but carries nothing for the session (keep-alives, unknown types).
    Ignored,
    /// Not decodable. Skipped and counted, never surfaced.
    Malformed,
}

/// Maps one record payload (the text after `data:`) to a [`Record`].
///
/// Returning an error terminates the stream; use it only for failures the
/// backend reports in-band.
pub trait RecordDecoder: Send + 'static {
    fn decode(&mut self, payload: &str) -> Result<Record, GatewayError>;
}

/// Decoder for the relay wire: `{"content": ..}` and `{"type": .., "data": ..}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelayRecords;

impl RecordDecoder for RelayRecords {
    fn decode(&mut self, payload: &str) -> Result<Record, GatewayError> {
        Ok(decode_relay_payload(payload))
    }
}

/// Decodes a single relay record payload.
pub fn decode_relay_payload(payload: &str) -> Record {
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return Record::Chunk(StreamChunk::Terminal);
    }
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => return Record::Malformed,
    };
    if let Some(text) = value.get("content").and_then(|v| v.as_str())
        && !text.is_empty()
    {
        return Record::Chunk(StreamChunk::TextDelta(text.to_string()));
    }
    if let Some(kind) = value
        .get("type")
        .and_then(|v| v.as_str())
        .and_then(ToolKind::from_wire)
    {
        let payload = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
        return Record::Chunk(StreamChunk::ToolEvent(ToolEvent::new(kind, payload)));
    }
    Record::Ignored
}

/// Accumulates bytes and yields complete lines only.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    scanned: usize,
}

impl LineBuffer {
    /// Appends bytes and returns every line completed by them, without the
    /// trailing `\n` / `\r\n`.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut idx = self.scanned;
        while idx < self.buf.len() {
            if self.buf[idx] == b'\n' {
                lines.push(line_text(&self.buf[start..idx]));
                start = idx + 1;
            }
            idx += 1;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        lines
    }

    /// Takes whatever partial line is left, for use at end of stream.
    pub fn take_remainder(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(line_text(&rest))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn line_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Returns the payload of a `data:` line, or `None` for any other line.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX).map(str::trim_start)
}

/// Incremental decoder from raw bytes to chunks.
#[derive(Debug)]
pub struct ChunkDecoder<D = RelayRecords> {
    lines: LineBuffer,
    records: D,
    skipped: u64,
    terminated: bool,
}

impl Default for ChunkDecoder<RelayRecords> {
    fn default() -> Self {
        Self::new(RelayRecords)
    }
}

impl<D: RecordDecoder> ChunkDecoder<D> {
    pub fn new(records: D) -> Self {
        Self {
            lines: LineBuffer::default(),
            records,
            skipped: 0,
            terminated: false,
        }
    }

    /// Feeds bytes and returns the chunks completed by them.
    ///
    /// Once `Terminal` has been produced, further input is ignored.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamChunk>, GatewayError> {
        if self.terminated {
            return Ok(Vec::new());
        }
        let lines = self.lines.push(bytes);
        self.decode_lines(lines)
    }

    /// Flushes a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Result<Vec<StreamChunk>, GatewayError> {
        if self.terminated {
            return Ok(Vec::new());
        }
        match self.lines.take_remainder() {
            Some(line) => self.decode_lines(vec![line]),
            None => Ok(Vec::new()),
        }
    }

    /// Number of records skipped as malformed so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn decode_lines(&mut self, lines: Vec<String>) -> Result<Vec<StreamChunk>, GatewayError> {
        let mut chunks = Vec::new();
        for line in lines {
            let Some(payload) = data_payload(&line) else {
                continue;
            };
            match self.records.decode(payload)? {
                Record::Chunk(chunk) => {
                    let terminal = chunk.is_terminal();
                    chunks.push(chunk);
                    if terminal {
                        self.terminated = true;
                        self.lines = LineBuffer::default();
                        break;
                    }
                }
                Record::Ignored => {}
                Record::Malformed => {
                    self.skipped = self.skipped.saturating_add(1);
                    debug!(
                        payload_len = payload.len(),
                        skipped = self.skipped,
                        "skipping malformed record"
                    );
                }
            }
        }
        Ok(chunks)
    }
}

type BoxedBytes<B, E> = Pin<Box<dyn futures::Stream<Item = Result<B, E>> + Send + 'static>>;

/// Turns a byte stream into a lazy chunk stream.
///
/// The stream ends after `Terminal`, at closure of `bytes`, or after yielding
/// a single transport error. Each call starts from fresh decoder state.
pub fn chunk_stream<S, B, E, D>(backend: Backend, bytes: S, decoder: ChunkDecoder<D>) -> ChunkStream
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    D: RecordDecoder,
{
    struct State<B, E, D> {
        backend: Backend,
        bytes: BoxedBytes<B, E>,
        decoder: ChunkDecoder<D>,
        pending: VecDeque<StreamChunk>,
        closed: bool,
    }

    let state = State {
        backend,
        bytes: Box::pin(bytes),
        decoder,
        pending: VecDeque::new(),
        closed: false,
    };

    stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Ok(Some((chunk, state)));
            }
            if state.closed || state.decoder.is_terminated() {
                return Ok(None);
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    let chunks = state.decoder.push(bytes.as_ref())?;
                    state.pending.extend(chunks);
                }
                Some(Err(e)) => {
                    return Err(GatewayError::transport(
                        state.backend,
                        format!("stream read failed: {e}"),
                    ));
                }
                None => {
                    state.closed = true;
                    let chunks = state.decoder.finish()?;
                    state.pending.extend(chunks);
                    if state.decoder.skipped() > 0 {
                        debug!(backend = %state.backend, skipped = state.decoder.skipped(), "stream closed with skipped records");
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt as _;

    fn decode_all(parts: &[&str]) -> Vec<StreamChunk> {
        let mut decoder = ChunkDecoder::default();
        let mut out = Vec::new();
        for part in parts {
            out.extend(decoder.push(part.as_bytes()).expect("relay records never fail"));
        }
        out.extend(decoder.finish().expect("relay records never fail"));
        out
    }

    fn byte_stream(
        parts: Vec<&'static str>,
    ) -> impl futures::Stream<Item = Result<bytes::Bytes, std::io::Error>> + Send + 'static {
        stream::iter(
            parts
                .into_iter()
                .map(|part| Ok(bytes::Bytes::from_static(part.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn does_not_emit_on_a_line_fragment() {
        let mut decoder = ChunkDecoder::default();
        assert!(decoder.push(b"data: {\"content\":\"hel").expect("push").is_empty());
        let chunks = decoder.push(b"lo\"}\n\n").expect("push");
        assert_eq!(chunks, vec![StreamChunk::TextDelta("hello".into())]);
    }

    #[test]
    fn multibyte_characters_split_across_reads_survive() {
        let record = "data: {\"content\":\"caf\u{e9} \u{1f600}\"}\n\n".as_bytes();
        // split inside the four-byte emoji
        let (a, b) = record.split_at(record.len() - 6);
        let mut decoder = ChunkDecoder::default();
        assert!(decoder.push(a).expect("push").is_empty());
        let chunks = decoder.push(b).expect("push");
        assert_eq!(chunks, vec![StreamChunk::TextDelta("caf\u{e9} \u{1f600}".into())]);
    }

    #[test]
    fn malformed_records_are_skipped_without_changing_output() {
        let clean = decode_all(&[
            "data: {\"content\":\"a\"}\n\ndata: {\"content\":\"b\"}\n\ndata: [DONE]\n\n",
        ]);
        let mut decoder = ChunkDecoder::default();
        let mut noisy = decoder
            .push(b"data: {\"content\":\"a\"}\n\ndata: {not json\n\ndata: {\"content\":\"b\"}\n\ndata: {\"content\":\n\n")
            .expect("push");
        noisy.extend(decoder.push(b"data: [DONE]\n\n").expect("push"));
        assert_eq!(noisy, clean);
        assert_eq!(decoder.skipped(), 2);
    }

    #[test]
    fn tool_records_and_ignored_shapes() {
        let chunks = decode_all(&[
            ": keep-alive\n",
            "event: message\n",
            "data: {\"type\":\"mcp_call\",\"data\":{\"server\":\"exa\"}}\n\n",
            "data: {\"type\":\"web_search\",\"data\":{}}\n\n",
            "data: {\"content\":\"\"}\n\n",
            "data: {\"type\":\"image_generation\"}\r\n\r\n",
        ]);
        assert_eq!(
            chunks,
            vec![
                StreamChunk::ToolEvent(ToolEvent::new(
                    ToolKind::RemoteToolCall,
                    serde_json::json!({"server":"exa"})
                )),
                StreamChunk::ToolEvent(ToolEvent::new(
                    ToolKind::ImageGeneration,
                    serde_json::Value::Null
                )),
            ]
        );
    }

    #[test]
    fn input_after_terminal_is_ignored() {
        let mut decoder = ChunkDecoder::default();
        let chunks = decoder
            .push(b"data: {\"content\":\"x\"}\n\ndata: [DONE]\n\ndata: {\"content\":\"late\"}\n\n")
            .expect("push");
        assert_eq!(
            chunks,
            vec![StreamChunk::TextDelta("x".into()), StreamChunk::Terminal]
        );
        assert!(decoder.is_terminated());
        assert!(decoder.push(b"data: {\"content\":\"later\"}\n\n").expect("push").is_empty());
    }

    #[test]
    fn trailing_line_without_newline_is_flushed_at_close() {
        let chunks = decode_all(&["data: {\"content\":\"tail\"}"]);
        assert_eq!(chunks, vec![StreamChunk::TextDelta("tail".into())]);
    }

    #[tokio::test]
    async fn scenario_text_only_stream() {
        let chunks: Vec<StreamChunk> = chunk_stream(
            Backend::Mojo,
            byte_stream(vec![
                "data: {\"content\":\"Hel\"}\n\n",
                "data: {\"content\":\"lo\"}\n\n",
                "data: [DONE]\n\n",
            ]),
            ChunkDecoder::default(),
        )
        .try_collect()
        .await
        .expect("stream");

        let mut content = crate::chunk::SessionContent::default();
        for chunk in &chunks {
            content.apply(chunk);
        }
        assert_eq!(content.text, "Hello");
        assert!(content.tool_events.is_empty());
        assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
        assert_eq!(chunks.last(), Some(&StreamChunk::Terminal));
    }

    #[tokio::test]
    async fn scenario_tool_event_between_text_keeps_order() {
        let chunks: Vec<StreamChunk> = chunk_stream(
            Backend::Mojo,
            byte_stream(vec![
                "data: {\"content\":\"Running\"}\n\n",
                "data: {\"type\":\"code_interpreter\",\"data\":{\"code\":\"print(1)\"}}\n\n",
                "data: {\"content\":\" done\"}\n\ndata: [DONE]\n\n",
            ]),
            ChunkDecoder::default(),
        )
        .try_collect()
        .await
        .expect("stream");

        assert!(matches!(chunks[0], StreamChunk::TextDelta(ref t) if t == "Running"));
        assert!(matches!(
            chunks[1],
            StreamChunk::ToolEvent(ToolEvent { kind: ToolKind::CodeInterpreter, .. })
        ));
        assert!(matches!(chunks[2], StreamChunk::TextDelta(ref t) if t == " done"));
        assert_eq!(chunks[3], StreamChunk::Terminal);
        assert_eq!(chunks.len(), 4);
    }

    #[tokio::test]
    async fn read_error_ends_stream_after_delivered_chunks() {
        let parts: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"data: {\"content\":\"partial\"}\n\n")),
            Err(std::io::Error::other("connection reset")),
            Ok(bytes::Bytes::from_static(b"data: {\"content\":\"never\"}\n\n")),
        ];
        let mut stream = chunk_stream(Backend::Mojo, stream::iter(parts), ChunkDecoder::default());
        assert_eq!(
            stream.next().await.map(|r| r.expect("chunk")),
            Some(StreamChunk::TextDelta("partial".into()))
        );
        let err = stream.next().await.expect("error item").expect_err("transport");
        assert!(matches!(err, GatewayError::Transport { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn closure_without_terminal_just_ends() {
        let chunks: Vec<StreamChunk> = chunk_stream(
            Backend::Mojo,
            byte_stream(vec!["data: {\"content\":\"only\"}\n\n"]),
            ChunkDecoder::default(),
        )
        .try_collect()
        .await
        .expect("stream");
        assert_eq!(chunks, vec![StreamChunk::TextDelta("only".into())]);
    }
}
