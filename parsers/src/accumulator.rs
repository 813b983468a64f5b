use crate::model::{BlockKind, ContentBlock, ParsedResponse, PartialResponse, Usage};
use crate::registry::Parser;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Minimum spacing between partial snapshots pushed to the UI while a
/// response is still streaming (spec.md §4.6: "partial updates are
/// throttled, not per-chunk").
pub const PARTIAL_EMIT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
enum BlockState {
    Text(String),
    Thinking(String),
    ToolUse { id: String, name: String, partial_json: String },
}

impl BlockState {
    fn into_content_block(self) -> ContentBlock {
        match self {
            BlockState::Text(text) => ContentBlock::Text { text },
            BlockState::Thinking(thinking) => ContentBlock::Thinking { thinking },
            BlockState::ToolUse { id, name, partial_json } => {
                let input = serde_json::from_str(&partial_json).unwrap_or(Value::Null);
                ContentBlock::ToolUse { id, name, input }
            }
        }
    }
}

/// Folds a provider's stream events into a single `ParsedResponse`
/// (spec.md §4.6, module M2). One accumulator per in-flight streaming
/// response; owned by the flow it belongs to, never shared.
pub struct StreamAccumulator {
    provider: String,
    blocks: Vec<Option<BlockState>>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
    chunk_count: u64,
    last_partial_emit: Option<Instant>,
}

impl StreamAccumulator {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            blocks: Vec::new(),
            model: None,
            stop_reason: None,
            usage: None,
            chunk_count: 0,
            last_partial_emit: None,
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Splits raw SSE bytes into individual events, parses each with
    /// `parser`, and folds the resulting `PartialResponse`s into this
    /// accumulator's state. Returns the events observed, in order, so a
    /// caller can forward them verbatim to the proxy control channel if it
    /// needs per-chunk fidelity (spec.md §4.6 makes no such requirement, but
    /// doesn't forbid it either).
    pub fn feed_sse(&mut self, parser: &dyn Parser, raw: &[u8]) -> Vec<PartialResponse> {
        let text = String::from_utf8_lossy(raw);
        let mut events = Vec::new();
        for chunk in split_sse_events(&text) {
            if chunk.is_done() || chunk.should_skip() {
                continue;
            }
            if let Some(event) = parser.parse_stream_chunk(chunk.event.as_deref(), chunk.data.as_bytes()) {
                self.apply(event.clone());
                events.push(event);
            }
        }
        events
    }

    fn apply(&mut self, event: PartialResponse) {
        self.chunk_count += 1;
        match event {
            PartialResponse::BlockStart { index, kind } => {
                self.ensure_slot(index);
                self.blocks[index as usize] = Some(match kind {
                    BlockKind::Text => BlockState::Text(String::new()),
                    BlockKind::Thinking => BlockState::Thinking(String::new()),
                    BlockKind::ToolUse { id, name } => BlockState::ToolUse {
                        id,
                        name,
                        partial_json: String::new(),
                    },
                });
            }
            PartialResponse::TextDelta { index, text } => {
                self.ensure_slot(index);
                match self.blocks[index as usize].get_or_insert_with(|| BlockState::Text(String::new())) {
                    BlockState::Text(buf) => buf.push_str(&text),
                    other => *other = BlockState::Text(text),
                }
            }
            PartialResponse::ThinkingDelta { index, text } => {
                self.ensure_slot(index);
                match self.blocks[index as usize].get_or_insert_with(|| BlockState::Thinking(String::new())) {
                    BlockState::Thinking(buf) => buf.push_str(&text),
                    other => *other = BlockState::Thinking(text),
                }
            }
            PartialResponse::ToolJsonDelta { index, partial_json } => {
                self.ensure_slot(index);
                match self.blocks[index as usize].get_or_insert_with(|| BlockState::ToolUse {
                    id: String::new(),
                    name: String::new(),
                    partial_json: String::new(),
                }) {
                    BlockState::ToolUse { partial_json: buf, .. } => buf.push_str(&partial_json),
                    other => {
                        *other = BlockState::ToolUse {
                            id: String::new(),
                            name: String::new(),
                            partial_json,
                        }
                    }
                }
            }
            PartialResponse::BlockStop { .. } => {}
            PartialResponse::MessageMeta { model, stop_reason, usage } => {
                if model.is_some() {
                    self.model = model;
                }
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if usage.is_some() {
                    self.usage = usage;
                }
            }
            PartialResponse::MessageStop => {}
        }
    }

    fn ensure_slot(&mut self, index: u32) {
        let index = index as usize;
        if self.blocks.len() <= index {
            self.blocks.resize_with(index + 1, || None);
        }
    }

    /// Returns a snapshot for the UI if at least `PARTIAL_EMIT_INTERVAL` has
    /// elapsed since the last one, else `None`. Always returns `Some` the
    /// first time it's called on a given accumulator.
    pub fn maybe_partial(&mut self) -> Option<ParsedResponse> {
        let now = Instant::now();
        let due = match self.last_partial_emit {
            None => true,
            Some(last) => now.duration_since(last) >= PARTIAL_EMIT_INTERVAL,
        };
        if !due {
            return None;
        }
        self.last_partial_emit = Some(now);
        Some(self.snapshot(false))
    }

    /// Unconditionally produces the final merged response, regardless of
    /// throttling, and marks `raw.streaming = true` / `raw.chunks = N`
    /// (spec.md §4.6). Internal block buffers are dropped afterward so a
    /// finished accumulator doesn't hold onto streaming-sized text forever.
    pub fn finalize(&mut self) -> ParsedResponse {
        let response = self.snapshot(true);
        self.blocks.clear();
        self.blocks.shrink_to_fit();
        response
    }

    fn snapshot(&self, finalized: bool) -> ParsedResponse {
        let content = self
            .blocks
            .iter()
            .cloned()
            .filter_map(|b| b.map(BlockState::into_content_block))
            .collect();
        ParsedResponse {
            provider: self.provider.clone(),
            content,
            model: self.model.clone(),
            stop_reason: self.stop_reason.clone(),
            usage: self.usage.clone(),
            raw: json!({ "streaming": true, "chunks": self.chunk_count, "finalized": finalized }),
        }
    }
}

/// One SSE event, data already joined across multi-line `data:` fields.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn should_skip(&self) -> bool {
        self.data.trim().is_empty() || self.event.as_deref() == Some("ping")
    }
}

/// Splits a raw SSE byte stream into complete events, delimited by a blank
/// line, trimming the `event:`/`data:` field prefixes (spec.md §4.6).
/// Incomplete trailing events (no blank-line terminator yet) are dropped —
/// callers feed accumulated buffers, not arbitrary byte fragments.
pub fn split_sse_events(buf: &str) -> Vec<SseEvent> {
    buf.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(parse_one_event)
        .collect()
}

fn parse_one_event(block: &str) -> SseEvent {
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    SseEvent {
        event,
        data: data_lines.join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::anthropic::AnthropicParser;

    #[test]
    fn splits_events_on_blank_line() {
        let buf = "event: ping\ndata: {}\n\nevent: content_block_delta\ndata: {\"x\":1}\n\n";
        let events = split_sse_events(buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert!(events[0].should_skip());
        assert_eq!(events[1].data, r#"{"x":1}"#);
    }

    #[test]
    fn done_marker_is_recognized() {
        let events = split_sse_events("data: [DONE]\n\n");
        assert!(events[0].is_done());
    }

    #[test]
    fn accumulates_text_deltas_into_one_block() {
        let parser = AnthropicParser;
        let mut acc = StreamAccumulator::new("anthropic");
        let raw = concat!(
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        );
        acc.feed_sse(&parser, raw.as_bytes());
        let final_response = acc.finalize();
        assert_eq!(final_response.content.len(), 1);
        assert_eq!(final_response.content[0].text(), Some("Hello"));
        assert_eq!(final_response.raw["chunks"], json!(4));
    }

    #[test]
    fn ping_events_do_not_bump_chunk_count() {
        let parser = AnthropicParser;
        let mut acc = StreamAccumulator::new("anthropic");
        acc.feed_sse(&parser, b"event: ping\ndata: {}\n\n");
        assert_eq!(acc.chunk_count(), 0);
    }

    #[test]
    fn first_partial_snapshot_is_always_emitted() {
        let mut acc = StreamAccumulator::new("anthropic");
        assert!(acc.maybe_partial().is_some());
    }
}
