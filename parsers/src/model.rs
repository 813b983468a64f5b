use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One block of LLM message/response content (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: Value },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: Value },
    Thinking { thinking: String },
}

impl ContentBlock {
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn thinking(&self) -> Option<&str> {
        match self {
            ContentBlock::Thinking { thinking } => Some(thinking),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Common normalized request shape every provider parser produces
/// (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: Option<bool>,
    pub tools: Option<Value>,
    pub raw: Value,
}

/// Common normalized response shape every provider parser produces
/// (spec.md §4.5). `raw` carries `{"streaming": true, "chunks": N}` once the
/// response came from the stream accumulator (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedResponse {
    pub provider: String,
    pub content: Vec<ContentBlock>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
    pub raw: Value,
}

impl ParsedResponse {
    /// Concatenate every text and thinking block, in order — the refusal
    /// detector's (M4) input per spec.md §4.7.
    pub fn concat_text_and_thinking(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.text().or_else(|| block.thinking()))
            .collect::<Vec<_>>()
            .join("")
    }
}

/// The kind of content block a streaming start-of-block event announces
/// (spec.md §4.5's "start-of-block (type + index)").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

/// One interpreted event out of a provider's stream, after SSE framing has
/// already been stripped by the accumulator (spec.md §4.5, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PartialResponse {
    BlockStart { index: u32, kind: BlockKind },
    TextDelta { index: u32, text: String },
    ThinkingDelta { index: u32, text: String },
    ToolJsonDelta { index: u32, partial_json: String },
    BlockStop { index: u32 },
    MessageMeta { model: Option<String>, stop_reason: Option<String>, usage: Option<Usage> },
    MessageStop,
}
