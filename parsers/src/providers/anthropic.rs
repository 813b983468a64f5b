use crate::model::{BlockKind, ContentBlock, Message, ParsedRequest, ParsedResponse, PartialResponse, Usage};
use crate::registry::Parser;
use serde::Deserialize;
use serde_json::Value;

pub struct AnthropicParser;

impl Parser for AnthropicParser {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn can_parse(&self, host: &str, path: &str) -> bool {
        host.contains("anthropic.com") && path.contains("/v1/messages")
    }

    fn parse_request(&self, raw: &[u8]) -> Option<ParsedRequest> {
        let value: Value = serde_json::from_slice(raw).ok()?;
        let model = value.get("model")?.as_str()?.to_string();
        let messages = value
            .get("messages")?
            .as_array()?
            .iter()
            .map(parse_message)
            .collect::<Option<Vec<_>>>()?;

        let system = match value.get("system") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(blocks)) => Some(
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        };

        Some(ParsedRequest {
            provider: self.name().to_string(),
            model,
            messages,
            system,
            max_tokens: value.get("max_tokens").and_then(Value::as_u64).map(|v| v as u32),
            temperature: value.get("temperature").and_then(Value::as_f64).map(|v| v as f32),
            stream: value.get("stream").and_then(Value::as_bool),
            tools: value.get("tools").cloned(),
            raw: value,
        })
    }

    fn parse_response(&self, raw: &[u8]) -> Option<ParsedResponse> {
        let value: Value = serde_json::from_slice(raw).ok()?;
        let content = value
            .get("content")?
            .as_array()?
            .iter()
            .filter_map(parse_content_block)
            .collect();

        let usage = value.get("usage").and_then(|u| {
            Some(Usage {
                input_tokens: u.get("input_tokens")?.as_u64()?,
                output_tokens: u.get("output_tokens")?.as_u64()?,
                total_tokens: u.get("input_tokens")?.as_u64()? + u.get("output_tokens")?.as_u64()?,
            })
        });

        Some(ParsedResponse {
            provider: self.name().to_string(),
            content,
            model: value.get("model").and_then(Value::as_str).map(String::from),
            stop_reason: value.get("stop_reason").and_then(Value::as_str).map(String::from),
            usage,
            raw: value,
        })
    }

    fn parse_stream_chunk(&self, _event_type: Option<&str>, raw_chunk: &[u8]) -> Option<PartialResponse> {
        let value: AnthropicStreamEvent = serde_json::from_slice(raw_chunk).ok()?;
        match value {
            AnthropicStreamEvent::MessageStart { message } => Some(PartialResponse::MessageMeta {
                model: Some(message.model),
                stop_reason: None,
                usage: None,
            }),
            AnthropicStreamEvent::ContentBlockStart { index, content_block } => {
                let kind = match content_block {
                    RawContentBlock::Text { .. } => BlockKind::Text,
                    RawContentBlock::Thinking { .. } => BlockKind::Thinking,
                    RawContentBlock::ToolUse { id, name, .. } => BlockKind::ToolUse { id, name },
                };
                Some(PartialResponse::BlockStart { index, kind })
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                RawDelta::TextDelta { text } => Some(PartialResponse::TextDelta { index, text }),
                RawDelta::ThinkingDelta { thinking } => Some(PartialResponse::ThinkingDelta { index, text: thinking }),
                RawDelta::InputJsonDelta { partial_json } => {
                    Some(PartialResponse::ToolJsonDelta { index, partial_json })
                }
                RawDelta::SignatureDelta { .. } => None,
            },
            AnthropicStreamEvent::ContentBlockStop { index } => Some(PartialResponse::BlockStop { index }),
            AnthropicStreamEvent::MessageDelta { delta, usage } => Some(PartialResponse::MessageMeta {
                model: None,
                stop_reason: delta.stop_reason,
                usage: Some(Usage {
                    input_tokens: usage.input_tokens.unwrap_or(0),
                    output_tokens: usage.output_tokens.unwrap_or(0),
                    total_tokens: usage.input_tokens.unwrap_or(0) + usage.output_tokens.unwrap_or(0),
                }),
            }),
            AnthropicStreamEvent::MessageStop => Some(PartialResponse::MessageStop),
            AnthropicStreamEvent::Ping => None,
        }
    }
}

fn parse_message(raw: &Value) -> Option<Message> {
    let role = raw.get("role")?.as_str()?.to_string();
    let content = match raw.get("content")? {
        Value::String(text) => vec![ContentBlock::Text { text: text.clone() }],
        Value::Array(blocks) => blocks.iter().filter_map(parse_content_block).collect(),
        _ => return None,
    };
    Some(Message { role, content })
}

fn parse_content_block(raw: &Value) -> Option<ContentBlock> {
    match raw.get("type")?.as_str()? {
        "text" => Some(ContentBlock::Text {
            text: raw.get("text")?.as_str()?.to_string(),
        }),
        "thinking" => Some(ContentBlock::Thinking {
            thinking: raw.get("thinking")?.as_str()?.to_string(),
        }),
        "image" => Some(ContentBlock::Image {
            source: raw.get("source").cloned().unwrap_or(Value::Null),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: raw.get("id")?.as_str()?.to_string(),
            name: raw.get("name")?.as_str()?.to_string(),
            input: raw.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: raw.get("tool_use_id")?.as_str()?.to_string(),
            content: raw.get("content").cloned().unwrap_or(Value::Null),
        }),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart { message: RawMessageStart },
    ContentBlockStart { index: u32, content_block: RawContentBlock },
    ContentBlockDelta { index: u32, delta: RawDelta },
    ContentBlockStop { index: u32 },
    MessageDelta { delta: RawMessageDelta, usage: RawUsage },
    MessageStop,
    Ping,
}

#[derive(Deserialize)]
struct RawMessageStart {
    model: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawContentBlock {
    Text { #[serde(default)] text: String },
    Thinking { #[serde(default)] thinking: String },
    ToolUse { id: String, name: String },
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum RawDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(rename = "signature_delta")]
    SignatureDelta { signature: String },
}

#[derive(Deserialize)]
struct RawMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_matches_anthropic_messages() {
        let parser = AnthropicParser;
        assert!(parser.can_parse("api.anthropic.com", "/v1/messages"));
        assert!(!parser.can_parse("api.openai.com", "/v1/messages"));
    }

    #[test]
    fn parses_minimal_request() {
        let parser = AnthropicParser;
        let raw = br#"{"model":"claude-3-opus","messages":[{"role":"user","content":"hi"}],"max_tokens":100}"#;
        let parsed = parser.parse_request(raw).unwrap();
        assert_eq!(parsed.model, "claude-3-opus");
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].content[0].text(), Some("hi"));
    }

    #[test]
    fn malformed_request_returns_none() {
        let parser = AnthropicParser;
        assert!(parser.parse_request(b"not json").is_none());
        assert!(parser.parse_request(b"{}").is_none());
    }

    #[test]
    fn parses_text_delta_event() {
        let parser = AnthropicParser;
        let raw = br#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#;
        let event = parser.parse_stream_chunk(None, raw).unwrap();
        assert_eq!(event, PartialResponse::TextDelta { index: 0, text: "Hel".to_string() });
    }

    #[test]
    fn ping_event_yields_none() {
        let parser = AnthropicParser;
        assert!(parser.parse_stream_chunk(None, br#"{"type":"ping"}"#).is_none());
    }
}
