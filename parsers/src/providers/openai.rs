use crate::model::{BlockKind, ContentBlock, Message, ParsedRequest, ParsedResponse, PartialResponse, Usage};
use crate::registry::Parser;
use serde_json::Value;

pub struct OpenAiParser;

impl Parser for OpenAiParser {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn can_parse(&self, _host: &str, path: &str) -> bool {
        path.contains("/v1/chat/completions")
    }

    fn parse_request(&self, raw: &[u8]) -> Option<ParsedRequest> {
        parse_openai_request(self.name(), raw)
    }

    fn parse_response(&self, raw: &[u8]) -> Option<ParsedResponse> {
        parse_openai_response(self.name(), raw)
    }

    fn parse_stream_chunk(&self, _event_type: Option<&str>, raw_chunk: &[u8]) -> Option<PartialResponse> {
        parse_openai_stream_chunk(raw_chunk)
    }
}

/// Shared with `providers::codex`, which is wire-identical to OpenAI chat
/// completions but selected by a different host/path pair (spec.md §4.5:
/// "an OpenAI-compatible Codex endpoint").
pub(crate) fn parse_openai_request(provider: &str, raw: &[u8]) -> Option<ParsedRequest> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    let model = value.get("model")?.as_str()?.to_string();
    let messages = value
        .get("messages")?
        .as_array()?
        .iter()
        .map(parse_message)
        .collect::<Option<Vec<_>>>()?;

    let system = messages
        .iter()
        .find(|m| m.role == "system")
        .and_then(|m| m.content.first())
        .and_then(ContentBlock::text)
        .map(String::from);

    Some(ParsedRequest {
        provider: provider.to_string(),
        model,
        messages,
        system,
        max_tokens: value
            .get("max_tokens")
            .or_else(|| value.get("max_completion_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        temperature: value.get("temperature").and_then(Value::as_f64).map(|v| v as f32),
        stream: value.get("stream").and_then(Value::as_bool),
        tools: value.get("tools").cloned(),
        raw: value,
    })
}

pub(crate) fn parse_openai_response(provider: &str, raw: &[u8]) -> Option<ParsedResponse> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    let choice = value.get("choices")?.as_array()?.first()?;
    let message = choice.get("message")?;
    let content = parse_message_content(message)?;

    let usage = value.get("usage").and_then(|u| {
        let prompt = u.get("prompt_tokens")?.as_u64()?;
        let completion = u.get("completion_tokens")?.as_u64()?;
        Some(Usage {
            input_tokens: prompt,
            output_tokens: completion,
            total_tokens: prompt + completion,
        })
    });

    Some(ParsedResponse {
        provider: provider.to_string(),
        content,
        model: value.get("model").and_then(Value::as_str).map(String::from),
        stop_reason: choice.get("finish_reason").and_then(Value::as_str).map(String::from),
        usage,
        raw: value,
    })
}

pub(crate) fn parse_openai_stream_chunk(raw_chunk: &[u8]) -> Option<PartialResponse> {
    let value: Value = serde_json::from_slice(raw_chunk).ok()?;
    let choice = value.get("choices")?.as_array()?.first()?;
    let delta = choice.get("delta")?;

    if let Some(finish_reason) = choice.get("finish_reason").and_then(Value::as_str) {
        return Some(PartialResponse::MessageMeta {
            model: value.get("model").and_then(Value::as_str).map(String::from),
            stop_reason: Some(finish_reason.to_string()),
            usage: None,
        });
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        let call = tool_calls.first()?;
        let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
        if let Some(name) = call.get("function").and_then(|f| f.get("name")).and_then(Value::as_str) {
            let id = call.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            return Some(PartialResponse::BlockStart {
                index,
                kind: BlockKind::ToolUse { id, name: name.to_string() },
            });
        }
        if let Some(partial_json) = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
        {
            return Some(PartialResponse::ToolJsonDelta { index, partial_json: partial_json.to_string() });
        }
        return None;
    }

    let content = delta.get("content")?.as_str()?;
    Some(PartialResponse::TextDelta { index: 0, text: content.to_string() })
}

fn parse_message(raw: &Value) -> Option<Message> {
    let role = raw.get("role")?.as_str()?.to_string();
    let content = parse_message_content(raw)?;
    Some(Message { role, content })
}

fn parse_message_content(raw: &Value) -> Option<Vec<ContentBlock>> {
    match raw.get("content") {
        Some(Value::String(text)) => Some(vec![ContentBlock::Text { text: text.clone() }]),
        Some(Value::Array(parts)) => Some(
            parts
                .iter()
                .filter_map(|p| {
                    let kind = p.get("type")?.as_str()?;
                    match kind {
                        "text" => Some(ContentBlock::Text {
                            text: p.get("text")?.as_str()?.to_string(),
                        }),
                        "image_url" => Some(ContentBlock::Image {
                            source: p.get("image_url").cloned().unwrap_or(Value::Null),
                        }),
                        _ => None,
                    }
                })
                .collect(),
        ),
        Some(Value::Null) | None => {
            // assistant messages with only tool_calls have no content
            let tool_calls = raw.get("tool_calls")?.as_array()?;
            Some(
                tool_calls
                    .iter()
                    .filter_map(|call| {
                        let id = call.get("id")?.as_str()?.to_string();
                        let function = call.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let args_str = function.get("arguments")?.as_str()?;
                        let input = serde_json::from_str(args_str).unwrap_or(Value::Null);
                        Some(ContentBlock::ToolUse { id, name, input })
                    })
                    .collect(),
            )
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_matches_chat_completions_path() {
        let parser = OpenAiParser;
        assert!(parser.can_parse("api.openai.com", "/v1/chat/completions"));
        assert!(!parser.can_parse("api.openai.com", "/v1/embeddings"));
    }

    #[test]
    fn parses_minimal_request() {
        let parser = OpenAiParser;
        let raw = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
        let parsed = parser.parse_request(raw).unwrap();
        assert_eq!(parsed.model, "gpt-4o");
        assert_eq!(parsed.messages[0].content[0].text(), Some("hi"));
    }

    #[test]
    fn parses_text_delta_chunk() {
        let parser = OpenAiParser;
        let raw = br#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        let event = parser.parse_stream_chunk(None, raw).unwrap();
        assert_eq!(event, PartialResponse::TextDelta { index: 0, text: "Hel".into() });
    }

    #[test]
    fn malformed_chunk_yields_none() {
        let parser = OpenAiParser;
        assert!(parser.parse_stream_chunk(None, b"{}").is_none());
    }
}
