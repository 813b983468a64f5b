use crate::model::{ContentBlock, Message, ParsedRequest, ParsedResponse, PartialResponse, Usage};
use crate::registry::Parser;
use serde_json::Value;

pub struct GoogleParser;

impl Parser for GoogleParser {
    fn name(&self) -> &'static str {
        "google"
    }

    fn can_parse(&self, host: &str, path: &str) -> bool {
        host.contains("generativelanguage.googleapis.com") && path.contains("/models/")
    }

    fn parse_request(&self, raw: &[u8]) -> Option<ParsedRequest> {
        let value: Value = serde_json::from_slice(raw).ok()?;
        let contents = value.get("contents")?.as_array()?;
        let messages = contents.iter().map(parse_content).collect::<Option<Vec<_>>>()?;

        let system = value
            .get("systemInstruction")
            .and_then(|s| s.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            });

        let generation_config = value.get("generationConfig");

        Some(ParsedRequest {
            provider: self.name().to_string(),
            model: value
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("gemini")
                .to_string(),
            messages,
            system,
            max_tokens: generation_config
                .and_then(|c| c.get("maxOutputTokens"))
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            temperature: generation_config
                .and_then(|c| c.get("temperature"))
                .and_then(Value::as_f64)
                .map(|v| v as f32),
            stream: None,
            tools: value.get("tools").cloned(),
            raw: value,
        })
    }

    fn parse_response(&self, raw: &[u8]) -> Option<ParsedResponse> {
        let value: Value = serde_json::from_slice(raw).ok()?;
        let candidate = value.get("candidates")?.as_array()?.first()?;
        let content = candidate
            .get("content")?
            .get("parts")?
            .as_array()?
            .iter()
            .filter_map(parse_part)
            .collect();

        let usage = value.get("usageMetadata").and_then(|u| {
            let input = u.get("promptTokenCount")?.as_u64()?;
            let output = u.get("candidatesTokenCount")?.as_u64()?;
            Some(Usage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
            })
        });

        Some(ParsedResponse {
            provider: self.name().to_string(),
            content,
            model: value.get("modelVersion").and_then(Value::as_str).map(String::from),
            stop_reason: candidate.get("finishReason").and_then(Value::as_str).map(String::from),
            usage,
            raw: value,
        })
    }

    fn parse_stream_chunk(&self, _event_type: Option<&str>, raw_chunk: &[u8]) -> Option<PartialResponse> {
        let value: Value = serde_json::from_slice(raw_chunk).ok()?;
        let candidate = value.get("candidates")?.as_array()?.first()?;

        if let Some(finish_reason) = candidate.get("finishReason").and_then(Value::as_str) {
            return Some(PartialResponse::MessageMeta {
                model: value.get("modelVersion").and_then(Value::as_str).map(String::from),
                stop_reason: Some(finish_reason.to_string()),
                usage: None,
            });
        }

        let part = candidate.get("content")?.get("parts")?.as_array()?.first()?;
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            return Some(PartialResponse::TextDelta { index: 0, text: text.to_string() });
        }
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name")?.as_str()?.to_string();
            let args = call.get("args").cloned().unwrap_or(Value::Null);
            return Some(PartialResponse::ToolJsonDelta {
                index: 0,
                partial_json: args.to_string(),
            });
        }
        None
    }
}

fn parse_content(raw: &Value) -> Option<Message> {
    let role = raw.get("role")?.as_str()?.to_string();
    let parts = raw.get("parts")?.as_array()?;
    let content = parts.iter().filter_map(parse_part).collect();
    Some(Message { role, content })
}

fn parse_part(raw: &Value) -> Option<ContentBlock> {
    if let Some(text) = raw.get("text").and_then(Value::as_str) {
        return Some(ContentBlock::Text { text: text.to_string() });
    }
    if let Some(call) = raw.get("functionCall") {
        let name = call.get("name")?.as_str()?.to_string();
        let input = call.get("args").cloned().unwrap_or(Value::Null);
        return Some(ContentBlock::ToolUse {
            id: name.clone(),
            name,
            input,
        });
    }
    if let Some(response) = raw.get("functionResponse") {
        let name = response.get("name")?.as_str()?.to_string();
        let content = response.get("response").cloned().unwrap_or(Value::Null);
        return Some(ContentBlock::ToolResult {
            tool_use_id: name,
            content,
        });
    }
    if let Some(data) = raw.get("inlineData") {
        return Some(ContentBlock::Image { source: data.clone() });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_matches_generativelanguage_host() {
        let parser = GoogleParser;
        assert!(parser.can_parse(
            "generativelanguage.googleapis.com",
            "/v1beta/models/gemini-1.5-pro:generateContent"
        ));
        assert!(!parser.can_parse("api.openai.com", "/v1/chat/completions"));
    }

    #[test]
    fn parses_minimal_request() {
        let parser = GoogleParser;
        let raw = br#"{"contents":[{"role":"user","parts":[{"text":"hi"}]}]}"#;
        let parsed = parser.parse_request(raw).unwrap();
        assert_eq!(parsed.messages[0].content[0].text(), Some("hi"));
    }

    #[test]
    fn parses_text_part_response() {
        let parser = GoogleParser;
        let raw = br#"{"candidates":[{"content":{"parts":[{"text":"hello"}]},"finishReason":"STOP"}]}"#;
        let parsed = parser.parse_response(raw).unwrap();
        assert_eq!(parsed.content[0].text(), Some("hello"));
        assert_eq!(parsed.stop_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn malformed_request_returns_none() {
        let parser = GoogleParser;
        assert!(parser.parse_request(b"{}").is_none());
    }
}
