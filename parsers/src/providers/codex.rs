use crate::model::{ParsedRequest, ParsedResponse, PartialResponse};
use crate::providers::openai::{parse_openai_request, parse_openai_response, parse_openai_stream_chunk};
use crate::registry::Parser;

/// The Codex CLI's backend speaks OpenAI-compatible chat completions against
/// its own host (spec.md §4.5: "an OpenAI-compatible Codex endpoint"), so the
/// wire shape is identical to `providers::openai` — only selection differs.
pub struct CodexParser;

impl Parser for CodexParser {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn can_parse(&self, host: &str, path: &str) -> bool {
        host.contains("chatgpt.com") && path.contains("/backend-api/codex")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_matches_codex_backend_path() {
        let parser = CodexParser;
        assert!(parser.can_parse("chatgpt.com", "/backend-api/codex/responses"));
        assert!(!parser.can_parse("api.openai.com", "/v1/chat/completions"));
    }

    #[test]
    fn parses_minimal_request_like_openai() {
        let parser = CodexParser;
        let raw = br#"{"model":"codex-mini","messages":[{"role":"user","content":"hi"}]}"#;
        let parsed = parser.parse_request(raw).unwrap();
        assert_eq!(parsed.provider, "codex");
        assert_eq!(parsed.model, "codex-mini");
    }
}
