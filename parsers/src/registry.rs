use crate::model::{ParsedRequest, ParsedResponse, PartialResponse};

/// `Parser { canParse, parseRequest, parseResponse, parseStreamChunk }`
/// (spec.md §4.5, §9 "polymorphism over parsers"). New providers are added
/// by registering another implementation; nothing outside `ParserRegistry`
/// switches on provider identity.
pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_parse(&self, host: &str, path: &str) -> bool;

    /// `None` on anything that doesn't parse as this provider's request
    /// shape. Never panics (spec.md §4.5 "Parsers MUST be total").
    fn parse_request(&self, raw: &[u8]) -> Option<ParsedRequest>;

    fn parse_response(&self, raw: &[u8]) -> Option<ParsedResponse>;

    /// `raw_chunk` is one already SSE-framed event body (prefixes trimmed,
    /// `ping`/`[DONE]` already filtered by the caller — see
    /// `accumulator::split_sse_events`).
    fn parse_stream_chunk(&self, event_type: Option<&str>, raw_chunk: &[u8]) -> Option<PartialResponse>;
}

/// Selects a provider `Parser` by host + path (spec.md §4.5: "Provider
/// selection is by host + path").
pub struct ParserRegistry {
    parsers: Vec<Box<dyn Parser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: vec![
                Box::new(crate::providers::anthropic::AnthropicParser),
                Box::new(crate::providers::openai::OpenAiParser),
                Box::new(crate::providers::google::GoogleParser),
                Box::new(crate::providers::codex::CodexParser),
            ],
        }
    }

    pub fn select(&self, host: &str, path: &str) -> Option<&dyn Parser> {
        self.parsers
            .iter()
            .map(|p| p.as_ref())
            .find(|p| p.can_parse(host, path))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_anthropic_by_host_and_path() {
        let registry = ParserRegistry::new();
        let parser = registry
            .select("api.anthropic.com", "/v1/messages")
            .expect("anthropic parser");
        assert_eq!(parser.name(), "anthropic");
    }

    #[test]
    fn selects_openai_for_chat_completions_path() {
        let registry = ParserRegistry::new();
        let parser = registry
            .select("api.openai.com", "/v1/chat/completions")
            .expect("openai parser");
        assert_eq!(parser.name(), "openai");
    }

    #[test]
    fn no_match_returns_none() {
        let registry = ParserRegistry::new();
        assert!(registry.select("example.com", "/unrelated").is_none());
    }
}
