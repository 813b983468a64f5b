//! The concrete `LLMClient` (spec.md §9's "outbound LLM provider HTTP
//! clients" external collaborator): OpenAI-compatible chat completions over
//! `reqwest`, the lowest common denominator across the parsed providers
//! (spec.md §4.6, SPEC_FULL.md "supplemented detail").

use async_trait::async_trait;
use std::collections::HashMap;
use tollbooth_core::errors::ModifyError;
use tollbooth_core::llm::{ChatMessage, LLMClient};

pub struct ReqwestLlmClient {
    http: reqwest::Client,
    base_urls: HashMap<String, String>,
    api_keys: HashMap<String, String>,
}

impl ReqwestLlmClient {
    pub fn new(base_urls: HashMap<String, String>, api_keys: HashMap<String, String>) -> Self {
        Self { http: reqwest::Client::new(), base_urls, api_keys }
    }

    fn endpoint(&self, provider: &str) -> String {
        match self.base_urls.get(provider) {
            Some(base) => format!("{}/chat/completions", base.trim_end_matches('/')),
            None => "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }
}

#[async_trait]
impl LLMClient for ReqwestLlmClient {
    async fn chat(&self, provider: &str, messages: &[ChatMessage]) -> Result<String, ModifyError> {
        let body = serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": messages.iter().map(|m| serde_json::json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
        });

        let mut request = self.http.post(self.endpoint(provider)).json(&body);
        if let Some(key) = self.api_keys.get(provider) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|err| ModifyError::ClientFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ModifyError::ClientFailed(format!("provider {provider} returned {}", response.status())));
        }
        let payload: serde_json::Value = response.json().await.map_err(|err| ModifyError::ClientFailed(err.to_string()))?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ModifyError::ClientFailed("response had no choices[0].message.content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_falls_back_to_openai_when_no_base_url_configured() {
        let client = ReqwestLlmClient::new(HashMap::new(), HashMap::new());
        assert_eq!(client.endpoint("anthropic"), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn endpoint_uses_configured_base_url() {
        let mut base_urls = HashMap::new();
        base_urls.insert("openai".to_string(), "https://my-proxy.internal/v1/".to_string());
        let client = ReqwestLlmClient::new(base_urls, HashMap::new());
        assert_eq!(client.endpoint("openai"), "https://my-proxy.internal/v1/chat/completions");
    }
}
