//! The `modify_llm` modification engine: prompt construction, the
//! `LLMClient`/`Classifier` external collaborator interfaces, and the
//! in-process + persistent cache for `generate_once` (spec.md §4.6, §9
//! "polymorphism over parsers and classifier").

use crate::errors::ModifyError;
use crate::rules::{LlmMode, ModifyLlmAction};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tollbooth_common::interpolate::{interpolate, InterpolationContext};

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Outbound LLM provider HTTP client, external to the core per spec.md §1.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn chat(&self, provider: &str, messages: &[ChatMessage]) -> Result<String, ModifyError>;
}

/// The refusal-score classifier, external to the core per spec.md §1 beyond
/// the regex fallback (§4.7).
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn score(&self, text: &str) -> Result<f32, ModifyError>;
}

/// The regex-pattern fallback scorer spec.md §4.7 describes explicitly:
/// 1/2/3+ matched refusal patterns → 0.6/0.75/0.9.
pub struct RegexFallbackClassifier {
    patterns: Vec<regex::Regex>,
}

impl RegexFallbackClassifier {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            patterns: patterns.into_iter().filter_map(|p| regex::Regex::new(&p).ok()).collect(),
        }
    }

    pub fn with_default_patterns() -> Self {
        Self::new(
            [
                r"(?i)i can'?t (help|assist|comply)",
                r"(?i)i'?m (not able|unable) to",
                r"(?i)as an ai( language model)?,? i",
                r"(?i)i won'?t (help|provide|generate)",
                r"(?i)this (request|content) violates",
            ]
            .into_iter()
            .map(String::from),
        )
    }
}

#[async_trait]
impl Classifier for RegexFallbackClassifier {
    async fn score(&self, text: &str) -> Result<f32, ModifyError> {
        let matches = self.patterns.iter().filter(|re| re.is_match(text)).count();
        Ok(match matches {
            0 => 0.0,
            1 => 0.6,
            2 => 0.75,
            _ => 0.9,
        })
    }
}

/// Consulted on a `generate_once` miss before calling the LLM, and written
/// back to on a fresh generation — the on-disk half of the cache (spec.md
/// §4.6). Backed by `Persistence` (L7) in the running system.
#[async_trait]
pub trait PersistentLlmCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String);
}

/// The in-process half of the `generate_once` cache (spec.md §4.6, §5:
/// "serialized access; the on-disk mirror is consulted only on miss").
#[derive(Default)]
pub struct LlmCache {
    memory: RwLock<HashMap<String, String>>,
}

impl LlmCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.memory.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: String, value: String) {
        self.memory.write().await.insert(key, value);
    }

    /// `clearLLMCache(key?)` (spec.md §4.6): clears one key, or everything
    /// when `key` is `None`.
    pub async fn clear(&self, key: Option<&str>) {
        let mut guard = self.memory.write().await;
        match key {
            Some(key) => {
                guard.remove(key);
            }
            None => guard.clear(),
        }
    }
}

fn default_cache_key(rule_id: &str) -> String {
    format!("llm_cache_{rule_id}")
}

/// Build the outbound prompt for a `modify_llm` action: a named template (by
/// id, with `{{var}}`-interpolated variables substituted first) or a raw
/// prompt, itself interpolated against the flow context (spec.md §4.6).
pub fn resolve_prompt(action: &ModifyLlmAction, templates: &HashMap<String, String>, ctx: &dyn InterpolationContext) -> Option<String> {
    if let Some(template_id) = &action.template_id {
        let mut template = templates.get(template_id)?.clone();
        for (name, value) in &action.template_variables {
            template = template.replace(&format!("{{{{{name}}}}}"), value);
        }
        return Some(interpolate(&template, ctx));
    }
    action.raw_prompt.as_ref().map(|raw| interpolate(raw, ctx))
}

/// Drives `modify_llm`: resolves the prompt, picks the provider, and either
/// always calls out (`generate_live`) or consults the two-tier cache first
/// (`generate_once`).
pub struct ModificationEngine<'a> {
    pub client: &'a dyn LLMClient,
    pub memory_cache: &'a LlmCache,
    pub persistent_cache: &'a dyn PersistentLlmCache,
}

impl<'a> ModificationEngine<'a> {
    pub async fn generate(&self, action: &ModifyLlmAction, rule_id: &str, prompt: String, active_provider: &str) -> Result<String, ModifyError> {
        let provider = action.provider_override.as_deref().unwrap_or(active_provider);
        let messages = [ChatMessage { role: "user".to_string(), content: prompt }];

        match action.mode {
            LlmMode::GenerateLive => self.client.chat(provider, &messages).await,
            LlmMode::GenerateOnce => {
                let key = action.cache_key.clone().unwrap_or_else(|| default_cache_key(rule_id));
                if let Some(cached) = self.memory_cache.get(&key).await {
                    return Ok(cached);
                }
                if let Some(cached) = self.persistent_cache.get(&key).await {
                    self.memory_cache.set(key, cached.clone()).await;
                    return Ok(cached);
                }
                let generated = self.client.chat(provider, &messages).await?;
                self.memory_cache.set(key.clone(), generated.clone()).await;
                self.persistent_cache.set(&key, generated.clone()).await;
                Ok(generated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn regex_classifier_scales_with_match_count() {
        let classifier = RegexFallbackClassifier::with_default_patterns();
        assert_eq!(classifier.score("sure, here you go").await.unwrap(), 0.0);
        assert_eq!(classifier.score("I can't help with that.").await.unwrap(), 0.6);
        assert_eq!(
            classifier.score("I can't help with that. I'm not able to comply.").await.unwrap(),
            0.75
        );
    }

    #[tokio::test]
    async fn cache_clear_with_no_key_clears_everything() {
        let cache = LlmCache::new();
        cache.set("a".into(), "1".into()).await;
        cache.set("b".into(), "2".into()).await;
        cache.clear(None).await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_none());
    }

    #[test]
    fn resolve_prompt_substitutes_template_variables() {
        let mut templates = HashMap::new();
        templates.insert("t1".to_string(), "Rewrite: {{topic}}".to_string());
        let mut variables = std::collections::BTreeMap::new();
        variables.insert("topic".to_string(), "refusals".to_string());
        let action = ModifyLlmAction {
            template_id: Some("t1".into()),
            template_variables: variables,
            raw_prompt: None,
            provider_override: None,
            mode: LlmMode::GenerateLive,
            cache_key: None,
            allow_intercept: false,
        };
        struct Ctx;
        impl InterpolationContext for Ctx {
            fn method(&self) -> &str {
                "GET"
            }
            fn host(&self) -> &str {
                "h"
            }
            fn path(&self) -> &str {
                "/"
            }
            fn url(&self) -> &str {
                "http://h/"
            }
            fn header(&self, _: &str) -> Option<&str> {
                None
            }
        }
        assert_eq!(resolve_prompt(&action, &templates, &Ctx).unwrap(), "Rewrite: refusals");
    }
}
