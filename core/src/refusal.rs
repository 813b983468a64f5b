//! Refusal detector (M4, spec.md §4.7): the `RefusalRule` list, the
//! detection pass over a parsed LLM response, and the pending-refusal
//! resolution operations.

use crate::errors::ModifyError;
use crate::llm::Classifier;
use crate::model::{Flow, PendingRefusal, RawResponse, RefusalAnalysis, RefusalMetadata, RefusalStatus};
use crate::rules::Filter;
use serde::{Deserialize, Serialize};
use tollbooth_parsers::ParsedResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalActionType {
    Passthrough,
    PromptUser,
    Modify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    /// Approximate character budget is `tokens_to_analyze * 4`; `0` means no
    /// truncation (spec.md §4.7).
    pub tokens_to_analyze: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefusalRule {
    pub id: String,
    pub enabled: bool,
    pub priority: i64,
    pub detection: DetectionConfig,
    pub action: RefusalActionType,
    pub fallback_config: Option<FallbackConfig>,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// The `modify` prompt template; `{{original_response}}` is interpolated
    /// in by the caller before this reaches the LLM client (spec.md §4.7).
    pub prompt_template: String,
}

fn truncate_for_analysis(text: &str, tokens_to_analyze: u32) -> String {
    if tokens_to_analyze == 0 {
        return text.to_string();
    }
    let budget = (tokens_to_analyze as usize) * 4;
    text.chars().take(budget).collect()
}

pub struct Detection {
    pub rule: RefusalRule,
    pub score: f32,
}

/// Run every enabled, matching rule in priority order against `response`'s
/// concatenated text/thinking content, returning the first whose score
/// clears its threshold (spec.md §4.7: "a matching, enabled rule ... first
/// match wins in priority order"). A rule with no `filter` matches every
/// flow.
pub async fn detect(rules: &[RefusalRule], flow: &Flow, response: &ParsedResponse, classifier: &dyn Classifier) -> Result<Option<Detection>, ModifyError> {
    let text = response.concat_text_and_thinking();
    let mut candidates: Vec<&RefusalRule> = rules.iter().filter(|r| r.enabled && r.filter.as_ref().map(|f| f.matches(flow)).unwrap_or(true)).collect();
    candidates.sort_by_key(|r| r.priority);

    for rule in candidates {
        let analyzed = truncate_for_analysis(&text, rule.detection.tokens_to_analyze);
        let score = classifier.score(&analyzed).await?;
        if score >= rule.detection.confidence_threshold {
            return Ok(Some(Detection { rule: rule.clone(), score }));
        }
    }
    Ok(None)
}

pub fn metadata_for(detection: &Detection, now: i64) -> RefusalMetadata {
    RefusalMetadata {
        score: detection.score,
        matched_rule_id: Some(detection.rule.id.clone()),
        detected_at: now,
    }
}

pub fn new_pending_refusal(id: String, flow_id: String, now: i64, detection: &Detection, original_response: RawResponse) -> PendingRefusal {
    PendingRefusal {
        id,
        flow_id,
        timestamp: now,
        analysis: RefusalAnalysis {
            score: detection.score,
            threshold: detection.rule.detection.confidence_threshold,
            rule_id: detection.rule.id.clone(),
        },
        matched_rule_ref: Some(detection.rule.id.clone()),
        status: RefusalStatus::Pending,
        original_response,
        modified_response: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClassifier(f32);

    #[async_trait::async_trait]
    impl Classifier for FixedClassifier {
        async fn score(&self, _text: &str) -> Result<f32, ModifyError> {
            Ok(self.0)
        }
    }

    fn response(text: &str) -> ParsedResponse {
        ParsedResponse {
            provider: "anthropic".to_string(),
            content: vec![tollbooth_parsers::ContentBlock::Text { text: text.to_string() }],
            model: None,
            stop_reason: None,
            usage: None,
            raw: serde_json::json!({}),
        }
    }

    fn rule(id: &str, priority: i64, threshold: f32, action: RefusalActionType) -> RefusalRule {
        RefusalRule {
            id: id.to_string(),
            enabled: true,
            priority,
            detection: DetectionConfig { confidence_threshold: threshold, tokens_to_analyze: 0 },
            action,
            fallback_config: None,
            filter: None,
        }
    }

    fn flow(host: &str) -> Flow {
        Flow::new(
            "f1".to_string(),
            0,
            crate::model::RawRequest { method: "POST".into(), url: format!("https://{host}/v1/messages"), host: host.into(), port: 443, path: "/v1/messages".into(), headers: vec![], body: String::new() },
            true,
        )
    }

    #[tokio::test]
    async fn score_above_threshold_fires_detection() {
        let rules = vec![rule("r1", 1, 0.7, RefusalActionType::PromptUser)];
        let classifier = FixedClassifier(0.85);
        let detection = detect(&rules, &flow("api.example.com"), &response("I can't help with that."), &classifier).await.unwrap();
        assert!(detection.is_some());
        assert_eq!(detection.unwrap().rule.id, "r1");
    }

    #[tokio::test]
    async fn score_below_threshold_yields_no_detection() {
        let rules = vec![rule("r1", 1, 0.9, RefusalActionType::PromptUser)];
        let classifier = FixedClassifier(0.5);
        assert!(detect(&rules, &flow("api.example.com"), &response("sure"), &classifier).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_rule_is_skipped() {
        let mut r = rule("r1", 1, 0.1, RefusalActionType::Passthrough);
        r.enabled = false;
        let classifier = FixedClassifier(0.99);
        assert!(detect(&[r], &flow("api.example.com"), &response("anything"), &classifier).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rule_with_non_matching_filter_is_skipped() {
        let mut r = rule("r1", 1, 0.1, RefusalActionType::PromptUser);
        r.filter = Some(Filter { host: Some(crate::rules::StringPredicate { value: "other.example.com".into(), kind: crate::rules::MatchKind::Contains }), ..Default::default() });
        let classifier = FixedClassifier(0.99);
        assert!(detect(&[r], &flow("api.example.com"), &response("anything"), &classifier).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rule_with_matching_filter_fires() {
        let mut r = rule("r1", 1, 0.1, RefusalActionType::PromptUser);
        r.filter = Some(Filter { host: Some(crate::rules::StringPredicate { value: "api.example.com".into(), kind: crate::rules::MatchKind::Contains }), ..Default::default() });
        let classifier = FixedClassifier(0.99);
        let detection = detect(&[r], &flow("api.example.com"), &response("anything"), &classifier).await.unwrap();
        assert!(detection.is_some());
    }

    #[test]
    fn truncation_uses_four_chars_per_token() {
        let text = "a".repeat(100);
        assert_eq!(truncate_for_analysis(&text, 10).len(), 40);
        assert_eq!(truncate_for_analysis(&text, 0).len(), 100);
    }
}
