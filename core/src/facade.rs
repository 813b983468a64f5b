//! Public facade (T4, spec.md §4.9): the thin async surface the REST layer
//! drives. Every lookup accepts either a short or full id — `Storage`'s
//! alias map already resolves that internally for most operations; the
//! handful that don't (rules, pending queues) resolve explicitly here.

use crate::errors::RuleValidationError;
use crate::events::{EventBus, UiEvent};
use crate::intercept::{InterceptManager, InterceptMode, Verdict};
use crate::llm::LlmCache;
use crate::model::{Conversation, Flow, PendingRefusal, RefusalStatus, StoredItem, StoredKind};
use crate::refusal::RefusalRule;
use crate::rules::Rule;
use crate::storage::Storage;
use std::sync::Arc;
use tollbooth_common::errors::{CoreError, CoreResult};
use uuid::Uuid;

/// Everything the REST/control-channel layer needs in one handle, mirroring
/// the teacher's `AppState`-bundles-every-collaborator pattern.
pub struct Facade {
    pub storage: Arc<Storage>,
    pub intercept: Arc<InterceptManager>,
    pub events: Arc<EventBus>,
    pub llm_cache: Arc<LlmCache>,
}

impl Facade {
    pub fn new(storage: Arc<Storage>, intercept: Arc<InterceptManager>, events: Arc<EventBus>, llm_cache: Arc<LlmCache>) -> Self {
        Self { storage, intercept, events, llm_cache }
    }

    // ---- traffic ----

    pub async fn list_flows(&self) -> Vec<Flow> {
        self.storage.list_flows().await
    }

    pub async fn get_flow(&self, id: &str) -> CoreResult<Flow> {
        self.storage.get_flow(id).await.ok_or_else(|| CoreError::FlowNotFound(id.to_string()))
    }

    pub async fn delete_flow(&self, id: &str) -> CoreResult<()> {
        if self.storage.delete_flow(id).await {
            self.events.publish(UiEvent::TrafficDeleted { flow_id: id.to_string() });
            Ok(())
        } else {
            Err(CoreError::FlowNotFound(id.to_string()))
        }
    }

    pub async fn clear_traffic(&self) {
        for flow in self.storage.list_flows().await {
            self.storage.delete_flow(&flow.flow_id).await;
        }
        self.events.publish(UiEvent::TrafficCleared);
    }

    pub async fn list_conversations(&self) -> Vec<Conversation> {
        self.storage.list_conversations().await
    }

    /// Replays correlation over every persisted LLM flow that still has a
    /// parsed request, discarding the current conversation list and
    /// rebuilding it from scratch (spec.md §4.8 "a rebuild operation can be
    /// triggered from persisted traffic"). Non-LLM flows and flows whose
    /// request never parsed are skipped; they were never correlated in the
    /// first place.
    pub async fn rebuild_conversations(&self) -> Vec<Conversation> {
        let items = self
            .storage
            .list_flows()
            .await
            .into_iter()
            .filter(|f| f.is_llm_api)
            .filter_map(|f| {
                let request = f.parsed?;
                let streaming = request.stream.unwrap_or(false);
                Some(crate::correlator::RebuildItem {
                    flow_id: f.flow_id,
                    timestamp: f.timestamp,
                    request,
                    response: f.parsed_response,
                    streaming,
                })
            })
            .collect::<Vec<_>>();
        let conversations = crate::correlator::rebuild(items, || Uuid::new_v4().to_string(), || Uuid::new_v4().to_string());
        self.storage.replace_conversations(conversations.clone()).await;
        for conversation in &conversations {
            self.events.publish(UiEvent::Conversation { conversation: conversation.clone() });
        }
        conversations
    }

    // ---- rules ----

    pub async fn list_rules(&self) -> Vec<Rule> {
        self.storage.list_rules().await
    }

    pub async fn create_rule(&self, mut rule: Rule) -> CoreResult<Rule> {
        validate_rule(&rule)?;
        rule.id = Uuid::new_v4().to_string();
        rule.short_id = String::new();
        let inserted = self.storage.insert_rule(rule).await;
        Ok(inserted)
    }

    pub async fn delete_rule(&self, id: &str) -> CoreResult<()> {
        if self.storage.delete_rule(id).await {
            Ok(())
        } else {
            Err(CoreError::RuleNotFound(id.to_string()))
        }
    }

    pub async fn set_rule_enabled(&self, id: &str, enabled: bool) -> CoreResult<()> {
        if self.storage.update_rule(id, |r| r.enabled = enabled).await {
            Ok(())
        } else {
            Err(CoreError::RuleNotFound(id.to_string()))
        }
    }

    pub async fn set_rules_enabled(&self, enabled: bool) {
        self.storage.set_rules_enabled(enabled).await;
        self.events.publish(UiEvent::RulesEnabledChanged { enabled });
    }

    pub async fn set_intercept_mode(&self, mode: InterceptMode) {
        self.storage.set_intercept_mode(mode).await;
        self.events.publish(UiEvent::InterceptModeChanged { mode });
    }

    // ---- pending intercepts ----

    pub async fn forward_pending(&self, flow_id: &str) -> CoreResult<Verdict> {
        let verdict = self
            .intercept
            .forward_pending(flow_id)
            .await
            .ok_or_else(|| CoreError::PendingInterceptNotFound(flow_id.to_string()))?;
        self.events.publish(UiEvent::InterceptCompleted { flow_id: flow_id.to_string() });
        Ok(verdict)
    }

    pub async fn drop_pending(&self, flow_id: &str) -> CoreResult<Verdict> {
        let verdict = self
            .intercept
            .drop_pending(flow_id)
            .await
            .ok_or_else(|| CoreError::PendingInterceptNotFound(flow_id.to_string()))?;
        self.events.publish(UiEvent::InterceptDropped { flow_id: flow_id.to_string() });
        Ok(verdict)
    }

    // ---- data store (L4) ----

    pub async fn save_stored_item(&self, item: StoredItem) -> StoredItem {
        self.storage.put_stored_item(item).await
    }

    pub async fn get_stored_request(&self, key: &str) -> CoreResult<StoredItem> {
        self.storage.get_stored_request(key).await.ok_or_else(|| CoreError::StoreKeyNotFound(key.to_string()))
    }

    pub async fn get_stored_response(&self, key: &str) -> CoreResult<StoredItem> {
        self.storage.get_stored_response(key).await.ok_or_else(|| CoreError::StoreKeyNotFound(key.to_string()))
    }

    pub async fn delete_stored_item(&self, kind: StoredKind, key: &str) -> CoreResult<()> {
        let deleted = match kind {
            StoredKind::Request => self.storage.delete_stored_request(key).await,
            StoredKind::Response => self.storage.delete_stored_response(key).await,
        };
        if deleted {
            Ok(())
        } else {
            Err(CoreError::StoreKeyNotFound(key.to_string()))
        }
    }

    // ---- refusal resolution (spec.md §4.7 "prompt_user" path) ----

    pub async fn list_pending_refusals(&self) -> Vec<PendingRefusal> {
        self.storage.list_pending_refusals().await
    }

    pub async fn approve_refusal(&self, id: &str) -> CoreResult<PendingRefusal> {
        self.resolve_refusal(id, RefusalStatus::Approved, None).await
    }

    pub async fn reject_refusal(&self, id: &str) -> CoreResult<PendingRefusal> {
        self.resolve_refusal(id, RefusalStatus::Rejected, None).await
    }

    pub async fn modify_refusal(&self, id: &str, body: String) -> CoreResult<PendingRefusal> {
        self.resolve_refusal(id, RefusalStatus::Modified, Some(body)).await
    }

    async fn resolve_refusal(&self, id: &str, status: RefusalStatus, modified_body: Option<String>) -> CoreResult<PendingRefusal> {
        let mut pending = self
            .storage
            .remove_pending_refusal(id)
            .await
            .ok_or_else(|| CoreError::PendingRefusalNotFound(id.to_string()))?;
        pending.status = status;
        if let Some(body) = modified_body {
            let mut response = pending.original_response.clone();
            response.body = body;
            pending.modified_response = Some(response);
        }
        self.events.publish(UiEvent::RefusalResolved { id: id.to_string(), status });
        Ok(pending)
    }

    // ---- refusal rules ----

    pub async fn list_refusal_rules(&self) -> Vec<RefusalRule> {
        self.storage.list_refusal_rules().await
    }

    pub async fn replace_refusal_rules(&self, rules: Vec<RefusalRule>) {
        self.storage.replace_refusal_rules(rules).await;
    }

    // ---- LLM cache ----

    pub async fn clear_llm_cache(&self, key: Option<&str>) {
        self.llm_cache.clear(key).await;
    }
}

fn validate_rule(rule: &Rule) -> CoreResult<()> {
    if rule.name.trim().is_empty() {
        return Err(RuleValidationError::EmptyName.into());
    }
    match &rule.action {
        crate::rules::ActionPayload::ServeFromStore(action) if action.store_keys.is_empty() => {
            Err(RuleValidationError::MissingStoreKeys.into())
        }
        crate::rules::ActionPayload::ModifyLlm(action) if action.template_id.is_none() && action.raw_prompt.is_none() => {
            Err(RuleValidationError::MissingPrompt.into())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ActionPayload, Direction, Filter};

    fn facade() -> Facade {
        let storage = Arc::new(Storage::new());
        let intercept = Arc::new(InterceptManager::new(storage.clone(), false));
        Facade::new(storage, intercept, Arc::new(EventBus::new()), Arc::new(LlmCache::new()))
    }

    fn passthrough_rule(name: &str) -> Rule {
        Rule {
            id: String::new(),
            short_id: String::new(),
            name: name.to_string(),
            enabled: true,
            direction: Direction::Request,
            priority: 0,
            filter: Filter::default(),
            action: ActionPayload::Passthrough,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn create_rule_assigns_a_fresh_short_id() {
        let facade = facade();
        let created = facade.create_rule(passthrough_rule("r")).await.unwrap();
        assert_eq!(created.short_id, "r1");
    }

    #[tokio::test]
    async fn create_rule_rejects_empty_name() {
        let facade = facade();
        let err = facade.create_rule(passthrough_rule("")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRule(_)));
    }

    #[tokio::test]
    async fn forward_pending_missing_flow_errors() {
        let facade = facade();
        let err = facade.forward_pending("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::PendingInterceptNotFound(_)));
    }

    #[tokio::test]
    async fn approve_refusal_round_trips_status() {
        let facade = facade();
        let pending = PendingRefusal {
            id: "pr1".into(),
            flow_id: "f1".into(),
            timestamp: 0,
            analysis: crate::model::RefusalAnalysis { score: 0.9, threshold: 0.7, rule_id: "r1".into() },
            matched_rule_ref: Some("r1".into()),
            status: RefusalStatus::Pending,
            original_response: crate::model::RawResponse { status_code: 200, headers: vec![], body: "no".into() },
            modified_response: None,
        };
        facade.storage.insert_pending_refusal(pending).await;
        let resolved = facade.approve_refusal("pr1").await.unwrap();
        assert_eq!(resolved.status, RefusalStatus::Approved);
    }

    /// End of spec.md §8 scenario 6: a `modify` resolve on a held refusal
    /// carries the custom body into `modified_response` and publishes
    /// `refusal_resolved { status: "modified" }`.
    #[tokio::test]
    async fn modify_refusal_carries_custom_body_and_publishes_resolved() {
        let facade = facade();
        let mut subscriber = facade.events.subscribe();
        let pending = PendingRefusal {
            id: "pr2".into(),
            flow_id: "f2".into(),
            timestamp: 0,
            analysis: crate::model::RefusalAnalysis { score: 0.85, threshold: 0.7, rule_id: "r1".into() },
            matched_rule_ref: Some("r1".into()),
            status: RefusalStatus::Pending,
            original_response: crate::model::RawResponse { status_code: 200, headers: vec![], body: "I can't help with that.".into() },
            modified_response: None,
        };
        facade.storage.insert_pending_refusal(pending).await;

        let resolved = facade.modify_refusal("pr2", "Here's a rewritten answer.".to_string()).await.unwrap();
        assert_eq!(resolved.status, RefusalStatus::Modified);
        assert_eq!(resolved.modified_response.unwrap().body, "Here's a rewritten answer.");
        assert!(facade.list_pending_refusals().await.is_empty());

        let event = subscriber.recv().await.unwrap();
        assert!(matches!(event, UiEvent::RefusalResolved { id, status } if id == "pr2" && status == RefusalStatus::Modified));
    }

    #[tokio::test]
    async fn reject_refusal_round_trips_status() {
        let facade = facade();
        let pending = PendingRefusal {
            id: "pr3".into(),
            flow_id: "f3".into(),
            timestamp: 0,
            analysis: crate::model::RefusalAnalysis { score: 0.9, threshold: 0.7, rule_id: "r1".into() },
            matched_rule_ref: Some("r1".into()),
            status: RefusalStatus::Pending,
            original_response: crate::model::RawResponse { status_code: 200, headers: vec![], body: "no".into() },
            modified_response: None,
        };
        facade.storage.insert_pending_refusal(pending).await;
        let resolved = facade.reject_refusal("pr3").await.unwrap();
        assert_eq!(resolved.status, RefusalStatus::Rejected);
    }
}
