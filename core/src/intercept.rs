//! Intercept manager (T1, spec.md §4.2) — the central state machine over
//! flows. Owns no state itself beyond its `Storage` handle (spec.md §5: a
//! single logical owner per domain); all persistent state lives in
//! `Storage`.

use crate::errors::ModifyError;
use crate::llm::LLMClient;
use crate::model::{Flow, HeaderList, InterceptType, PendingIntercept};
use crate::modifier::{apply_static_modification, merge_headers, FlowInterpolationContext};
use crate::rules::{ActionPayload, Direction, MergeMode, RuleEngine};
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Per-flow five-minute pending timeout, swept every minute (spec.md §4.2,
/// §5).
pub const PENDING_TIMEOUT_MS: i64 = 5 * 60 * 1000;
pub const SWEEP_INTERVAL_MS: i64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptMode {
    Passthrough,
    InterceptLlm,
    InterceptAll,
}

/// Outbound verdicts the proxy channel relays to the proxy (spec.md §4.1,
/// §6). Every variant carries a `flow_id`.
#[derive(Debug, Clone)]
pub enum Verdict {
    Forward { flow_id: String },
    ForwardModified { flow_id: String, body: Option<String>, headers: Option<HeaderList>, status_code: Option<u16> },
    Drop { flow_id: String },
    ForwardResponse { flow_id: String },
    ForwardResponseModified { flow_id: String, body: Option<String>, headers: Option<HeaderList>, status_code: Option<u16> },
    /// Same wire shape as `ForwardResponse`, but the caller must call
    /// `InterceptManager::clear_flow` once delivery is confirmed (spec.md §9
    /// Open Question 2's `auto_clear` resolution).
    ForwardResponseAndClear { flow_id: String },
}

impl Verdict {
    pub fn flow_id(&self) -> &str {
        match self {
            Verdict::Forward { flow_id }
            | Verdict::ForwardModified { flow_id, .. }
            | Verdict::Drop { flow_id }
            | Verdict::ForwardResponse { flow_id }
            | Verdict::ForwardResponseModified { flow_id, .. }
            | Verdict::ForwardResponseAndClear { flow_id } => flow_id,
        }
    }
}

/// What a request/response arrival produced: an immediate verdict, or a new
/// pending intercept for the UI to resolve later.
pub enum Outcome {
    Verdict(Verdict),
    Enqueued { flow_id: String, intercept_type: InterceptType },
}

/// The external collaborators `modify_llm` needs, bundled so call sites
/// don't have to thread four parameters through every arrival path. `None`
/// when no LLM provider is configured — every `modify_llm` rule then
/// degrades to "forward original" (spec.md §4.6, §7).
pub struct LlmContext<'a> {
    pub client: Option<&'a dyn LLMClient>,
    pub templates: &'a HashMap<String, String>,
    pub active_provider: &'a str,
    pub memory_cache: &'a crate::llm::LlmCache,
    pub persistent_cache: &'a dyn crate::llm::PersistentLlmCache,
}

pub struct InterceptManager {
    storage: Arc<Storage>,
    /// spec.md §9 Open Question 1.
    modify_llm_failure_enters_queue: bool,
}

impl InterceptManager {
    pub fn new(storage: Arc<Storage>, modify_llm_failure_enters_queue: bool) -> Self {
        Self { storage, modify_llm_failure_enters_queue }
    }

    async fn union_tags(&self, flow: &mut Flow, tags: &[String], now: i64) {
        if tags.is_empty() {
            return;
        }
        let annotation = flow.annotation.get_or_insert_with(|| crate::model::Annotation {
            title: String::new(),
            body: None,
            tags: vec![],
            created_at: now,
            updated_at: now,
        });
        annotation.union_tags(tags, now);
    }

    async fn enqueue(&self, flow: Flow, intercept_type: InterceptType, now: i64) -> Outcome {
        let flow_id = flow.flow_id.clone();
        self.storage.insert_flow(flow).await;
        self.storage
            .insert_pending_intercept(PendingIntercept { flow_id: flow_id.clone(), timestamp: now, intercept_type, timeout_immune: false })
            .await;
        Outcome::Enqueued { flow_id, intercept_type }
    }

    async fn forward(&self, flow: Flow) -> Outcome {
        let flow_id = flow.flow_id.clone();
        self.storage.insert_flow(flow).await;
        Outcome::Verdict(Verdict::Forward { flow_id })
    }

    async fn call_modify_llm(&self, flow: &Flow, action: &crate::rules::ModifyLlmAction, rule_id: &str, llm: &LlmContext<'_>) -> Result<String, ModifyError> {
        let client = llm.client.ok_or(ModifyError::NoProvider)?;
        let ctx = FlowInterpolationContext { request: &flow.request };
        let prompt = crate::llm::resolve_prompt(action, llm.templates, &ctx).ok_or(ModifyError::NoProvider)?;
        let engine = crate::llm::ModificationEngine { client, memory_cache: llm.memory_cache, persistent_cache: llm.persistent_cache };
        engine.generate(action, rule_id, prompt, llm.active_provider).await
    }

    /// Request arrival (spec.md §4.2 "Request arrival path").
    pub async fn handle_request(&self, mut flow: Flow, now: i64, llm: &LlmContext<'_>) -> Outcome {
        let mut excluded = HashSet::new();
        if self.storage.rules_enabled().await {
            let rules = self.storage.list_rules().await;
            loop {
                let rule = match RuleEngine::next_match(&rules, Direction::Request, &flow, &excluded) {
                    Some(m) => m.rule.clone(),
                    None => break,
                };
                excluded.insert(rule.id.clone());
                self.union_tags(&mut flow, &rule.tags, now).await;

                match &rule.action {
                    ActionPayload::Passthrough => return self.forward(flow).await,
                    ActionPayload::Intercept => return self.enqueue(flow, InterceptType::Request, now).await,
                    ActionPayload::ModifyStatic(modification) => {
                        let ctx = FlowInterpolationContext { request: &flow.request };
                        let result = apply_static_modification(modification, &flow.request.body, &flow.request.headers, &ctx);
                        if result.is_noop() {
                            continue;
                        }
                        let (body, headers) = (result.body, result.headers);
                        flow.apply_request_modification(body.clone(), headers.clone(), Some(rule.id.clone()));
                        if modification.allow_intercept {
                            return self.enqueue(flow, InterceptType::Request, now).await;
                        }
                        let flow_id = flow.flow_id.clone();
                        self.storage.insert_flow(flow).await;
                        return Outcome::Verdict(Verdict::ForwardModified { flow_id, body, headers, status_code: None });
                    }
                    ActionPayload::ServeFromStore(action) => {
                        let key = self.storage.select_store_key(&rule.id, action.store_key_mode, &action.store_keys).await;
                        let item = match key {
                            Some(key) => self.storage.get_stored_request(&key).await,
                            None => None,
                        };
                        let item = match item {
                            Some(item) => item,
                            None => return self.forward(flow).await,
                        };
                        let merged_headers = merge_headers(&flow.request.headers, &item.headers, action.request_merge_mode == MergeMode::Replace);
                        let body = item.body.clone();
                        flow.apply_request_modification(Some(body.clone()), Some(merged_headers.clone()), Some(rule.id.clone()));
                        let flow_id = flow.flow_id.clone();
                        self.storage.insert_flow(flow).await;
                        return Outcome::Verdict(Verdict::ForwardModified { flow_id, body: Some(body), headers: Some(merged_headers), status_code: None });
                    }
                    ActionPayload::ModifyLlm(action) => {
                        match self.call_modify_llm(&flow, action, &rule.id, llm).await {
                            Ok(body) => {
                                flow.apply_request_modification(Some(body.clone()), None, Some(rule.id.clone()));
                                let flow_id = flow.flow_id.clone();
                                self.storage.insert_flow(flow).await;
                                return Outcome::Verdict(Verdict::ForwardModified { flow_id, body: Some(body), headers: None, status_code: None });
                            }
                            Err(err) => {
                                tracing::warn!(rule_id = %rule.id, error = %err, "modify_llm failed, forwarding original");
                                if action.allow_intercept && self.modify_llm_failure_enters_queue {
                                    return self.enqueue(flow, InterceptType::Request, now).await;
                                }
                                return self.forward(flow).await;
                            }
                        }
                    }
                    ActionPayload::AutoHide | ActionPayload::AutoClear => return self.forward(flow).await,
                }
            }
        }

        match self.storage.intercept_mode().await {
            InterceptMode::Passthrough => self.forward(flow).await,
            InterceptMode::InterceptLlm if !flow.is_llm_api => self.forward(flow).await,
            InterceptMode::InterceptLlm | InterceptMode::InterceptAll => self.enqueue(flow, InterceptType::Request, now).await,
        }
    }

    /// Response arrival (spec.md §4.2 "Response arrival path").
    pub async fn handle_response(&self, mut flow: Flow, now: i64, llm: &LlmContext<'_>) -> Outcome {
        let mut excluded = HashSet::new();
        let intercept_on_replay = flow.replay_source.as_ref().map(|r| r.intercept_on_replay).unwrap_or(false);

        if self.storage.rules_enabled().await {
            let rules = self.storage.list_rules().await;
            loop {
                let rule = match RuleEngine::next_match(&rules, Direction::Response, &flow, &excluded) {
                    Some(m) => m.rule.clone(),
                    None => break,
                };
                excluded.insert(rule.id.clone());
                self.union_tags(&mut flow, &rule.tags, now).await;

                match &rule.action {
                    ActionPayload::Passthrough => return self.forward_response(flow, intercept_on_replay, now).await,
                    ActionPayload::Intercept => return self.enqueue(flow, InterceptType::Response, now).await,
                    ActionPayload::ModifyStatic(modification) => {
                        let body_before = flow.response.as_ref().map(|r| r.body.clone()).unwrap_or_default();
                        let headers_before = flow.response.as_ref().map(|r| r.headers.clone()).unwrap_or_default();
                        let ctx = FlowInterpolationContext { request: &flow.request };
                        let result = apply_static_modification(modification, &body_before, &headers_before, &ctx);
                        if result.is_noop() {
                            continue;
                        }
                        let (body, headers) = (result.body, result.headers);
                        flow.apply_response_modification(body.clone(), headers.clone(), None, Some(rule.id.clone()));
                        if modification.allow_intercept {
                            return self.enqueue(flow, InterceptType::Response, now).await;
                        }
                        let flow_id = flow.flow_id.clone();
                        self.storage.insert_flow(flow).await;
                        return Outcome::Verdict(Verdict::ForwardResponseModified { flow_id, body, headers, status_code: None });
                    }
                    ActionPayload::ServeFromStore(action) => {
                        let key = self.storage.select_store_key(&rule.id, action.store_key_mode, &action.store_keys).await;
                        let item = match key {
                            Some(key) => self.storage.get_stored_response(&key).await,
                            None => None,
                        };
                        let item = match item {
                            Some(item) => item,
                            None => return self.forward_response(flow, intercept_on_replay, now).await,
                        };
                        let status_code = item.status_code;
                        let body = item.body.clone();
                        let headers = item.headers.clone();
                        flow.apply_response_modification(Some(body.clone()), Some(headers.clone()), status_code, Some(rule.id.clone()));
                        let flow_id = flow.flow_id.clone();
                        self.storage.insert_flow(flow).await;
                        return Outcome::Verdict(Verdict::ForwardResponseModified { flow_id, body: Some(body), headers: Some(headers), status_code });
                    }
                    ActionPayload::ModifyLlm(action) => match self.call_modify_llm(&flow, action, &rule.id, llm).await {
                        Ok(body) => {
                            flow.apply_response_modification(Some(body.clone()), None, None, Some(rule.id.clone()));
                            let flow_id = flow.flow_id.clone();
                            self.storage.insert_flow(flow).await;
                            return Outcome::Verdict(Verdict::ForwardResponseModified { flow_id, body: Some(body), headers: None, status_code: None });
                        }
                        Err(err) => {
                            tracing::warn!(rule_id = %rule.id, error = %err, "modify_llm failed, forwarding original response");
                            if action.allow_intercept && self.modify_llm_failure_enters_queue {
                                return self.enqueue(flow, InterceptType::Response, now).await;
                            }
                            return self.forward_response(flow, intercept_on_replay, now).await;
                        }
                    },
                    ActionPayload::AutoHide => {
                        let flow_id = flow.flow_id.clone();
                        flow.hidden = true;
                        flow.hidden_at = Some(now);
                        flow.hidden_by_rule = Some(rule.id.clone());
                        self.storage.insert_flow(flow).await;
                        return Outcome::Verdict(Verdict::ForwardResponse { flow_id });
                    }
                    ActionPayload::AutoClear => {
                        let flow_id = flow.flow_id.clone();
                        self.storage.insert_flow(flow).await;
                        // Deletion is deferred to the caller, which awaits the
                        // verdict's delivery before calling `clear_flow` —
                        // spec.md §9 Open Question 2's explicit-ack resolution,
                        // rather than a fixed drain delay.
                        return Outcome::Verdict(Verdict::ForwardResponseAndClear { flow_id });
                    }
                }
            }
        }

        if intercept_on_replay {
            return self.enqueue(flow, InterceptType::Response, now).await;
        }
        match self.storage.intercept_mode().await {
            InterceptMode::Passthrough => self.forward_response(flow, intercept_on_replay, now).await,
            InterceptMode::InterceptLlm if !flow.is_llm_api => self.forward_response(flow, intercept_on_replay, now).await,
            InterceptMode::InterceptLlm | InterceptMode::InterceptAll => self.enqueue(flow, InterceptType::Response, now).await,
        }
    }

    async fn forward_response(&self, flow: Flow, intercept_on_replay: bool, now: i64) -> Outcome {
        if intercept_on_replay {
            return self.enqueue(flow, InterceptType::Response, now).await;
        }
        let flow_id = flow.flow_id.clone();
        self.storage.insert_flow(flow).await;
        Outcome::Verdict(Verdict::ForwardResponse { flow_id })
    }

    /// Called after `auto_clear`'s forward verdict has actually been written
    /// to the outbound channel (spec.md §9 Open Question 2).
    pub async fn clear_flow(&self, flow_id: &str) {
        self.storage.delete_flow(flow_id).await;
    }

    // ---- pending queue operations (spec.md §4.2) ----

    pub async fn forward_pending(&self, flow_id: &str) -> Option<Verdict> {
        let pending = self.storage.remove_pending_intercept(flow_id).await?;
        Some(match pending.intercept_type {
            InterceptType::Request => Verdict::Forward { flow_id: flow_id.to_string() },
            InterceptType::Response => Verdict::ForwardResponse { flow_id: flow_id.to_string() },
        })
    }

    pub async fn forward_modified_pending(&self, flow_id: &str, body: Option<String>, headers: Option<HeaderList>, status_code: Option<u16>, rule_ref: Option<String>) -> Option<Verdict> {
        let pending = self.storage.remove_pending_intercept(flow_id).await?;
        match pending.intercept_type {
            InterceptType::Request => {
                self.storage
                    .update_flow(flow_id, |flow| flow.apply_request_modification(body.clone(), headers.clone(), rule_ref))
                    .await;
                Some(Verdict::ForwardModified { flow_id: flow_id.to_string(), body, headers, status_code })
            }
            InterceptType::Response => {
                self.storage
                    .update_flow(flow_id, |flow| flow.apply_response_modification(body.clone(), headers.clone(), status_code, rule_ref))
                    .await;
                Some(Verdict::ForwardResponseModified { flow_id: flow_id.to_string(), body, headers, status_code })
            }
        }
    }

    pub async fn drop_pending(&self, flow_id: &str) -> Option<Verdict> {
        self.storage.remove_pending_intercept(flow_id).await?;
        Some(Verdict::Drop { flow_id: flow_id.to_string() })
    }

    pub async fn set_timeout_immune(&self, flow_id: &str, immune: bool) -> bool {
        self.storage.set_timeout_immune(flow_id, immune).await
    }

    /// Timeout sweep (spec.md §4.2, §5, §8): every non-immune entry older
    /// than five minutes is auto-forwarded with no modification.
    pub async fn sweep_timeouts(&self, now: i64) -> Vec<Verdict> {
        let expired = self.storage.sweep_expired_intercepts(now, PENDING_TIMEOUT_MS).await;
        expired
            .into_iter()
            .map(|pending| {
                tracing::info!(flow_id = %pending.flow_id, "pending intercept timed out, auto-forwarding");
                match pending.intercept_type {
                    InterceptType::Request => Verdict::Forward { flow_id: pending.flow_id },
                    InterceptType::Response => Verdict::ForwardResponse { flow_id: pending.flow_id },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawRequest;
    use crate::rules::{Direction as RuleDirection, Filter, MatchKind, StringPredicate};

    struct NullPersistentCache;

    #[async_trait::async_trait]
    impl crate::llm::PersistentLlmCache for NullPersistentCache {
        async fn get(&self, _key: &str) -> Option<String> {
            None
        }
        async fn set(&self, _key: &str, _value: String) {}
    }

    fn llm_ctx<'a>(templates: &'a HashMap<String, String>, memory_cache: &'a crate::llm::LlmCache, persistent: &'a NullPersistentCache) -> LlmContext<'a> {
        LlmContext {
            client: None,
            templates,
            active_provider: "anthropic",
            memory_cache,
            persistent_cache: persistent,
        }
    }

    fn request_flow(id: &str, host: &str, body: &str) -> Flow {
        Flow::new(
            id.to_string(),
            0,
            RawRequest { method: "POST".into(), url: format!("https://{host}/v1/messages"), host: host.into(), port: 443, path: "/v1/messages".into(), headers: vec![], body: body.into() },
            true,
        )
    }

    fn static_rule(id: &str, priority: i64, host: &str, modification: crate::rules::StaticModification) -> crate::rules::Rule {
        crate::rules::Rule {
            id: id.into(),
            short_id: format!("r_{id}"),
            name: id.into(),
            enabled: true,
            direction: RuleDirection::Request,
            priority,
            filter: Filter { host: Some(StringPredicate { value: host.into(), kind: MatchKind::Contains }), ..Default::default() },
            action: ActionPayload::ModifyStatic(modification),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn static_body_replace_forwards_modified_with_original_preserved() {
        let storage = Arc::new(Storage::new());
        let modification = crate::rules::StaticModification {
            body: Some(crate::rules::BodyModification { replace_body: Some("{{uuid}}-ok".into()), find_replace: vec![] }),
            headers: vec![],
            allow_intercept: false,
        };
        storage.insert_rule(static_rule("r1", 1, "api.example.com", modification)).await;
        let manager = InterceptManager::new(storage.clone(), false);
        let templates = HashMap::new();
        let cache = crate::llm::LlmCache::new();
        let persistent = NullPersistentCache;

        let flow = request_flow("f1", "api.example.com", "ignored");
        let outcome = manager.handle_request(flow, 0, &llm_ctx(&templates, &cache, &persistent)).await;

        match outcome {
            Outcome::Verdict(Verdict::ForwardModified { flow_id, body, .. }) => {
                assert_eq!(flow_id, "f1");
                assert!(body.unwrap().ends_with("-ok"));
            }
            _ => panic!("expected ForwardModified"),
        }
        let stored = storage.get_flow("f1").await.unwrap();
        assert_eq!(stored.original_request.unwrap().body, "ignored");
        assert!(stored.request_modified);
        assert_eq!(stored.request_modified_by_rule.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn noop_rule_falls_through_to_next_rule() {
        let storage = Arc::new(Storage::new());
        let noop = crate::rules::StaticModification {
            body: Some(crate::rules::BodyModification { replace_body: None, find_replace: vec![crate::rules::FindReplace { find: "X".into(), replace: "X".into(), regex: false, replace_all: true }] }),
            headers: vec![],
            allow_intercept: false,
        };
        let real = crate::rules::StaticModification {
            body: Some(crate::rules::BodyModification { replace_body: Some("Y".into()), find_replace: vec![] }),
            headers: vec![],
            allow_intercept: false,
        };
        storage.insert_rule(static_rule("a", 1, "example.com", noop)).await;
        storage.insert_rule(static_rule("b", 2, "example.com", real)).await;
        let manager = InterceptManager::new(storage.clone(), false);
        let templates = HashMap::new();
        let cache = crate::llm::LlmCache::new();
        let persistent = NullPersistentCache;

        let flow = request_flow("f1", "api.example.com", "Z");
        let outcome = manager.handle_request(flow, 0, &llm_ctx(&templates, &cache, &persistent)).await;
        match outcome {
            Outcome::Verdict(Verdict::ForwardModified { body, .. }) => assert_eq!(body.as_deref(), Some("Y")),
            _ => panic!("expected ForwardModified"),
        }
        let stored = storage.get_flow("f1").await.unwrap();
        assert_eq!(stored.request_modified_by_rule.as_deref(), Some("b"));
    }

    fn auto_clear_rule(id: &str, host: &str) -> crate::rules::Rule {
        crate::rules::Rule {
            id: id.into(),
            short_id: format!("r_{id}"),
            name: id.into(),
            enabled: true,
            direction: RuleDirection::Response,
            priority: 1,
            filter: Filter { host: Some(StringPredicate { value: host.into(), kind: MatchKind::Contains }), ..Default::default() },
            action: ActionPayload::AutoClear,
            tags: vec![],
        }
    }

    /// spec.md §9 Open Question 2: `auto_clear` hands back a verdict distinct
    /// from an ordinary forwarded response, and the flow survives until the
    /// caller explicitly acknowledges delivery via `clear_flow`.
    #[tokio::test]
    async fn auto_clear_defers_deletion_until_explicit_ack() {
        let storage = Arc::new(Storage::new());
        storage.insert_rule(auto_clear_rule("r1", "api.example.com")).await;
        let manager = InterceptManager::new(storage.clone(), false);
        let templates = HashMap::new();
        let cache = crate::llm::LlmCache::new();
        let persistent = NullPersistentCache;

        let mut flow = request_flow("f1", "api.example.com", "req");
        flow.response = Some(crate::model::RawResponse { status_code: 200, headers: vec![], body: "resp".into() });
        let outcome = manager.handle_response(flow, 0, &llm_ctx(&templates, &cache, &persistent)).await;

        let flow_id = match outcome {
            Outcome::Verdict(Verdict::ForwardResponseAndClear { flow_id }) => flow_id,
            _ => panic!("expected ForwardResponseAndClear"),
        };
        assert!(storage.get_flow(&flow_id).await.is_some(), "flow must still exist before the ack");

        manager.clear_flow(&flow_id).await;
        assert!(storage.get_flow(&flow_id).await.is_none(), "flow must be gone after the ack");
    }

    #[tokio::test]
    async fn no_matching_rule_in_passthrough_mode_forwards() {
        let storage = Arc::new(Storage::new());
        let manager = InterceptManager::new(storage.clone(), false);
        let templates = HashMap::new();
        let cache = crate::llm::LlmCache::new();
        let persistent = NullPersistentCache;
        let flow = request_flow("f1", "other.com", "body");
        let outcome = manager.handle_request(flow, 0, &llm_ctx(&templates, &cache, &persistent)).await;
        assert!(matches!(outcome, Outcome::Verdict(Verdict::Forward { .. })));
    }

    #[tokio::test]
    async fn no_matching_rule_in_intercept_all_mode_enqueues() {
        let storage = Arc::new(Storage::new());
        storage.set_intercept_mode(InterceptMode::InterceptAll).await;
        let manager = InterceptManager::new(storage.clone(), false);
        let templates = HashMap::new();
        let cache = crate::llm::LlmCache::new();
        let persistent = NullPersistentCache;
        let flow = request_flow("f1", "other.com", "body");
        let outcome = manager.handle_request(flow, 0, &llm_ctx(&templates, &cache, &persistent)).await;
        assert!(matches!(outcome, Outcome::Enqueued { .. }));
        assert!(storage.get_pending_intercept("f1").await.is_some());
    }

    #[tokio::test]
    async fn intercept_llm_mode_only_enqueues_llm_flows() {
        let storage = Arc::new(Storage::new());
        storage.set_intercept_mode(InterceptMode::InterceptLlm).await;
        let manager = InterceptManager::new(storage.clone(), false);
        let templates = HashMap::new();
        let cache = crate::llm::LlmCache::new();
        let persistent = NullPersistentCache;

        let mut non_llm = request_flow("f1", "other.com", "body");
        non_llm.is_llm_api = false;
        let outcome = manager.handle_request(non_llm, 0, &llm_ctx(&templates, &cache, &persistent)).await;
        assert!(matches!(outcome, Outcome::Verdict(Verdict::Forward { .. })));

        let llm_flow = request_flow("f2", "other.com", "body");
        assert!(llm_flow.is_llm_api);
        let outcome = manager.handle_request(llm_flow, 0, &llm_ctx(&templates, &cache, &persistent)).await;
        assert!(matches!(outcome, Outcome::Enqueued { .. }));
        assert!(storage.get_pending_intercept("f2").await.is_some());
    }

    #[tokio::test]
    async fn timeout_sweep_forwards_expired_non_immune_entries_only() {
        let storage = Arc::new(Storage::new());
        storage.insert_pending_intercept(PendingIntercept { flow_id: "old".into(), timestamp: 0, intercept_type: InterceptType::Request, timeout_immune: false }).await;
        storage.insert_pending_intercept(PendingIntercept { flow_id: "immune".into(), timestamp: 0, intercept_type: InterceptType::Request, timeout_immune: true }).await;
        let manager = InterceptManager::new(storage.clone(), false);
        let verdicts = manager.sweep_timeouts(PENDING_TIMEOUT_MS + SWEEP_INTERVAL_MS).await;
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].flow_id(), "old");
        assert!(storage.get_pending_intercept("immune").await.is_some());
    }
}
