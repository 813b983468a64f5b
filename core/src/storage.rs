//! Hot storage (L6, spec.md §2, §5): the single in-process owner of every
//! persistent entity. Grounded in the teacher's `MemoryConversationalStorage`
//! pattern — one `Arc`-shareable struct, `RwLock`-guarded maps, async
//! methods, `tracing` calls at every mutation, no entity held anywhere else
//! in the system except as a snapshot.

use crate::intercept::InterceptMode;
use crate::model::{Conversation, Flow, PendingIntercept, PendingRefusal, StoredItem, StoredKind};
use crate::rules::{Rule, StoreKeyMode};
use crate::store::{select_store_key, KeyCursor};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tollbooth_common::ids::{IdAliasMap, ShortIdKind, ShortIdRegistry};

/// Owns every piece of hot state. Shared as `Arc<Storage>`; every method
/// takes `&self` and serializes internally, matching spec.md §5's "single
/// logical owner per domain, serialized mutation".
pub struct Storage {
    flows: RwLock<HashMap<String, Flow>>,
    flow_order: RwLock<Vec<String>>,
    conversations: RwLock<Vec<Conversation>>,
    rules: RwLock<Vec<Rule>>,
    refusal_rules: RwLock<Vec<crate::refusal::RefusalRule>>,
    pending_intercepts: RwLock<HashMap<String, PendingIntercept>>,
    pending_refusals: RwLock<HashMap<String, PendingRefusal>>,
    stored_requests: RwLock<HashMap<String, StoredItem>>,
    stored_responses: RwLock<HashMap<String, StoredItem>>,
    store_key_cursors: RwLock<HashMap<String, KeyCursor>>,
    short_ids: ShortIdRegistry,
    aliases: RwLock<IdAliasMap>,
    intercept_mode: RwLock<InterceptMode>,
    rules_enabled: RwLock<bool>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            flow_order: RwLock::new(Vec::new()),
            conversations: RwLock::new(Vec::new()),
            rules: RwLock::new(Vec::new()),
            refusal_rules: RwLock::new(Vec::new()),
            pending_intercepts: RwLock::new(HashMap::new()),
            pending_refusals: RwLock::new(HashMap::new()),
            stored_requests: RwLock::new(HashMap::new()),
            stored_responses: RwLock::new(HashMap::new()),
            store_key_cursors: RwLock::new(HashMap::new()),
            short_ids: ShortIdRegistry::new(),
            aliases: RwLock::new(IdAliasMap::new()),
            intercept_mode: RwLock::new(InterceptMode::Passthrough),
            rules_enabled: RwLock::new(true),
        }
    }

    // ---- flows ----

    pub async fn insert_flow(&self, flow: Flow) {
        let id = flow.flow_id.clone();
        tracing::debug!(flow_id = %id, "storing new flow");
        self.flows.write().await.insert(id.clone(), flow);
        self.flow_order.write().await.push(id);
    }

    pub async fn get_flow(&self, id: &str) -> Option<Flow> {
        let resolved = self.aliases.read().await.resolve(id).to_string();
        self.flows.read().await.get(&resolved).cloned()
    }

    pub async fn update_flow<F: FnOnce(&mut Flow)>(&self, id: &str, f: F) -> bool {
        let resolved = self.aliases.read().await.resolve(id).to_string();
        let mut guard = self.flows.write().await;
        match guard.get_mut(&resolved) {
            Some(flow) => {
                f(flow);
                true
            }
            None => {
                tracing::warn!(flow_id = %resolved, "update_flow: flow not found");
                false
            }
        }
    }

    pub async fn delete_flow(&self, id: &str) -> bool {
        let resolved = self.aliases.read().await.resolve(id).to_string();
        self.flow_order.write().await.retain(|f| f != &resolved);
        self.flows.write().await.remove(&resolved).is_some()
    }

    pub async fn list_flows(&self) -> Vec<Flow> {
        let order = self.flow_order.read().await;
        let flows = self.flows.read().await;
        order.iter().filter_map(|id| flows.get(id).cloned()).collect()
    }

    // ---- conversations ----

    pub async fn list_conversations(&self) -> Vec<Conversation> {
        self.conversations.read().await.clone()
    }

    pub async fn with_conversations<R>(&self, f: impl FnOnce(&mut Vec<Conversation>) -> R) -> R {
        let mut guard = self.conversations.write().await;
        f(&mut guard)
    }

    pub async fn replace_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.write().await = conversations;
    }

    // ---- rules ----

    pub async fn list_rules(&self) -> Vec<Rule> {
        self.rules.read().await.clone()
    }

    /// Assigns a permanent short ID (spec.md §4.9) and records it in both
    /// the alias map and the registry's observed high-water mark before
    /// inserting.
    pub async fn insert_rule(&self, mut rule: Rule) -> Rule {
        if rule.short_id.is_empty() {
            rule.short_id = self.short_ids.next(ShortIdKind::Rule);
        } else {
            self.short_ids.observe(ShortIdKind::Rule, &rule.short_id);
        }
        self.aliases.write().await.insert(rule.short_id.clone(), rule.id.clone());
        self.rules.write().await.push(rule.clone());
        rule
    }

    pub async fn delete_rule(&self, id: &str) -> bool {
        let resolved = self.aliases.read().await.resolve(id).to_string();
        let mut guard = self.rules.write().await;
        let before = guard.len();
        guard.retain(|r| r.id != resolved);
        guard.len() != before
    }

    pub async fn update_rule<F: FnOnce(&mut Rule)>(&self, id: &str, f: F) -> bool {
        let resolved = self.aliases.read().await.resolve(id).to_string();
        let mut guard = self.rules.write().await;
        match guard.iter_mut().find(|r| r.id == resolved) {
            Some(rule) => {
                f(rule);
                true
            }
            None => false,
        }
    }

    pub async fn next_rule_short_id(&self) -> String {
        self.short_ids.next(ShortIdKind::Rule)
    }

    // ---- refusal rules ----

    pub async fn list_refusal_rules(&self) -> Vec<crate::refusal::RefusalRule> {
        self.refusal_rules.read().await.clone()
    }

    pub async fn replace_refusal_rules(&self, rules: Vec<crate::refusal::RefusalRule>) {
        *self.refusal_rules.write().await = rules;
    }

    // ---- intercept mode / rules enabled ----

    pub async fn intercept_mode(&self) -> InterceptMode {
        *self.intercept_mode.read().await
    }

    pub async fn set_intercept_mode(&self, mode: InterceptMode) {
        *self.intercept_mode.write().await = mode;
    }

    pub async fn rules_enabled(&self) -> bool {
        *self.rules_enabled.read().await
    }

    pub async fn set_rules_enabled(&self, enabled: bool) {
        *self.rules_enabled.write().await = enabled;
    }

    // ---- pending intercepts ----

    pub async fn insert_pending_intercept(&self, pending: PendingIntercept) {
        self.pending_intercepts.write().await.insert(pending.flow_id.clone(), pending);
    }

    pub async fn remove_pending_intercept(&self, flow_id: &str) -> Option<PendingIntercept> {
        self.pending_intercepts.write().await.remove(flow_id)
    }

    pub async fn get_pending_intercept(&self, flow_id: &str) -> Option<PendingIntercept> {
        self.pending_intercepts.read().await.get(flow_id).cloned()
    }

    pub async fn list_pending_intercepts(&self) -> Vec<PendingIntercept> {
        self.pending_intercepts.read().await.values().cloned().collect()
    }

    pub async fn set_timeout_immune(&self, flow_id: &str, immune: bool) -> bool {
        let mut guard = self.pending_intercepts.write().await;
        match guard.get_mut(flow_id) {
            Some(entry) => {
                entry.timeout_immune = immune;
                true
            }
            None => false,
        }
    }

    /// Returns the flow ids of every non-immune entry older than `max_age_ms`
    /// at `now`, removing them from the queue (spec.md §4.2 timeout sweep).
    pub async fn sweep_expired_intercepts(&self, now: i64, max_age_ms: i64) -> Vec<PendingIntercept> {
        let mut guard = self.pending_intercepts.write().await;
        let expired: Vec<String> = guard
            .values()
            .filter(|p| !p.timeout_immune && now - p.timestamp > max_age_ms)
            .map(|p| p.flow_id.clone())
            .collect();
        expired.iter().filter_map(|id| guard.remove(id)).collect()
    }

    // ---- pending refusals ----

    pub async fn insert_pending_refusal(&self, pending: PendingRefusal) {
        self.pending_refusals.write().await.insert(pending.id.clone(), pending);
    }

    pub async fn remove_pending_refusal(&self, id: &str) -> Option<PendingRefusal> {
        self.pending_refusals.write().await.remove(id)
    }

    pub async fn get_pending_refusal(&self, id: &str) -> Option<PendingRefusal> {
        self.pending_refusals.read().await.get(id).cloned()
    }

    pub async fn list_pending_refusals(&self) -> Vec<PendingRefusal> {
        self.pending_refusals.read().await.values().cloned().collect()
    }

    pub async fn sweep_expired_refusals(&self, now: i64, max_age_ms: i64) -> Vec<PendingRefusal> {
        let mut guard = self.pending_refusals.write().await;
        let expired: Vec<String> = guard
            .values()
            .filter(|p| now - p.timestamp > max_age_ms)
            .map(|p| p.id.clone())
            .collect();
        expired.iter().filter_map(|id| guard.remove(id)).collect()
    }

    // ---- data store (L4) ----

    pub async fn put_stored_item(&self, item: StoredItem) -> StoredItem {
        let mut item = item;
        if item.metadata.short_id.is_empty() {
            let kind = match item.kind {
                StoredKind::Request => ShortIdKind::Request,
                StoredKind::Response => ShortIdKind::Response,
            };
            item.metadata.short_id = self.short_ids.next(kind);
        }
        self.aliases.write().await.insert(item.metadata.short_id.clone(), item.key.clone());
        match item.kind {
            StoredKind::Request => {
                self.stored_requests.write().await.insert(item.key.clone(), item.clone());
            }
            StoredKind::Response => {
                self.stored_responses.write().await.insert(item.key.clone(), item.clone());
            }
        }
        item
    }

    pub async fn get_stored_request(&self, key: &str) -> Option<StoredItem> {
        let resolved = self.aliases.read().await.resolve(key).to_string();
        self.stored_requests.read().await.get(&resolved).cloned()
    }

    pub async fn get_stored_response(&self, key: &str) -> Option<StoredItem> {
        let resolved = self.aliases.read().await.resolve(key).to_string();
        self.stored_responses.read().await.get(&resolved).cloned()
    }

    pub async fn delete_stored_request(&self, key: &str) -> bool {
        self.stored_requests.write().await.remove(key).is_some()
    }

    pub async fn delete_stored_response(&self, key: &str) -> bool {
        self.stored_responses.write().await.remove(key).is_some()
    }

    pub async fn list_stored_requests(&self) -> Vec<StoredItem> {
        self.stored_requests.read().await.values().cloned().collect()
    }

    pub async fn list_stored_responses(&self) -> Vec<StoredItem> {
        self.stored_responses.read().await.values().cloned().collect()
    }

    /// Seed the short-ID registry from existing items at startup (spec.md
    /// §4.9, §8 "short-ID permanence").
    pub async fn seed_short_ids(&self) {
        let rules = self.rules.read().await;
        self.short_ids.seed_from(rules.iter().map(|r| (ShortIdKind::Rule, r.short_id.clone())));
        drop(rules);
        let requests = self.stored_requests.read().await;
        self.short_ids.seed_from(requests.values().map(|i| (ShortIdKind::Request, i.metadata.short_id.clone())));
        drop(requests);
        let responses = self.stored_responses.read().await;
        self.short_ids.seed_from(responses.values().map(|i| (ShortIdKind::Response, i.metadata.short_id.clone())));
    }

    /// Select the next store key for a `serve_from_store` rule, advancing
    /// that rule's persistent cursor (spec.md §4.2, §8).
    pub async fn select_store_key(&self, rule_id: &str, mode: StoreKeyMode, keys: &[String]) -> Option<String> {
        let mut cursors = self.store_key_cursors.write().await;
        let cursor = cursors.entry(rule_id.to_string()).or_default();
        select_store_key(mode, keys, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawRequest;

    fn sample_flow(id: &str) -> Flow {
        Flow::new(
            id.to_string(),
            0,
            RawRequest { method: "GET".into(), url: "http://h/".into(), host: "h".into(), port: 80, path: "/".into(), headers: vec![], body: String::new() },
            false,
        )
    }

    #[tokio::test]
    async fn insert_then_get_flow_round_trips() {
        let storage = Storage::new();
        storage.insert_flow(sample_flow("f1")).await;
        assert!(storage.get_flow("f1").await.is_some());
        assert!(storage.get_flow("missing").await.is_none());
    }

    #[tokio::test]
    async fn delete_flow_removes_from_order_and_map() {
        let storage = Storage::new();
        storage.insert_flow(sample_flow("f1")).await;
        assert!(storage.delete_flow("f1").await);
        assert_eq!(storage.list_flows().await.len(), 0);
    }

    #[tokio::test]
    async fn sweep_only_removes_non_immune_expired_entries() {
        let storage = Storage::new();
        storage.insert_pending_intercept(PendingIntercept { flow_id: "a".into(), timestamp: 0, intercept_type: crate::model::InterceptType::Request, timeout_immune: false }).await;
        storage.insert_pending_intercept(PendingIntercept { flow_id: "b".into(), timestamp: 0, intercept_type: crate::model::InterceptType::Request, timeout_immune: true }).await;
        let expired = storage.sweep_expired_intercepts(10 * 60_000, 5 * 60_000).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].flow_id, "a");
        assert!(storage.get_pending_intercept("b").await.is_some());
    }

    #[tokio::test]
    async fn rule_short_id_survives_lookup_by_short_or_full_id() {
        let storage = Storage::new();
        let rule = Rule {
            id: "rule-uuid".into(),
            short_id: String::new(),
            name: "r".into(),
            enabled: true,
            direction: crate::rules::Direction::Request,
            priority: 0,
            filter: Default::default(),
            action: crate::rules::ActionPayload::Passthrough,
            tags: vec![],
        };
        let inserted = storage.insert_rule(rule).await;
        assert_eq!(inserted.short_id, "r1");
        assert!(storage.delete_rule("r1").await);
    }
}
