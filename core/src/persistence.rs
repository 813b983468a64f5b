//! Persistence (L7, spec.md §6): an optional disk mirror of hot state, gated
//! per-category. A write or read failure here is logged and never
//! propagated — in-memory state remains authoritative for the session
//! (spec.md §7).

use crate::model::{Conversation, Flow, PendingRefusal, StoredItem};
use crate::rules::Rule;
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use tollbooth_common::configuration::PersistenceFlags;
use tollbooth_common::sanitize::sanitize_key;

/// One JSON document per flow / replay variant / stored item, one aggregate
/// document per rules/settings/presets/templates/refusal-rules category
/// (spec.md §6 "Persisted state layout").
pub struct FilePersistence {
    data_root: Option<PathBuf>,
    flags: PersistenceFlags,
}

impl FilePersistence {
    pub fn new(data_root: Option<PathBuf>, flags: PersistenceFlags) -> Self {
        Self { data_root, flags }
    }

    pub fn disabled() -> Self {
        Self::new(None, PersistenceFlags::default())
    }

    pub fn enabled(&self) -> bool {
        self.data_root.is_some()
    }

    async fn write_json(&self, category_enabled: bool, subdir: &str, key: &str, value: &impl Serialize) {
        if !self.enabled() || !category_enabled {
            return;
        }
        let root = self.data_root.as_ref().unwrap();
        let dir = root.join(subdir);
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(error = %err, dir = %dir.display(), "persistence: failed to create directory");
            return;
        }
        let path = dir.join(format!("{}.json", sanitize_key(key)));
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(&path, bytes).await {
                    tracing::warn!(error = %err, path = %path.display(), "persistence: failed to write document");
                }
            }
            Err(err) => tracing::warn!(error = %err, "persistence: failed to serialize document"),
        }
    }

    async fn delete_json(&self, category_enabled: bool, subdir: &str, key: &str) {
        if !self.enabled() || !category_enabled {
            return;
        }
        let path = self.data_root.as_ref().unwrap().join(subdir).join(format!("{}.json", sanitize_key(key)));
        if let Err(err) = tokio::fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %err, path = %path.display(), "persistence: failed to delete document");
            }
        }
    }

    async fn load_all<T: DeserializeOwned>(&self, subdir: &str) -> Vec<T> {
        let Some(root) = &self.data_root else { return Vec::new() };
        let dir = root.join(subdir);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { return Vec::new() };
        let mut items = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(contents) = tokio::fs::read(entry.path()).await {
                match serde_json::from_slice::<T>(&contents) {
                    Ok(item) => items.push(item),
                    Err(err) => tracing::warn!(error = %err, path = %entry.path().display(), "persistence: failed to parse document, skipping"),
                }
            }
        }
        items
    }

    pub async fn write_flow(&self, flow: &Flow) {
        self.write_json(self.flags.traffic, "flows", &flow.flow_id, flow).await;
    }

    pub async fn delete_flow(&self, flow_id: &str) {
        self.delete_json(self.flags.traffic, "flows", flow_id).await;
    }

    pub async fn load_flows(&self) -> Vec<Flow> {
        self.load_all("flows").await
    }

    pub async fn write_conversations(&self, conversations: &[Conversation]) {
        self.write_json(self.flags.traffic, "aggregate", "conversations", &conversations).await;
    }

    pub async fn load_conversations(&self) -> Vec<Conversation> {
        self.load_all::<Vec<Conversation>>("aggregate")
            .await
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    pub async fn write_rules(&self, rules: &[Rule]) {
        self.write_json(self.flags.rules, "aggregate", "rules", &rules).await;
    }

    pub async fn load_rules(&self) -> Vec<Rule> {
        self.load_rule_doc("rules").await
    }

    async fn load_rule_doc(&self, key: &str) -> Vec<Rule> {
        let Some(root) = &self.data_root else { return Vec::new() };
        let path = root.join("aggregate").join(format!("{key}.json"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn write_refusal_rules(&self, rules: &[crate::refusal::RefusalRule]) {
        self.write_json(self.flags.rules, "aggregate", "refusal_rules", &rules).await;
    }

    pub async fn load_refusal_rules(&self) -> Vec<crate::refusal::RefusalRule> {
        let Some(root) = &self.data_root else { return Vec::new() };
        let path = root.join("aggregate").join("refusal_rules.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn write_stored_item(&self, item: &StoredItem) {
        let subdir = match item.kind {
            crate::model::StoredKind::Request => "store_requests",
            crate::model::StoredKind::Response => "store_responses",
        };
        self.write_json(self.flags.store, subdir, &item.key, item).await;
    }

    pub async fn delete_stored_item(&self, kind: crate::model::StoredKind, key: &str) {
        let subdir = match kind {
            crate::model::StoredKind::Request => "store_requests",
            crate::model::StoredKind::Response => "store_responses",
        };
        self.delete_json(self.flags.store, subdir, key).await;
    }

    pub async fn load_stored_requests(&self) -> Vec<StoredItem> {
        self.load_all("store_requests").await
    }

    pub async fn load_stored_responses(&self) -> Vec<StoredItem> {
        self.load_all("store_responses").await
    }

    pub async fn write_pending_refusal(&self, pending: &PendingRefusal) {
        self.write_json(self.flags.traffic, "pending_refusals", &pending.id, pending).await;
    }

    pub async fn delete_pending_refusal(&self, id: &str) {
        self.delete_json(self.flags.traffic, "pending_refusals", id).await;
    }

    pub async fn load_pending_refusals(&self) -> Vec<PendingRefusal> {
        self.load_all("pending_refusals").await
    }
}

/// `generate_once`'s on-disk cache tier, stored alongside other `config`
/// category documents (spec.md §4.6, §6).
#[async_trait::async_trait]
impl crate::llm::PersistentLlmCache for FilePersistence {
    async fn get(&self, key: &str) -> Option<String> {
        let root = self.data_root.as_ref()?;
        let path = root.join("llm_cache").join(format!("{}.json", sanitize_key(key)));
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice::<String>(&bytes).ok()
    }

    async fn set(&self, key: &str, value: String) {
        self.write_json(self.flags.config, "llm_cache", key, &value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PersistentLlmCache;
    use crate::model::RawRequest;

    #[tokio::test]
    async fn disabled_persistence_is_a_no_op() {
        let persistence = FilePersistence::disabled();
        let flow = Flow::new(
            "f1".into(),
            0,
            RawRequest { method: "GET".into(), url: "http://h/".into(), host: "h".into(), port: 80, path: "/".into(), headers: vec![], body: String::new() },
            false,
        );
        persistence.write_flow(&flow).await;
        assert!(persistence.load_flows().await.is_empty());
    }

    #[tokio::test]
    async fn round_trips_a_flow_through_a_temp_directory() {
        let dir = std::env::temp_dir().join(format!("tollbooth-test-{}", uuid::Uuid::new_v4()));
        let persistence = FilePersistence::new(Some(dir.clone()), PersistenceFlags::default());
        let flow = Flow::new(
            "f1".into(),
            0,
            RawRequest { method: "GET".into(), url: "http://h/".into(), host: "h".into(), port: 80, path: "/".into(), headers: vec![], body: String::new() },
            false,
        );
        persistence.write_flow(&flow).await;
        let loaded = persistence.load_flows().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].flow_id, "f1");
        persistence.delete_flow("f1").await;
        assert!(persistence.load_flows().await.is_empty());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn llm_cache_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("tollbooth-test-{}", uuid::Uuid::new_v4()));
        let persistence = FilePersistence::new(Some(dir.clone()), PersistenceFlags::default());
        persistence.set("k1", "cached value".to_string()).await;
        assert_eq!(persistence.get("k1").await.as_deref(), Some("cached value"));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
