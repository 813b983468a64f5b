//! Data store (L4, spec.md §4.9) and the multi-key `serve_from_store`
//! selection policies spec.md §4.2/§8 describe.

use crate::model::{HeaderList, StoredItem, StoredKind, StoredMetadata};
use crate::rules::StoreKeyMode;
use rand::Rng;
use tollbooth_common::sanitize::sanitize_key;

pub fn new_stored_request(raw_key: &str, short_id: String, now: i64, method: String, url: String, headers: HeaderList, body: String, description: Option<String>) -> StoredItem {
    StoredItem {
        key: sanitize_key(raw_key),
        kind: StoredKind::Request,
        metadata: StoredMetadata { created_at: now, description, short_id },
        method: Some(method),
        url: Some(url),
        status_code: None,
        headers,
        body,
    }
}

pub fn new_stored_response(raw_key: &str, short_id: String, now: i64, status_code: u16, headers: HeaderList, body: String, description: Option<String>) -> StoredItem {
    StoredItem {
        key: sanitize_key(raw_key),
        kind: StoredKind::Response,
        metadata: StoredMetadata { created_at: now, description, short_id },
        method: None,
        url: None,
        status_code: Some(status_code),
        headers,
        body,
    }
}

/// Per-rule cursor for multi-key `serve_from_store` selection (spec.md
/// §4.2: "a per-rule counter records the last-used index and survives
/// across flows").
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyCursor(pub usize);

/// Selects the next key for `mode` out of `keys`, advancing `cursor`
/// (spec.md §8 "multi-key selection"). `None` only when `keys` is empty.
pub fn select_store_key(mode: StoreKeyMode, keys: &[String], cursor: &mut KeyCursor) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let index = match mode {
        StoreKeyMode::Single => 0,
        StoreKeyMode::RoundRobin => {
            let index = cursor.0 % keys.len();
            cursor.0 += 1;
            index
        }
        StoreKeyMode::Sequential => {
            let index = cursor.0.min(keys.len() - 1);
            cursor.0 += 1;
            index
        }
        StoreKeyMode::Random => rand::thread_rng().gen_range(0..keys.len()),
    };
    Some(keys[index].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_wraps_around() {
        let keys = vec!["k1".to_string(), "k2".to_string()];
        let mut cursor = KeyCursor::default();
        let picks: Vec<_> = (0..4).map(|_| select_store_key(StoreKeyMode::RoundRobin, &keys, &mut cursor).unwrap()).collect();
        assert_eq!(picks, vec!["k1", "k2", "k1", "k2"]);
    }

    #[test]
    fn sequential_sticks_at_last_index() {
        let keys = vec!["k1".to_string(), "k2".to_string(), "k3".to_string()];
        let mut cursor = KeyCursor::default();
        let picks: Vec<_> = (0..5).map(|_| select_store_key(StoreKeyMode::Sequential, &keys, &mut cursor).unwrap()).collect();
        assert_eq!(picks, vec!["k1", "k2", "k3", "k3", "k3"]);
    }

    #[test]
    fn random_distribution_tends_to_uniform() {
        let keys = vec!["k1".to_string(), "k2".to_string()];
        let mut cursor = KeyCursor::default();
        let mut k1_count = 0;
        let samples = 2000;
        for _ in 0..samples {
            if select_store_key(StoreKeyMode::Random, &keys, &mut cursor).unwrap() == "k1" {
                k1_count += 1;
            }
        }
        let frequency = k1_count as f64 / samples as f64;
        assert!((0.4..0.6).contains(&frequency), "frequency was {frequency}");
    }

    #[test]
    fn empty_key_list_yields_none() {
        let mut cursor = KeyCursor::default();
        assert!(select_store_key(StoreKeyMode::Single, &[], &mut cursor).is_none());
    }

    #[test]
    fn sanitizes_key_on_creation() {
        let item = new_stored_request("../evil", "rq1".into(), 0, "GET".into(), "http://h".into(), vec![], String::new(), None);
        assert_eq!(item.key, ".._evil");
    }
}
