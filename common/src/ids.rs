use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// The three short-ID kinds the registry mints (spec.md §3, §4.9, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShortIdKind {
    Rule,
    Response,
    Request,
}

impl ShortIdKind {
    fn prefix(self) -> &'static str {
        match self {
            ShortIdKind::Rule => "r",
            ShortIdKind::Response => "ds",
            ShortIdKind::Request => "rq",
        }
    }

    fn format(self, n: u64) -> String {
        format!("{}{}", self.prefix(), n)
    }
}

/// Monotonic, never-reused short-alias registry. One counter per kind;
/// counters are reconstructed from existing short IDs at startup (spec.md
/// §4.9, §8 "short-ID permanence") rather than persisted separately, so a
/// fresh process always continues past whatever the loaded state contains.
#[derive(Debug, Default)]
pub struct ShortIdRegistry {
    rule: AtomicU64,
    response: AtomicU64,
    request: AtomicU64,
}

impl ShortIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: ShortIdKind) -> &AtomicU64 {
        match kind {
            ShortIdKind::Rule => &self.rule,
            ShortIdKind::Response => &self.response,
            ShortIdKind::Request => &self.request,
        }
    }

    /// Assign the next short ID for `kind`. Counters only move forward.
    pub fn next(&self, kind: ShortIdKind) -> String {
        let n = self.counter(kind).fetch_add(1, Ordering::SeqCst) + 1;
        kind.format(n)
    }

    /// Seed a counter from an existing short ID loaded from storage at
    /// startup, so restarts never reuse or go backwards (spec.md §8).
    pub fn observe(&self, kind: ShortIdKind, short_id: &str) {
        if let Some(n) = parse_suffix(kind.prefix(), short_id) {
            let counter = self.counter(kind);
            let mut current = counter.load(Ordering::SeqCst);
            while n > current {
                match counter.compare_exchange_weak(
                    current,
                    n,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
    }

    /// Seed all three counters from a map of existing `(kind, short_id)`
    /// pairs, as done once at startup after loading persisted state.
    pub fn seed_from(&self, existing: impl IntoIterator<Item = (ShortIdKind, String)>) {
        for (kind, short_id) in existing {
            self.observe(kind, &short_id);
        }
    }
}

fn parse_suffix(prefix: &str, short_id: &str) -> Option<u64> {
    short_id.strip_prefix(prefix)?.parse().ok()
}

/// A resolver from either a short ID or a full (opaque) ID to the full ID,
/// used by every public operation that accepts "either the short or full
/// ID" (spec.md §4.9).
#[derive(Debug, Default)]
pub struct IdAliasMap {
    short_to_full: HashMap<String, String>,
}

impl IdAliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, short_id: String, full_id: String) {
        self.short_to_full.insert(short_id, full_id);
    }

    pub fn remove_by_full(&mut self, full_id: &str) {
        self.short_to_full.retain(|_, v| v != full_id);
    }

    /// Resolve `id` to the full ID it refers to, treating `id` as a short ID
    /// first and falling back to treating it as already-full.
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.short_to_full
            .get(id)
            .map(|s| s.as_str())
            .unwrap_or(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_advance_monotonically() {
        let registry = ShortIdRegistry::new();
        assert_eq!(registry.next(ShortIdKind::Rule), "r1");
        assert_eq!(registry.next(ShortIdKind::Rule), "r2");
        assert_eq!(registry.next(ShortIdKind::Response), "ds1");
    }

    #[test]
    fn deletion_does_not_free_counter() {
        let registry = ShortIdRegistry::new();
        let a = registry.next(ShortIdKind::Request);
        // simulate deletion of `a`: nothing to do, counter isn't touched.
        let b = registry.next(ShortIdKind::Request);
        assert_eq!(a, "rq1");
        assert_eq!(b, "rq2");
    }

    #[test]
    fn observe_seeds_counter_past_loaded_ids() {
        let registry = ShortIdRegistry::new();
        registry.observe(ShortIdKind::Rule, "r7");
        assert_eq!(registry.next(ShortIdKind::Rule), "r8");
        // Lower observed values never move the counter backwards.
        registry.observe(ShortIdKind::Rule, "r2");
        assert_eq!(registry.next(ShortIdKind::Rule), "r9");
    }

    #[test]
    fn alias_map_resolves_short_or_full() {
        let mut map = IdAliasMap::new();
        map.insert("r1".into(), "flow-abc-123".into());
        assert_eq!(map.resolve("r1"), "flow-abc-123");
        assert_eq!(map.resolve("flow-abc-123"), "flow-abc-123");
        assert_eq!(map.resolve("unknown"), "unknown");
    }
}
