//! Rules engine (M1, spec.md §4.3) and the `Rule`/`Filter`/`Action` shapes it
//! evaluates. Grounded in the teacher's `ApiDefinition`-style "describe once,
//! match by data, never a hardcoded switch on provider identity" pattern —
//! here applied to flow predicates instead of provider selection.

use crate::model::{header_lookup, Flow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    Exact,
    Contains,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringPredicate {
    pub value: String,
    pub kind: MatchKind,
}

impl StringPredicate {
    /// A regex compile failure makes the predicate never match, without
    /// aborting rule evaluation (spec.md §4.3, §7).
    pub fn matches(&self, subject: &str) -> bool {
        match self.kind {
            MatchKind::Exact => subject == self.value,
            MatchKind::Contains => subject.contains(&self.value),
            MatchKind::Regex => Regex::new(&self.value).map(|re| re.is_match(subject)).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderPredicate {
    pub key: String,
    pub value: StringPredicate,
}

impl HeaderPredicate {
    pub fn matches(&self, headers: &[(String, String)]) -> bool {
        header_lookup(&headers.to_vec(), &self.key)
            .map(|v| self.value.matches(v))
            .unwrap_or(false)
    }
}

/// A numeric predicate covering `status_code` and `response_size` (spec.md
/// §4.3: exact equality, a range expression, or a comma-separated list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NumberPredicate {
    Exact(i64),
    /// One of `>=N`, `<=N`, `>N`, `<N`, `4xx`/`5xx`, or `LO-HI`.
    Range(String),
    List(Vec<i64>),
}

impl NumberPredicate {
    pub fn matches(&self, value: i64) -> bool {
        match self {
            NumberPredicate::Exact(n) => value == *n,
            NumberPredicate::List(values) => values.contains(&value),
            NumberPredicate::Range(expr) => matches_range(expr, value),
        }
    }
}

fn matches_range(expr: &str, value: i64) -> bool {
    let expr = expr.trim();
    if let Some(band) = expr.strip_suffix("xx") {
        return band.parse::<i64>().map(|d| value / 100 == d).unwrap_or(false);
    }
    if let Some(rest) = expr.strip_prefix(">=") {
        return rest.trim().parse::<i64>().map(|n| value >= n).unwrap_or(false);
    }
    if let Some(rest) = expr.strip_prefix("<=") {
        return rest.trim().parse::<i64>().map(|n| value <= n).unwrap_or(false);
    }
    if let Some(rest) = expr.strip_prefix('>') {
        return rest.trim().parse::<i64>().map(|n| value > n).unwrap_or(false);
    }
    if let Some(rest) = expr.strip_prefix('<') {
        return rest.trim().parse::<i64>().map(|n| value < n).unwrap_or(false);
    }
    if let Some((lo, hi)) = expr.split_once('-') {
        if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<i64>(), hi.trim().parse::<i64>()) {
            return value >= lo && value <= hi;
        }
    }
    false
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub host: Option<StringPredicate>,
    pub path: Option<StringPredicate>,
    pub method: Option<StringPredicate>,
    pub header: Option<HeaderPredicate>,
    pub is_llm_api: Option<bool>,
    pub status_code: Option<NumberPredicate>,
    pub response_body_contains: Option<StringPredicate>,
    pub response_header: Option<HeaderPredicate>,
    pub response_size: Option<NumberPredicate>,
}

impl Filter {
    /// All present predicates are conjoined (spec.md §4.3). Response-side
    /// predicates fail automatically when the flow has no response yet.
    pub fn matches(&self, flow: &Flow) -> bool {
        if let Some(p) = &self.host {
            if !p.matches(&flow.request.host) {
                return false;
            }
        }
        if let Some(p) = &self.path {
            if !p.matches(&flow.request.path) {
                return false;
            }
        }
        if let Some(p) = &self.method {
            if !p.matches(&flow.request.method) {
                return false;
            }
        }
        if let Some(p) = &self.header {
            if !p.matches(&flow.request.headers) {
                return false;
            }
        }
        if let Some(expected) = self.is_llm_api {
            if flow.is_llm_api != expected {
                return false;
            }
        }
        let response = match &flow.response {
            Some(r) => r,
            None => {
                return self.status_code.is_none()
                    && self.response_body_contains.is_none()
                    && self.response_header.is_none()
                    && self.response_size.is_none();
            }
        };
        if let Some(p) = &self.status_code {
            if !p.matches(response.status_code as i64) {
                return false;
            }
        }
        if let Some(p) = &self.response_body_contains {
            if !p.matches(&response.body) {
                return false;
            }
        }
        if let Some(p) = &self.response_header {
            if !p.matches(&response.headers) {
                return false;
            }
        }
        if let Some(p) = &self.response_size {
            if !p.matches(response.body.len() as i64) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreKeyMode {
    Single,
    RoundRobin,
    Random,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindReplace {
    pub find: String,
    pub replace: String,
    #[serde(default)]
    pub regex: bool,
    #[serde(default = "default_true")]
    pub replace_all: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BodyModification {
    pub replace_body: Option<String>,
    #[serde(default)]
    pub find_replace: Vec<FindReplace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderOpType {
    Set,
    Remove,
    FindReplace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderOp {
    pub op: HeaderOpType,
    pub key: String,
    pub value: Option<String>,
    pub find: Option<String>,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticModification {
    pub body: Option<BodyModification>,
    #[serde(default)]
    pub headers: Vec<HeaderOp>,
    #[serde(default)]
    pub allow_intercept: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    Merge,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeFromStoreAction {
    pub store_keys: Vec<String>,
    pub store_key_mode: StoreKeyMode,
    pub request_merge_mode: MergeMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmMode {
    GenerateLive,
    GenerateOnce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyLlmAction {
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_variables: BTreeMap<String, String>,
    pub raw_prompt: Option<String>,
    pub provider_override: Option<String>,
    pub mode: LlmMode,
    pub cache_key: Option<String>,
    #[serde(default)]
    pub allow_intercept: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionPayload {
    Passthrough,
    Intercept,
    ModifyStatic(StaticModification),
    ModifyLlm(ModifyLlmAction),
    ServeFromStore(ServeFromStoreAction),
    AutoHide,
    AutoClear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub enabled: bool,
    pub direction: Direction,
    pub priority: i64,
    pub filter: Filter,
    pub action: ActionPayload,
    /// Tags unconditionally unioned into the flow's annotation on any match,
    /// independent of the action outcome (spec.md §4.2 step 2).
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One candidate match produced by rule evaluation, consulted one at a time
/// by the intercept manager so it can fall through (spec.md §4.3).
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
}

/// Evaluates rules against a flow in ascending-priority order, skipping
/// disabled rules, wrong-direction rules, and ids already in `excluded`
/// (spec.md §4.2's "exclusion set grows monotonically", §4.3).
pub struct RuleEngine;

impl RuleEngine {
    /// Returns the next applicable rule, if any, not already in `excluded`.
    /// Ties in priority are broken by the rules' relative order in `rules`
    /// (spec.md §3: "ties broken by insertion order" — callers keep `rules`
    /// stored in insertion order and this function stable-sorts by
    /// priority).
    pub fn next_match<'a>(rules: &'a [Rule], direction: Direction, flow: &Flow, excluded: &std::collections::HashSet<String>) -> Option<RuleMatch<'a>> {
        let mut candidates: Vec<&Rule> = rules
            .iter()
            .filter(|r| r.enabled && r.direction == direction && !excluded.contains(&r.id))
            .collect();
        candidates.sort_by_key(|r| r.priority);
        candidates.into_iter().find(|r| r.filter.matches(flow)).map(|rule| RuleMatch { rule })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Flow, RawRequest};

    fn flow_with_host(host: &str) -> Flow {
        Flow::new(
            "f1".into(),
            0,
            RawRequest {
                method: "POST".into(),
                url: format!("https://{host}/v1/chat"),
                host: host.into(),
                port: 443,
                path: "/v1/chat".into(),
                headers: vec![],
                body: String::new(),
            },
            true,
        )
    }

    fn rule(id: &str, priority: i64, host_contains: &str) -> Rule {
        Rule {
            id: id.into(),
            short_id: format!("r{id}"),
            name: id.into(),
            enabled: true,
            direction: Direction::Request,
            priority,
            filter: Filter {
                host: Some(StringPredicate { value: host_contains.into(), kind: MatchKind::Contains }),
                ..Default::default()
            },
            action: ActionPayload::Passthrough,
            tags: vec![],
        }
    }

    #[test]
    fn picks_lowest_priority_match_first() {
        let rules = vec![rule("b", 5, "example.com"), rule("a", 1, "example.com")];
        let flow = flow_with_host("api.example.com");
        let excluded = Default::default();
        let m = RuleEngine::next_match(&rules, Direction::Request, &flow, &excluded).unwrap();
        assert_eq!(m.rule.id, "a");
    }

    #[test]
    fn excluded_rule_is_skipped() {
        let rules = vec![rule("a", 1, "example.com"), rule("b", 2, "example.com")];
        let flow = flow_with_host("api.example.com");
        let mut excluded = std::collections::HashSet::new();
        excluded.insert("a".to_string());
        let m = RuleEngine::next_match(&rules, Direction::Request, &flow, &excluded).unwrap();
        assert_eq!(m.rule.id, "b");
    }

    #[test]
    fn disabled_rule_never_matches() {
        let mut r = rule("a", 1, "example.com");
        r.enabled = false;
        let flow = flow_with_host("api.example.com");
        let excluded = Default::default();
        assert!(RuleEngine::next_match(&[r], Direction::Request, &flow, &excluded).is_none());
    }

    #[test]
    fn status_band_predicate_matches_4xx() {
        let pred = NumberPredicate::Range("4xx".to_string());
        assert!(pred.matches(404));
        assert!(!pred.matches(200));
    }

    #[test]
    fn invalid_regex_predicate_never_matches_but_does_not_panic() {
        let pred = StringPredicate { value: "(unclosed".into(), kind: MatchKind::Regex };
        assert!(!pred.matches("anything"));
    }
}
