//! The data model (spec.md §3). `Storage` (L6) is the single owner of every
//! entity defined here; everything else holds snapshots or mutates through
//! `Storage`'s operations.

use serde::{Deserialize, Serialize};
use tollbooth_parsers::{ParsedRequest, ParsedResponse};

/// Ordered, case-preserving header list — headers are rarely looked up by
/// more than a handful of keys, and preserving wire order matters more than
/// O(1) lookup (spec.md §3's "ordered mapping of case-preserving names").
pub type HeaderList = Vec<(String, String)>;

pub fn header_lookup<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawRequest {
    pub method: String,
    pub url: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub headers: HeaderList,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawResponse {
    pub status_code: u16,
    pub headers: HeaderList,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Annotation {
    pub title: String,
    pub body: Option<String>,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Annotation {
    /// Union `new_tags` into `self.tags`, keeping it a set (spec.md §3:
    /// "tags in `annotation.tags` are unique per flow").
    pub fn union_tags(&mut self, new_tags: &[String], now: i64) {
        for tag in new_tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySource {
    pub variant_id: String,
    pub parent_flow_id: String,
    /// Whether the variant that spawned this flow was created with
    /// `intercept_on_replay` (spec.md §4.2: "T1 enqueues a response
    /// intercept regardless of mode").
    pub intercept_on_replay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefusalMetadata {
    pub score: f32,
    pub matched_rule_id: Option<String>,
    pub detected_at: i64,
}

/// The central entity (spec.md §3). Invariants enforced by `Storage`, never
/// by callers: `original_request`/`original_response` are set at most once
/// and never change afterward; a `*_modified` flag of `true` implies the
/// matching `original_*` is `Some`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub flow_id: String,
    pub timestamp: i64,
    pub request: RawRequest,
    pub response: Option<RawResponse>,
    pub is_llm_api: bool,
    pub parsed: Option<ParsedRequest>,
    pub parsed_response: Option<ParsedResponse>,
    pub original_request: Option<RawRequest>,
    pub original_response: Option<RawResponse>,
    pub request_modified: bool,
    pub response_modified: bool,
    pub request_modified_by_rule: Option<String>,
    pub response_modified_by_rule: Option<String>,
    pub refusal: Option<RefusalMetadata>,
    pub hidden: bool,
    pub hidden_at: Option<i64>,
    pub hidden_by_rule: Option<String>,
    pub annotation: Option<Annotation>,
    pub replay_source: Option<ReplaySource>,
}

impl Flow {
    pub fn new(flow_id: String, timestamp: i64, request: RawRequest, is_llm_api: bool) -> Self {
        Self {
            flow_id,
            timestamp,
            request,
            response: None,
            is_llm_api,
            parsed: None,
            parsed_response: None,
            original_request: None,
            original_response: None,
            request_modified: false,
            response_modified: false,
            request_modified_by_rule: None,
            response_modified_by_rule: None,
            refusal: None,
            hidden: false,
            hidden_at: None,
            hidden_by_rule: None,
            annotation: None,
            replay_source: None,
        }
    }

    /// Record a request-side modification, snapshotting `original_request`
    /// the first time only (spec.md §8 "modification immutability").
    pub fn apply_request_modification(&mut self, body: Option<String>, headers: Option<HeaderList>, rule_id: Option<String>) {
        if self.original_request.is_none() {
            self.original_request = Some(self.request.clone());
        }
        if let Some(body) = body {
            self.request.body = body;
        }
        if let Some(headers) = headers {
            self.request.headers = headers;
        }
        self.request_modified = true;
        if rule_id.is_some() {
            self.request_modified_by_rule = rule_id;
        }
    }

    pub fn apply_response_modification(&mut self, body: Option<String>, headers: Option<HeaderList>, status_code: Option<u16>, rule_id: Option<String>) {
        let response = self.response.get_or_insert_with(|| RawResponse {
            status_code: 0,
            headers: Vec::new(),
            body: String::new(),
        });
        if self.original_response.is_none() {
            self.original_response = Some(response.clone());
        }
        if let Some(body) = body {
            response.body = body;
        }
        if let Some(headers) = headers {
            response.headers = headers;
        }
        if let Some(status_code) = status_code {
            response.status_code = status_code;
        }
        self.response_modified = true;
        if rule_id.is_some() {
            self.response_modified_by_rule = rule_id;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub flow_id: String,
    pub timestamp: i64,
    pub request: ParsedRequest,
    pub response: Option<ParsedResponse>,
    pub streaming: bool,
    pub original_request: Option<ParsedRequest>,
    pub original_response: Option<ParsedResponse>,
    pub request_modified: bool,
    pub response_modified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub model: String,
    pub provider: String,
    pub turns: Vec<Turn>,
    pub message_count: usize,
    pub correlation_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptType {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingIntercept {
    pub flow_id: String,
    pub timestamp: i64,
    pub intercept_type: InterceptType,
    pub timeout_immune: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMetadata {
    pub created_at: i64,
    pub description: Option<String>,
    pub short_id: String,
}

/// A named, user-editable stored request/response blob (spec.md §3, L4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredItem {
    pub key: String,
    pub kind: StoredKind,
    pub metadata: StoredMetadata,
    pub method: Option<String>,
    pub url: Option<String>,
    pub status_code: Option<u16>,
    pub headers: HeaderList,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefusalAnalysis {
    pub score: f32,
    pub threshold: f32,
    pub rule_id: String,
}

/// At most one per flow, 5-minute timeout (spec.md §3, §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRefusal {
    pub id: String,
    pub flow_id: String,
    pub timestamp: i64,
    pub analysis: RefusalAnalysis,
    pub matched_rule_ref: Option<String>,
    pub status: RefusalStatus,
    pub original_response: RawResponse,
    pub modified_response: Option<RawResponse>,
}
