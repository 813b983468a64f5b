//! Conversation correlator (M3, spec.md §4.8). Pure functions over snapshots
//! — `Storage` is still the only entity that actually mutates the
//! conversation list (spec.md §5).

use crate::model::{Conversation, Turn};
use sha2::{Digest, Sha256};
use tollbooth_parsers::{ParsedRequest, ParsedResponse};

/// `sha256(model || ":" || first-user-message-content[:500])[:16]` (spec.md
/// §4.8). Stable across `max_tokens`/`temperature`/`stream` changes because
/// none of those fields feed the hash (spec.md §8 "fingerprint stability").
pub fn fingerprint(request: &ParsedRequest) -> String {
    let first_user_text = request
        .messages
        .iter()
        .find(|m| m.role == "user")
        .and_then(|m| m.content.first())
        .and_then(|c| c.text())
        .unwrap_or("");
    let truncated: String = first_user_text.chars().take(500).collect();

    let mut hasher = Sha256::new();
    hasher.update(request.model.as_bytes());
    hasher.update(b":");
    hasher.update(truncated.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect::<String>()[..16].to_string()
}

pub struct CorrelationDecision {
    pub conversation_id: Option<String>,
    pub fingerprint: String,
}

/// Find an existing conversation this request continues: same fingerprint,
/// same model, and a strictly growing message count versus the last turn
/// (spec.md §4.8, §8 "conversation monotonicity").
pub fn correlate(conversations: &[Conversation], request: &ParsedRequest) -> CorrelationDecision {
    let fp = fingerprint(request);
    let existing = conversations.iter().find(|c| {
        c.correlation_hash == fp
            && c.model == request.model
            && c.turns
                .last()
                .map(|t| t.request.messages.len() < request.messages.len())
                .unwrap_or(true)
    });
    CorrelationDecision {
        conversation_id: existing.map(|c| c.conversation_id.clone()),
        fingerprint: fp,
    }
}

pub fn new_conversation(conversation_id: String, request: &ParsedRequest, fingerprint: String, now: i64) -> Conversation {
    Conversation {
        conversation_id,
        created_at: now,
        updated_at: now,
        model: request.model.clone(),
        provider: request.provider.clone(),
        turns: Vec::new(),
        message_count: request.messages.len(),
        correlation_hash: fingerprint,
    }
}

pub fn append_turn(conversation: &mut Conversation, turn_id: String, flow_id: String, request: ParsedRequest, streaming: bool, now: i64) {
    conversation.message_count = request.messages.len();
    conversation.updated_at = now;
    conversation.turns.push(Turn {
        turn_id,
        flow_id,
        timestamp: now,
        request,
        response: None,
        streaming,
        original_request: None,
        original_response: None,
        request_modified: false,
        response_modified: false,
    });
}

/// Attach a response to the turn matching `flow_id`, looked up by scanning
/// turns across every conversation (spec.md §4.8: "response processing
/// looks up the turn by `flow_id`").
pub fn attach_response(conversations: &mut [Conversation], flow_id: &str, response: ParsedResponse, now: i64) -> bool {
    for conversation in conversations.iter_mut() {
        if let Some(turn) = conversation.turns.iter_mut().find(|t| t.flow_id == flow_id) {
            turn.response = Some(response);
            conversation.updated_at = now;
            return true;
        }
    }
    false
}

/// One piece of LLM traffic as seen by a rebuild pass: a request, and
/// optionally its paired response, already parsed.
pub struct RebuildItem {
    pub flow_id: String,
    pub timestamp: i64,
    pub request: ParsedRequest,
    pub response: Option<ParsedResponse>,
    pub streaming: bool,
}

/// Replay request/response correlation over persisted traffic, sorted by
/// ascending timestamp (spec.md §4.8). Idempotent: calling it twice on the
/// same `items` produces the same conversation set because correlation
/// depends only on fingerprint + model + message-count growth, not on
/// anything mutated by a previous rebuild.
pub fn rebuild(mut items: Vec<RebuildItem>, mint_conversation_id: impl Fn() -> String, mint_turn_id: impl Fn() -> String) -> Vec<Conversation> {
    items.sort_by_key(|i| i.timestamp);
    let mut conversations: Vec<Conversation> = Vec::new();

    for item in items {
        let decision = correlate(&conversations, &item.request);
        let conversation = match decision.conversation_id {
            Some(id) => conversations.iter_mut().find(|c| c.conversation_id == id).unwrap(),
            None => {
                conversations.push(new_conversation(mint_conversation_id(), &item.request, decision.fingerprint, item.timestamp));
                conversations.last_mut().unwrap()
            }
        };
        append_turn(conversation, mint_turn_id(), item.flow_id.clone(), item.request, item.streaming, item.timestamp);
        if let Some(response) = item.response {
            conversation.turns.last_mut().unwrap().response = Some(response);
        }
    }
    conversations
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollbooth_parsers::{ContentBlock, Message};

    fn request(model: &str, text: &str, extra_messages: usize) -> ParsedRequest {
        let mut messages = vec![Message {
            role: "user".to_string(),
            content: vec![ContentBlock::Text { text: text.to_string() }],
        }];
        for _ in 0..extra_messages {
            messages.push(Message {
                role: "assistant".to_string(),
                content: vec![ContentBlock::Text { text: "ok".to_string() }],
            });
        }
        ParsedRequest {
            provider: "anthropic".to_string(),
            model: model.to_string(),
            messages,
            system: None,
            max_tokens: Some(100),
            temperature: None,
            stream: None,
            tools: None,
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn fingerprint_ignores_sampling_params() {
        let mut a = request("claude-3", "hello", 0);
        let mut b = a.clone();
        a.max_tokens = Some(1);
        a.temperature = Some(0.1);
        a.stream = Some(true);
        b.max_tokens = Some(999);
        b.temperature = Some(0.9);
        b.stream = Some(false);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn new_conversation_created_when_no_match() {
        let decision = correlate(&[], &request("claude-3", "hi", 0));
        assert!(decision.conversation_id.is_none());
    }

    #[test]
    fn appends_to_existing_conversation_when_messages_grow() {
        let r1 = request("claude-3", "hi", 0);
        let fp = fingerprint(&r1);
        let mut conversation = new_conversation("c1".into(), &r1, fp, 0);
        append_turn(&mut conversation, "t1".into(), "f1".into(), r1.clone(), false, 0);

        let r2 = request("claude-3", "hi", 1);
        let decision = correlate(&[conversation], &r2);
        assert_eq!(decision.conversation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn rebuild_is_idempotent() {
        let mut counter = std::cell::Cell::new(0);
        let mint = || {
            let n = counter.get();
            counter.set(n + 1);
            format!("id{n}")
        };
        let items = || {
            vec![
                RebuildItem { flow_id: "f1".into(), timestamp: 1, request: request("claude-3", "hi", 0), response: None, streaming: false },
                RebuildItem { flow_id: "f2".into(), timestamp: 2, request: request("claude-3", "hi", 1), response: None, streaming: false },
            ]
        };
        let first = rebuild(items(), &mint, &mint);
        counter.set(0);
        let second = rebuild(items(), &mint, &mint);
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].turns.len(), second[0].turns.len());
    }
}
