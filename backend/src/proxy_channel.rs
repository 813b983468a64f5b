//! Proxy control channel (T2, spec.md §4.1): one `axum` WebSocket per proxy
//! session, newline-delimited JSON frames. Messages from a single session are
//! processed in receipt order by a single reader task, matching spec.md §5's
//! ordering guarantee — no reordering, no drops.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tollbooth_core::correlator;
use tollbooth_core::events::UiEvent;
use tollbooth_core::intercept::{InterceptMode, LlmContext, Outcome, Verdict};
use tollbooth_core::llm::ChatMessage;
use tollbooth_core::model::{Flow, HeaderList, InterceptType, RawRequest, RawResponse};
use tollbooth_core::modifier::FlowInterpolationContext;
use tollbooth_core::refusal::{self, RefusalActionType};
use tollbooth_parsers::StreamAccumulator;

use crate::state::AppState;

pub type ProxyOutbox = mpsc::UnboundedSender<Outbound>;

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Request {
        flow_id: String,
        timestamp: i64,
        request: RawRequest,
        is_llm_api: bool,
    },
    Response {
        flow_id: String,
        #[allow(dead_code)]
        timestamp: i64,
        request: RawRequest,
        is_llm_api: bool,
        response: RawResponse,
        #[serde(default)]
        stream_complete: bool,
    },
    StreamChunk {
        flow_id: String,
        chunk: String,
        #[allow(dead_code)]
        timestamp: i64,
    },
    InterceptRequest {
        flow_id: String,
        timestamp: i64,
        request: RawRequest,
        is_llm_api: bool,
    },
    InterceptResponse {
        flow_id: String,
        #[allow(dead_code)]
        timestamp: i64,
        request: RawRequest,
        is_llm_api: bool,
        response: RawResponse,
    },
    RequestModified {
        flow_id: String,
        #[allow(dead_code)]
        original_request: RawRequest,
        modified_request: RawRequest,
    },
    ReplayResponse {
        #[allow(dead_code)]
        replay_id: String,
        #[allow(dead_code)]
        variant_id: String,
        #[allow(dead_code)]
        flow_id: Option<String>,
        #[allow(dead_code)]
        error: Option<String>,
    },
    ReplayComplete {
        #[allow(dead_code)]
        replay_id: String,
        #[allow(dead_code)]
        variant_id: String,
        #[allow(dead_code)]
        flow_id: String,
        #[allow(dead_code)]
        success: bool,
    },
}

#[derive(Debug, Serialize, Default)]
pub(crate) struct Modifications {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) headers: Option<HeaderList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) drop: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Outbound {
    SetInterceptMode { mode: InterceptMode },
    SetRulesEnabled { enabled: bool },
    Forward { flow_id: String },
    Drop { flow_id: String },
    ForwardResponse { flow_id: String },
    ForwardModified { flow_id: String, modifications: Modifications },
    ForwardResponseModified { flow_id: String, modifications: Modifications },
}

/// Translates a domain `Verdict` into the wire `Outbound` message. For
/// `ForwardResponseAndClear` (the `auto_clear` rule action), also drops the
/// flow from storage once the verdict has been handed to the outbound
/// channel — spec.md §9 Open Question 2's explicit-ack resolution.
pub(crate) async fn verdict_to_outbound(state: &AppState, verdict: Verdict) -> Outbound {
    match verdict {
        Verdict::Forward { flow_id } => Outbound::Forward { flow_id },
        Verdict::Drop { flow_id } => Outbound::Drop { flow_id },
        Verdict::ForwardResponse { flow_id } => Outbound::ForwardResponse { flow_id },
        Verdict::ForwardResponseAndClear { flow_id } => {
            state.intercept.clear_flow(&flow_id).await;
            Outbound::ForwardResponse { flow_id }
        }
        Verdict::ForwardModified { flow_id, body, headers, status_code } => {
            Outbound::ForwardModified { flow_id, modifications: Modifications { body, headers, status_code, drop: None } }
        }
        Verdict::ForwardResponseModified { flow_id, body, headers, status_code } => {
            Outbound::ForwardResponseModified { flow_id, modifications: Modifications { body, headers, status_code, drop: None } }
        }
    }
}

/// Per-connection state for in-flight streaming responses and the host/path
/// of each flow's request, needed to re-select a parser on later `response`
/// / `stream_chunk` messages (spec.md §4.5 "provider selection is by host +
/// path"). Owned by the single reader task — no locking needed.
#[derive(Default)]
struct SessionState {
    accumulators: HashMap<String, StreamAccumulator>,
    flow_providers: HashMap<String, String>,
}

pub async fn proxy_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_proxy_socket(socket, state))
}

async fn handle_proxy_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = futures_util::StreamExt::split(socket);
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    *state.proxy_outbox.lock().await = Some(tx.clone());

    let writer = tokio::spawn(async move {
        use futures_util::SinkExt;
        while let Some(outbound) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&outbound) {
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    // Re-send current settings on session (re-)establishment (spec.md §4.1).
    let _ = tx.send(Outbound::SetInterceptMode { mode: state.storage.intercept_mode().await });
    let _ = tx.send(Outbound::SetRulesEnabled { enabled: state.storage.rules_enabled().await });

    let mut session = SessionState::default();

    use futures_util::StreamExt;
    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let inbound: Inbound = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error = %err, "proxy channel: failed to parse inbound message, dropping");
                continue;
            }
        };
        handle_inbound(inbound, &state, &tx, &mut session).await;
    }

    *state.proxy_outbox.lock().await = None;
    writer.abort();
}

async fn handle_inbound(inbound: Inbound, state: &AppState, tx: &ProxyOutbox, session: &mut SessionState) {
    match inbound {
        Inbound::Request { flow_id, timestamp, request, is_llm_api } => {
            if is_llm_api {
                session.flow_providers.insert(flow_id.clone(), format!("{}|{}", request.host, request.path));
            }
            let mut flow = Flow::new(flow_id, timestamp, request, is_llm_api);
            if is_llm_api {
                if let Some(parser) = state.parsers.select(&flow.request.host, &flow.request.path) {
                    flow.parsed = parser.parse_request(flow.request.body.as_bytes());
                }
            }
            correlate_request(state, &flow).await;
            let persisted_id = flow.flow_id.clone();
            let outcome = run_request(state, flow).await;
            send_outcome(tx, state, outcome).await;
            persist_flow(state, &persisted_id).await;
        }
        Inbound::InterceptRequest { flow_id, timestamp, request, is_llm_api } => {
            let mut flow = Flow::new(flow_id.clone(), timestamp, request, is_llm_api);
            if is_llm_api {
                if let Some(parser) = state.parsers.select(&flow.request.host, &flow.request.path) {
                    flow.parsed = parser.parse_request(flow.request.body.as_bytes());
                }
            }
            state.storage.insert_flow(flow).await;
            state
                .storage
                .insert_pending_intercept(tollbooth_core::model::PendingIntercept {
                    flow_id: flow_id.clone(),
                    timestamp,
                    intercept_type: InterceptType::Request,
                    timeout_immune: false,
                })
                .await;
            persist_flow(state, &flow_id).await;
            state.events.publish(UiEvent::Intercept { flow_id, intercept_type: InterceptType::Request });
        }
        Inbound::Response { flow_id, request, is_llm_api, response, stream_complete, .. } => {
            handle_response_arrival(state, tx, session, flow_id, request, is_llm_api, response, stream_complete).await;
        }
        Inbound::InterceptResponse { flow_id, request, is_llm_api, response, .. } => {
            let mut flow = state.storage.get_flow(&flow_id).await.unwrap_or_else(|| Flow::new(flow_id.clone(), now_millis(), request, is_llm_api));
            flow.response = Some(response);
            if is_llm_api {
                if let Some(parser) = state.parsers.select(&flow.request.host, &flow.request.path) {
                    flow.parsed_response = parser.parse_response(flow.response.as_ref().unwrap().body.as_bytes());
                }
            }
            state.storage.insert_flow(flow).await;
            state
                .storage
                .insert_pending_intercept(tollbooth_core::model::PendingIntercept {
                    flow_id: flow_id.clone(),
                    timestamp: now_millis(),
                    intercept_type: InterceptType::Response,
                    timeout_immune: false,
                })
                .await;
            persist_flow(state, &flow_id).await;
            state.events.publish(UiEvent::Intercept { flow_id, intercept_type: InterceptType::Response });
        }
        Inbound::StreamChunk { flow_id, chunk, .. } => {
            let Some(key) = session.flow_providers.get(&flow_id).cloned() else { return };
            let Some((host, path)) = key.split_once('|') else { return };
            let Some(parser) = state.parsers.select(host, path) else { return };
            let accumulator = session.accumulators.entry(flow_id.clone()).or_insert_with(|| StreamAccumulator::new(parser.name()));
            accumulator.feed_sse(parser, chunk.as_bytes());
            if let Some(partial) = accumulator.maybe_partial() {
                if let Ok(value) = serde_json::to_value(&partial) {
                    state.events.publish(UiEvent::StreamUpdate { flow_id, partial: value });
                }
            }
        }
        Inbound::RequestModified { flow_id, modified_request, .. } => {
            state
                .storage
                .update_flow(&flow_id, |flow| {
                    flow.apply_request_modification(Some(modified_request.body.clone()), Some(modified_request.headers.clone()), None);
                })
                .await;
            persist_flow(state, &flow_id).await;
        }
        Inbound::ReplayResponse { .. } | Inbound::ReplayComplete { .. } => {
            // Replay orchestration lives entirely at the REST/UI layer (T4);
            // the core has no replay-specific state beyond `replay_source` on
            // the resulting flow, which arrives via a normal `request`/
            // `response` pair.
        }
    }
}

/// Best-effort disk mirror of a just-mutated flow (spec.md §6 "traffic"
/// category), plus the `traffic` UI push spec.md §6 requires on every flow
/// change ("Subsequent pushes include `traffic`, a full snapshot of one
/// flow"). Re-reads from `Storage` rather than threading the owned `Flow`
/// through every call site, since most callers have already handed it off
/// to `InterceptManager`.
async fn persist_flow(state: &AppState, flow_id: &str) {
    if let Some(flow) = state.storage.get_flow(flow_id).await {
        state.persistence.write_flow(&flow).await;
        state.events.publish(UiEvent::Traffic { flow });
    }
}

/// Correlates a just-parsed request into the conversation list (M3, spec.md
/// §4.8): appends to an existing conversation when one's fingerprint/model
/// match and its message count is strictly growing, otherwise starts a new
/// one. No-op for non-LLM or unparsed traffic.
async fn correlate_request(state: &AppState, flow: &Flow) {
    let Some(parsed) = flow.parsed.clone() else { return };
    let now = now_millis();
    let streaming = parsed.stream.unwrap_or(false);
    let flow_id = flow.flow_id.clone();
    let conversation = state
        .storage
        .with_conversations(|conversations| {
            let decision = correlator::correlate(conversations, &parsed);
            let conversation_id = decision.conversation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            if !conversations.iter().any(|c| c.conversation_id == conversation_id) {
                conversations.push(correlator::new_conversation(conversation_id.clone(), &parsed, decision.fingerprint, now));
            }
            let conversation = conversations.iter_mut().find(|c| c.conversation_id == conversation_id).unwrap();
            correlator::append_turn(conversation, uuid::Uuid::new_v4().to_string(), flow_id, parsed, streaming, now);
            conversation.clone()
        })
        .await;
    state.persistence.write_conversations(&state.storage.list_conversations().await).await;
    state.events.publish(UiEvent::Conversation { conversation });
}

/// Attaches a parsed response to its turn, found by `flow_id` across every
/// conversation (M3, spec.md §4.8 "response processing looks up the turn by
/// `flow_id`"). No-op if the flow was never correlated as a request (e.g.
/// non-LLM traffic).
async fn correlate_response(state: &AppState, flow_id: &str, parsed_response: Option<tollbooth_parsers::ParsedResponse>) {
    let Some(response) = parsed_response else { return };
    let now = now_millis();
    let updated = state
        .storage
        .with_conversations(|conversations| {
            if correlator::attach_response(conversations, flow_id, response, now) {
                conversations.iter().find(|c| c.turns.iter().any(|t| t.flow_id == flow_id)).cloned()
            } else {
                None
            }
        })
        .await;
    let Some(conversation) = updated else { return };
    state.persistence.write_conversations(&state.storage.list_conversations().await).await;
    state.events.publish(UiEvent::Conversation { conversation });
}

async fn run_request(state: &AppState, flow: Flow) -> Outcome {
    let templates = state.templates.lock().await.clone();
    let active_provider = state.active_provider.lock().await.clone();
    let llm_ctx = LlmContext {
        client: state.llm_client.as_deref(),
        templates: &templates,
        active_provider: &active_provider,
        memory_cache: state.llm_cache.as_ref(),
        persistent_cache: state.persistence.as_ref(),
    };
    state.intercept.handle_request(flow, now_millis(), &llm_ctx).await
}

async fn send_outcome(tx: &ProxyOutbox, state: &AppState, outcome: Outcome) {
    match outcome {
        Outcome::Verdict(verdict) => {
            let _ = tx.send(verdict_to_outbound(state, verdict).await);
        }
        Outcome::Enqueued { flow_id, intercept_type } => {
            state.events.publish(UiEvent::Intercept { flow_id, intercept_type });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_response_arrival(
    state: &AppState,
    tx: &ProxyOutbox,
    session: &mut SessionState,
    flow_id: String,
    request: RawRequest,
    is_llm_api: bool,
    response: RawResponse,
    stream_complete: bool,
) {
    let mut flow = state
        .storage
        .get_flow(&flow_id)
        .await
        .unwrap_or_else(|| Flow::new(flow_id.clone(), now_millis(), request, is_llm_api));
    flow.response = Some(response);

    if is_llm_api {
        if stream_complete {
            if let Some(mut accumulator) = session.accumulators.remove(&flow_id) {
                flow.parsed_response = Some(accumulator.finalize());
            }
        }
        if flow.parsed_response.is_none() {
            if let Some(parser) = state.parsers.select(&flow.request.host, &flow.request.path) {
                flow.parsed_response = parser.parse_response(flow.response.as_ref().unwrap().body.as_bytes());
            }
        }
    }
    session.flow_providers.remove(&flow_id);

    let templates = state.templates.lock().await.clone();
    let active_provider = state.active_provider.lock().await.clone();
    let llm_ctx = LlmContext {
        client: state.llm_client.as_deref(),
        templates: &templates,
        active_provider: &active_provider,
        memory_cache: state.llm_cache.as_ref(),
        persistent_cache: state.persistence.as_ref(),
    };
    let parsed_response = flow.parsed_response.clone();
    correlate_response(state, &flow_id, parsed_response.clone()).await;
    let outcome = state.intercept.handle_response(flow, now_millis(), &llm_ctx).await;
    persist_flow(state, &flow_id).await;

    let verdict = match outcome {
        Outcome::Enqueued { flow_id, intercept_type } => {
            state.events.publish(UiEvent::Intercept { flow_id, intercept_type });
            return;
        }
        Outcome::Verdict(verdict) => verdict,
    };

    let Some(parsed_response) = (if is_llm_api { parsed_response } else { None }) else {
        let _ = tx.send(verdict_to_outbound(state, verdict).await);
        return;
    };

    apply_refusal_detection(state, tx, verdict, &parsed_response).await;
}

/// Runs after T1's rule processing, per spec.md §4.2: "if the flow is an LLM
/// call and the response is present, T1 invokes the refusal detector."
/// Implemented here rather than inside `InterceptManager` because the
/// detector needs the proxy outbox to withhold (`prompt_user`) or replace
/// (`modify`) the verdict T1 already computed.
async fn apply_refusal_detection(state: &AppState, tx: &ProxyOutbox, verdict: Verdict, parsed_response: &tollbooth_parsers::ParsedResponse) {
    let flow_id = verdict.flow_id().to_string();
    let Some(flow) = state.storage.get_flow(&flow_id).await else {
        let _ = tx.send(verdict_to_outbound(state, verdict).await);
        return;
    };
    let rules = state.storage.list_refusal_rules().await;
    let detection = match refusal::detect(&rules, &flow, parsed_response, state.classifier.as_ref()).await {
        Ok(detection) => detection,
        Err(err) => {
            tracing::warn!(error = %err, "refusal classifier failed, treating as no detection");
            None
        }
    };

    let Some(detection) = detection else {
        let _ = tx.send(verdict_to_outbound(state, verdict).await);
        return;
    };

    let now = now_millis();
    state
        .storage
        .update_flow(&flow_id, |flow| flow.refusal = Some(refusal::metadata_for(&detection, now)))
        .await;
    persist_flow(state, &flow_id).await;
    state.events.publish(UiEvent::RefusalDetected { flow_id: flow_id.clone(), score: detection.score, rule_id: detection.rule.id.clone() });

    match detection.rule.action {
        RefusalActionType::Passthrough => {
            let _ = tx.send(verdict_to_outbound(state, verdict).await);
        }
        RefusalActionType::PromptUser => {
            let Some(flow) = state.storage.get_flow(&flow_id).await else {
                let _ = tx.send(verdict_to_outbound(state, verdict).await);
                return;
            };
            let Some(original_response) = flow.response.clone() else {
                let _ = tx.send(verdict_to_outbound(state, verdict).await);
                return;
            };
            let pending = refusal::new_pending_refusal(uuid::Uuid::new_v4().to_string(), flow_id.clone(), now, &detection, original_response);
            state.events.publish(UiEvent::PendingRefusal { refusal: pending.clone() });
            state.persistence.write_pending_refusal(&pending).await;
            state.storage.insert_pending_refusal(pending).await;
            // Verdict withheld until `Facade::approve_refusal`/`reject_refusal`/
            // `modify_refusal` resolves it (spec.md §4.7, §8 "refusal pending
            // queue").
        }
        RefusalActionType::Modify => match try_modify_refusal(state, &flow_id, &detection).await {
            Some(body) => {
                state.storage.update_flow(&flow_id, |flow| flow.apply_response_modification(Some(body.clone()), None, None, Some(detection.rule.id.clone()))).await;
                persist_flow(state, &flow_id).await;
                let _ = tx.send(Outbound::ForwardResponseModified { flow_id, modifications: Modifications { body: Some(body), headers: None, status_code: None, drop: None } });
            }
            None => {
                tracing::warn!(rule_id = %detection.rule.id, "refusal modify action failed, degrading to passthrough");
                let _ = tx.send(verdict_to_outbound(state, verdict).await);
            }
        },
    }
}

/// Builds the `modify` fallback prompt and calls the LLM directly — always
/// live, never cached, since a refusal rewrite is specific to this one
/// response (unlike `modify_llm`'s `generate_once`, spec.md §4.6).
async fn try_modify_refusal(state: &AppState, flow_id: &str, detection: &refusal::Detection) -> Option<String> {
    let client = state.llm_client.as_deref()?;
    let fallback = detection.rule.fallback_config.as_ref()?;
    let flow = state.storage.get_flow(flow_id).await?;
    let original_body = flow.response.as_ref().map(|r| r.body.clone()).unwrap_or_default();
    let prompt = fallback.prompt_template.replace("{{original_response}}", &original_body);
    let ctx = FlowInterpolationContext { request: &flow.request };
    let prompt = tollbooth_common::interpolate::interpolate(&prompt, &ctx);

    let active_provider = state.active_provider.lock().await.clone();
    let messages = [ChatMessage { role: "user".to_string(), content: prompt }];
    client.chat(&active_provider, &messages).await.ok()
}
