//! REST facade (T4, spec.md §4.9): a thin `axum::Router` over
//! `tollbooth_core::Facade`. Every handler just deserializes its body,
//! delegates, and maps `CoreError` to a status code.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tollbooth_common::errors::CoreError;
use tollbooth_core::intercept::InterceptMode;
use tollbooth_core::model::{PendingRefusal, StoredItem, StoredKind};
use tollbooth_core::rules::Rule;

use crate::proxy_channel::{Modifications, Outbound};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/flows", get(list_flows).delete(clear_traffic))
        .route("/flows/:id", get(get_flow).delete(delete_flow))
        .route("/conversations", get(list_conversations))
        .route("/conversations/rebuild", post(rebuild_conversations))
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/enabled", put(set_rules_enabled))
        .route("/rules/:id", delete(delete_rule))
        .route("/rules/:id/enabled", put(set_rule_enabled))
        .route("/intercept-mode", put(set_intercept_mode))
        .route("/pending-intercepts/:flow_id/forward", post(forward_pending))
        .route("/pending-intercepts/:flow_id/drop", post(drop_pending))
        .route("/store/requests/:key", get(get_stored_request))
        .route("/store/responses/:key", get(get_stored_response))
        .route("/store", post(save_stored_item))
        .route("/store/:kind/:key", delete(delete_stored_item))
        .route("/refusals", get(list_pending_refusals))
        .route("/refusals/rules", get(list_refusal_rules).put(replace_refusal_rules))
        .route("/refusals/:id/approve", post(approve_refusal))
        .route("/refusals/:id/reject", post(reject_refusal))
        .route("/refusals/:id/modify", post(modify_refusal))
        .route("/llm-cache", delete(clear_llm_cache))
        .with_state(state)
}

fn core_error_response(err: CoreError) -> Response {
    let status = match &err {
        CoreError::FlowNotFound(_)
        | CoreError::ConversationNotFound(_)
        | CoreError::RuleNotFound(_)
        | CoreError::PendingInterceptNotFound(_)
        | CoreError::PendingRefusalNotFound(_)
        | CoreError::StoreKeyNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::InvalidRule(_) | CoreError::InvalidInterceptMode(_) => StatusCode::BAD_REQUEST,
        CoreError::ExternalCallFailed(_) | CoreError::Persistence(_) | CoreError::Serialization(_) => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string()).into_response()
}

type ApiResult<T> = Result<Json<T>, Response>;

async fn list_flows(State(state): State<AppState>) -> Json<Vec<tollbooth_core::model::Flow>> {
    Json(state.facade.list_flows().await)
}

async fn get_flow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<tollbooth_core::model::Flow> {
    state.facade.get_flow(&id).await.map(Json).map_err(core_error_response)
}

async fn delete_flow(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, Response> {
    state.facade.delete_flow(&id).await.map_err(core_error_response)?;
    state.persistence.delete_flow(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_traffic(State(state): State<AppState>) -> StatusCode {
    let flow_ids: Vec<String> = state.facade.list_flows().await.into_iter().map(|f| f.flow_id).collect();
    state.facade.clear_traffic().await;
    for flow_id in flow_ids {
        state.persistence.delete_flow(&flow_id).await;
    }
    StatusCode::NO_CONTENT
}

async fn list_conversations(State(state): State<AppState>) -> Json<Vec<tollbooth_core::model::Conversation>> {
    Json(state.facade.list_conversations().await)
}

/// Discards the current conversation list and replays correlation over
/// persisted traffic (spec.md §4.8), for recovering from a missed
/// request/response pairing or a correlator change.
async fn rebuild_conversations(State(state): State<AppState>) -> Json<Vec<tollbooth_core::model::Conversation>> {
    let conversations = state.facade.rebuild_conversations().await;
    state.persistence.write_conversations(&conversations).await;
    Json(conversations)
}

async fn list_rules(State(state): State<AppState>) -> Json<Vec<Rule>> {
    Json(state.facade.list_rules().await)
}

async fn create_rule(State(state): State<AppState>, Json(rule): Json<Rule>) -> ApiResult<Rule> {
    let created = state.facade.create_rule(rule).await.map_err(core_error_response)?;
    state.persistence.write_rules(&state.storage.list_rules().await).await;
    Ok(Json(created))
}

async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, Response> {
    state.facade.delete_rule(&id).await.map_err(core_error_response)?;
    state.persistence.write_rules(&state.storage.list_rules().await).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_rule_enabled(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<EnabledBody>) -> Result<StatusCode, Response> {
    state.facade.set_rule_enabled(&id, body.enabled).await.map_err(core_error_response)?;
    state.persistence.write_rules(&state.storage.list_rules().await).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_rules_enabled(State(state): State<AppState>, Json(body): Json<EnabledBody>) -> StatusCode {
    state.facade.set_rules_enabled(body.enabled).await;
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct InterceptModeBody {
    mode: InterceptMode,
}

async fn set_intercept_mode(State(state): State<AppState>, Json(body): Json<InterceptModeBody>) -> StatusCode {
    state.facade.set_intercept_mode(body.mode).await;
    StatusCode::NO_CONTENT
}

#[derive(Serialize)]
struct VerdictBody {
    flow_id: String,
}

async fn forward_pending(State(state): State<AppState>, Path(flow_id): Path<String>) -> Result<Json<VerdictBody>, Response> {
    state
        .facade
        .forward_pending(&flow_id)
        .await
        .map(|v| Json(VerdictBody { flow_id: v.flow_id().to_string() }))
        .map_err(core_error_response)
}

async fn drop_pending(State(state): State<AppState>, Path(flow_id): Path<String>) -> Result<Json<VerdictBody>, Response> {
    state
        .facade
        .drop_pending(&flow_id)
        .await
        .map(|v| Json(VerdictBody { flow_id: v.flow_id().to_string() }))
        .map_err(core_error_response)
}

async fn get_stored_request(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<StoredItem> {
    state.facade.get_stored_request(&key).await.map(Json).map_err(core_error_response)
}

async fn get_stored_response(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<StoredItem> {
    state.facade.get_stored_response(&key).await.map(Json).map_err(core_error_response)
}

async fn save_stored_item(State(state): State<AppState>, Json(item): Json<StoredItem>) -> Json<StoredItem> {
    let saved = state.facade.save_stored_item(item).await;
    state.persistence.write_stored_item(&saved).await;
    Json(saved)
}

async fn delete_stored_item(State(state): State<AppState>, Path((kind, key)): Path<(String, String)>) -> Result<StatusCode, Response> {
    let kind = match kind.as_str() {
        "requests" => StoredKind::Request,
        "responses" => StoredKind::Response,
        _ => return Err((StatusCode::NOT_FOUND, "unknown store kind").into_response()),
    };
    state.facade.delete_stored_item(kind, &key).await.map_err(core_error_response)?;
    state.persistence.delete_stored_item(kind, &key).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_pending_refusals(State(state): State<AppState>) -> Json<Vec<tollbooth_core::model::PendingRefusal>> {
    Json(state.facade.list_pending_refusals().await)
}

/// Tells the connected proxy session (if any) what to do with the response
/// a `PendingRefusal` was withholding, per spec.md §4.7's resolution
/// statuses — `approved` releases the original, `rejected` drops it,
/// `modified` releases the LLM-rewritten body.
async fn forward_resolved_refusal(state: &AppState, pending: &PendingRefusal) {
    state.persistence.delete_pending_refusal(&pending.id).await;
    let Some(tx) = state.proxy_outbox.lock().await.clone() else { return };
    let outbound = match pending.status {
        tollbooth_core::model::RefusalStatus::Approved => Outbound::ForwardResponse { flow_id: pending.flow_id.clone() },
        tollbooth_core::model::RefusalStatus::Rejected => Outbound::Drop { flow_id: pending.flow_id.clone() },
        tollbooth_core::model::RefusalStatus::Modified => {
            let body = pending.modified_response.as_ref().map(|r| r.body.clone()).unwrap_or_default();
            Outbound::ForwardResponseModified {
                flow_id: pending.flow_id.clone(),
                modifications: Modifications { body: Some(body), headers: None, status_code: None, drop: None },
            }
        }
        tollbooth_core::model::RefusalStatus::Pending => return,
    };
    let _ = tx.send(outbound);
}

async fn approve_refusal(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<PendingRefusal> {
    let pending = state.facade.approve_refusal(&id).await.map_err(core_error_response)?;
    forward_resolved_refusal(&state, &pending).await;
    Ok(Json(pending))
}

async fn reject_refusal(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<PendingRefusal> {
    let pending = state.facade.reject_refusal(&id).await.map_err(core_error_response)?;
    forward_resolved_refusal(&state, &pending).await;
    Ok(Json(pending))
}

#[derive(Deserialize)]
struct ModifyRefusalBody {
    body: String,
}

async fn modify_refusal(State(state): State<AppState>, Path(id): Path<String>, Json(payload): Json<ModifyRefusalBody>) -> ApiResult<PendingRefusal> {
    let pending = state.facade.modify_refusal(&id, payload.body).await.map_err(core_error_response)?;
    forward_resolved_refusal(&state, &pending).await;
    Ok(Json(pending))
}

async fn list_refusal_rules(State(state): State<AppState>) -> Json<Vec<tollbooth_core::refusal::RefusalRule>> {
    Json(state.facade.list_refusal_rules().await)
}

async fn replace_refusal_rules(State(state): State<AppState>, Json(rules): Json<Vec<tollbooth_core::refusal::RefusalRule>>) -> StatusCode {
    state.facade.replace_refusal_rules(rules).await;
    state.persistence.write_refusal_rules(&state.storage.list_refusal_rules().await).await;
    StatusCode::NO_CONTENT
}

#[derive(Deserialize, Default)]
struct ClearCacheQuery {
    key: Option<String>,
}

async fn clear_llm_cache(State(state): State<AppState>, axum::extract::Query(query): axum::extract::Query<ClearCacheQuery>) -> StatusCode {
    state.facade.clear_llm_cache(query.key.as_deref()).await;
    StatusCode::NO_CONTENT
}
