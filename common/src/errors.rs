use thiserror::Error;

/// Error surface shared by the core subsystems (rules, intercept manager,
/// data store, refusal detector). Every variant here is one of the non-fatal
/// error kinds spec.md §7 requires: a "not found", a validation failure, or
/// a degraded-to-safe-default external call failure. None of these unwind a
/// session; every handler that produces one logs and continues.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("pending intercept not found for flow: {0}")]
    PendingInterceptNotFound(String),

    #[error("pending refusal not found: {0}")]
    PendingRefusalNotFound(String),

    #[error("store key not found: {0}")]
    StoreKeyNotFound(String),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid intercept mode: {0}")]
    InvalidInterceptMode(String),

    #[error("external call failed: {0}")]
    ExternalCallFailed(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
