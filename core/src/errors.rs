//! Subsystem-local error enums that degrade to a `CoreError` at the facade
//! boundary (spec.md §7: every external-call failure "degrades to a safe
//! default"; these enums are what the degradation decision is made from).

use thiserror::Error;
use tollbooth_common::CoreError;

#[derive(Debug, Error)]
pub enum ServeFromStoreError {
    #[error("store key not found: {0}")]
    KeyNotFound(String),
    #[error("store key list is empty")]
    EmptyKeyList,
}

impl From<ServeFromStoreError> for CoreError {
    fn from(err: ServeFromStoreError) -> Self {
        match err {
            ServeFromStoreError::KeyNotFound(key) => CoreError::StoreKeyNotFound(key),
            ServeFromStoreError::EmptyKeyList => CoreError::InvalidRule("store_keys is empty".into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleValidationError {
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("serve_from_store rule must declare at least one store key")]
    MissingStoreKeys,
    #[error("modify_llm rule must declare a template or a raw prompt")]
    MissingPrompt,
    #[error("invalid regex in rule predicate: {0}")]
    InvalidRegex(String),
}

impl From<RuleValidationError> for CoreError {
    fn from(err: RuleValidationError) -> Self {
        CoreError::InvalidRule(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ModifyError {
    #[error("no LLM provider configured")]
    NoProvider,
    #[error("LLM client call failed: {0}")]
    ClientFailed(String),
    #[error("classifier call failed: {0}")]
    ClassifierFailed(String),
}

impl From<ModifyError> for CoreError {
    fn from(err: ModifyError) -> Self {
        CoreError::ExternalCallFailed(err.to_string())
    }
}
