//! Domain logic (L4-L7, M1-M4, T1): rules engine, static/LLM modification,
//! the stream accumulator's conversation correlator, refusal detection, hot
//! storage, the intercept manager state machine, optional disk persistence,
//! the UI event bus, and the public facade the outer proxy/REST/UI layers
//! drive. Everything here is `tokio`-async; parsing (L3/M2) stays in
//! `tollbooth-parsers` as synchronous, pure code.

pub mod correlator;
pub mod errors;
pub mod events;
pub mod facade;
pub mod intercept;
pub mod llm;
pub mod model;
pub mod modifier;
pub mod persistence;
pub mod refusal;
pub mod rules;
pub mod store;
pub mod storage;

pub use events::{EventBus, UiEvent};
pub use facade::Facade;
pub use intercept::{InterceptManager, InterceptMode, Outcome, Verdict};
pub use model::Flow;
pub use persistence::FilePersistence;
pub use rules::{ActionPayload, Rule, RuleEngine};
pub use storage::Storage;
