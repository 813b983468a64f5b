//! Shared application state, built once in `main` and cloned (cheaply, via
//! `Arc`) into every handler — the same "one `AppState`, three listeners"
//! shape the teacher's `brightstaff` binary uses for its router service.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tollbooth_common::configuration::Configuration;
use tollbooth_core::events::EventBus;
use tollbooth_core::facade::Facade;
use tollbooth_core::intercept::InterceptManager;
use tollbooth_core::llm::{Classifier, LLMClient, LlmCache};
use tollbooth_core::persistence::FilePersistence;
use tollbooth_core::storage::Storage;
use tollbooth_parsers::ParserRegistry;

use crate::proxy_channel::ProxyOutbox;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub intercept: Arc<InterceptManager>,
    pub events: Arc<EventBus>,
    pub facade: Arc<Facade>,
    pub persistence: Arc<FilePersistence>,
    pub llm_cache: Arc<LlmCache>,
    pub llm_client: Option<Arc<dyn LLMClient>>,
    pub classifier: Arc<dyn Classifier>,
    pub parsers: Arc<ParserRegistry>,
    pub config: Arc<Configuration>,
    /// `modify_llm`/refusal `modify` prompt templates, keyed by `template_id`.
    pub templates: Arc<Mutex<HashMap<String, String>>>,
    pub active_provider: Arc<Mutex<String>>,
    /// The currently connected proxy session's outbound sender, if any
    /// (spec.md §4.1: "one logical session to the proxy"). `None` while no
    /// proxy is connected; the timeout sweep and refusal auto-approve tasks
    /// silently drop verdicts they can't deliver in that case.
    pub proxy_outbox: Arc<Mutex<Option<ProxyOutbox>>>,
}
