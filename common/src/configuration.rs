use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Runtime configuration, recognized options per spec.md §6. Loaded from a
/// YAML file (mirroring the teacher's `arch_config.yaml` /
/// `common::configuration::Configuration` pattern) with a handful of
/// environment-variable overrides layered on top, matching how the teacher's
/// `main.rs` reads `BIND_ADDRESS` / `LLM_PROVIDER_ENDPOINT` over the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_proxy_channel_address")]
    pub proxy_channel_address: String,

    #[serde(default = "default_ui_channel_address")]
    pub ui_channel_address: String,

    #[serde(default = "default_rest_channel_address")]
    pub rest_channel_address: String,

    /// Upper bound, in bytes, on a single control-channel message.
    #[serde(default = "default_max_inbound_message_size")]
    pub max_inbound_message_size: usize,

    /// If present, persistence (L7) is enabled under this directory.
    #[serde(default)]
    pub data_root: Option<PathBuf>,

    #[serde(default)]
    pub persistence: PersistenceFlags,

    #[serde(default)]
    pub refusal_model_id: Option<String>,

    #[serde(default)]
    pub model_cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub provider_base_urls: std::collections::HashMap<String, String>,

    #[serde(default)]
    pub provider_api_keys: std::collections::HashMap<String, String>,

    #[serde(default)]
    pub hf_token: Option<String>,

    /// spec.md §9 Open Question 1: whether a failed `modify_llm` call on a
    /// rule with `allow_intercept` set should fall into the pending queue
    /// (true) rather than silently forward the original (false, the
    /// source's observed behavior).
    #[serde(default)]
    pub modify_llm_failure_enters_queue: bool,
}

/// Per-category persistence enable flags (spec.md §6). Default is "on" only
/// when a `data_root` is configured; the flags themselves default to `true`
/// so that presence of `data_root` is sufficient, matching spec.md's stated
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceFlags {
    #[serde(default = "default_true")]
    pub traffic: bool,
    #[serde(default = "default_true")]
    pub replay: bool,
    #[serde(default = "default_true")]
    pub rules: bool,
    #[serde(default = "default_true")]
    pub config: bool,
    #[serde(default = "default_true")]
    pub store: bool,
}

impl Default for PersistenceFlags {
    fn default() -> Self {
        Self {
            traffic: true,
            replay: true,
            rules: true,
            config: true,
            store: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_proxy_channel_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_ui_channel_address() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_rest_channel_address() -> String {
    "0.0.0.0:9092".to_string()
}

fn default_max_inbound_message_size() -> usize {
    200 * 1024 * 1024
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            proxy_channel_address: default_proxy_channel_address(),
            ui_channel_address: default_ui_channel_address(),
            rest_channel_address: default_rest_channel_address(),
            max_inbound_message_size: default_max_inbound_message_size(),
            data_root: None,
            persistence: PersistenceFlags::default(),
            refusal_model_id: None,
            model_cache_dir: None,
            provider_base_urls: Default::default(),
            provider_api_keys: Default::default(),
            hf_token: None,
            modify_llm_failure_enters_queue: false,
        }
    }
}

impl Configuration {
    /// Load configuration from a YAML file, falling back to defaults if the
    /// path is absent. `TOLLBOOTH_CONFIG_PATH` overrides `path` when set.
    pub fn load(path: Option<&str>) -> Self {
        let resolved = env::var("TOLLBOOTH_CONFIG_PATH")
            .ok()
            .or_else(|| path.map(|p| p.to_string()));

        let mut config = match resolved {
            Some(path) => match std::fs::read_to_string(&path) {
                Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_else(|err| {
                    tracing::warn!(error = %err, path, "failed to parse config, using defaults");
                    Configuration::default()
                }),
                Err(_) => Configuration::default(),
            },
            None => Configuration::default(),
        };

        if let Ok(addr) = env::var("PROXY_CHANNEL_ADDRESS") {
            config.proxy_channel_address = addr;
        }
        if let Ok(addr) = env::var("UI_CHANNEL_ADDRESS") {
            config.ui_channel_address = addr;
        }
        if let Ok(addr) = env::var("REST_CHANNEL_ADDRESS") {
            config.rest_channel_address = addr;
        }
        if let Ok(root) = env::var("DATA_ROOT") {
            config.data_root = Some(PathBuf::from(root));
        }

        config
    }

    pub fn persistence_enabled(&self) -> bool {
        self.data_root.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_data_root() {
        let config = Configuration::default();
        assert!(config.data_root.is_none());
        assert!(!config.persistence_enabled());
        assert_eq!(config.max_inbound_message_size, 200 * 1024 * 1024);
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = "data_root: /tmp/tollbooth\n";
        let config: Configuration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.data_root, Some(PathBuf::from("/tmp/tollbooth")));
        assert!(config.persistence.traffic);
    }
}
