use llm_inference::EngineContext;
use serde::{Deserialize, Serialize};
use std::env;

pub const CONFIG_ENV_VAR: &str = "CHATPET_CONFIG";

/// Front-end configuration, read as JSON from `CHATPET_CONFIG`
///
/// Example: `{"modelPath": "/models/gemma-3-1b-it", "cpu": true}`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub cpu: bool,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub use_flash_attn: bool,
}

impl ChatConfig {
    /// Load configuration from the CHATPET_CONFIG environment variable
    /// Falls back to defaults if not set or invalid
    pub fn from_env() -> Self {
        match env::var(CONFIG_ENV_VAR) {
            Ok(config_str) => Self::parse(&config_str),
            Err(_) => {
                tracing::info!("{} not set, using default configuration", CONFIG_ENV_VAR);
                ChatConfig::default()
            }
        }
    }

    pub fn parse(config_str: &str) -> Self {
        match serde_json::from_str::<ChatConfig>(config_str) {
            Ok(config) => {
                tracing::info!("Loaded chat configuration: {:?}", config);
                config
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse {} environment variable: {}. Using default configuration.",
                    CONFIG_ENV_VAR,
                    e
                );
                ChatConfig::default()
            }
        }
    }

    pub fn engine_context(&self) -> EngineContext {
        EngineContext {
            cpu: self.cpu,
            dtype: self.dtype.clone(),
            use_flash_attn: self.use_flash_attn,
        }
    }
}
