//! Configuration management for mend
//!
//! Stores settings in ~/.config/mend/config.json; the credential and
//! endpoint always come from the environment first so CI runs need no
//! config file at all.

use mend_core::util::debug_stderr_enabled;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-5-mini";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chat-completions endpoint override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    /// Model id override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mend"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str::<Config>(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        if debug_stderr_enabled() {
                            eprintln!(
                                "  Warning: Config file was corrupted ({}). Defaults were loaded.",
                                err
                            );
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Get the inference API key (environment only; supplied out-of-band).
    pub fn get_api_key(&self) -> Option<String> {
        std::env::var("MEND_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
    }

    /// Chat-completions endpoint, environment override first.
    pub fn api_url(&self) -> String {
        std::env::var("MEND_API_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    /// Model id, environment override first.
    pub fn model(&self) -> String {
        std::env::var("MEND_MODEL")
            .ok()
            .filter(|model| !model.trim().is_empty())
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    /// Whether the lexical semantic-search backend is disabled.
    pub fn semantic_search_disabled(&self) -> bool {
        std::env::var("MEND_DISABLE_SEMANTIC")
            .map(|value| {
                matches!(
                    value.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false)
    }
}
