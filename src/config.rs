use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    /// Language for generated text overlays and edit instructions.
    #[serde(default = "default_language")]
    pub language: String,

    /// Pause between consecutive generation calls, in milliseconds.
    #[serde(default = "default_api_call_delay_ms")]
    pub api_call_delay_ms: u64,

    pub gemini: GeminiConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_text_model")]
    pub text_model: String,

    #[serde(default = "default_image_model")]
    pub image_model: String,

    #[serde(default = "default_edit_model")]
    pub edit_model: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_output() -> String {
    "output".to_string()
}
fn default_language() -> String {
    "English".to_string()
}
fn default_api_call_delay_ms() -> u64 {
    2500
}
fn default_text_model() -> String {
    "gemini-2.5-pro".to_string()
}
fn default_image_model() -> String {
    "imagen-4.0-generate-001".to_string()
}
fn default_edit_model() -> String {
    "gemini-2.5-flash-image".to_string()
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        if config.gemini.api_key.trim().is_empty() {
            anyhow::bail!("gemini.api_key is missing from config.yml");
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }
}
