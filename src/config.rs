use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "FILECHAT_CONFIG";

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub chat: ChatConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Relative paths resolve against the working directory
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Largest accepted `/api/analyze` request body, all files together
    pub max_upload_mb: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            timeout_secs: 120,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            state_file: PathBuf::from("session_data.json"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8501,
            max_upload_mb: 200,
        }
    }
}

impl ServerConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

impl Config {
    /// Load config from $FILECHAT_CONFIG or ~/.filechat/config.toml,
    /// writing the defaults on first run
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        // First run: write the defaults
        if !config_path.exists() {
            let default_config = Config::default();
            default_config.save_to(config_path)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {}", config_path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", config_path.display()))?;

        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let content_with_header = format!(
            "# filechat configuration\n\
             # [chat] points at any OpenAI-compatible chat-completions endpoint.\n\
             # The API key is not kept here; set OPENAI_API_KEY or use `filechat credential`.\n\
             \n{}",
            content
        );

        fs::write(config_path, content_with_header)
            .with_context(|| format!("Failed to write config to {}", config_path.display()))?;

        info!("Created config file at: {}", config_path.display());

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        // Explicit override wins over the home directory
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(explicit));
        }

        let home = std::env::var("USERPROFILE")
            .or_else(|_| std::env::var("HOME"))
            .context("Neither USERPROFILE nor HOME environment variable is set")?;

        Ok(PathBuf::from(home).join(".filechat").join("config.toml"))
    }
}
