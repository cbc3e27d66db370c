//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use termpilot_ai::{Provider, ProviderSettings};

/// Default wall-clock limit for agent shell commands
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Configuration for termpilot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider id (openai, azure, deepseek, groq, mistral, openrouter,
    /// together, xai, ollama, custom)
    pub provider: Option<String>,
    /// Base URL override
    pub base_url: Option<String>,
    /// API key (falls back to the provider's environment variable)
    pub api_key: Option<String>,
    /// Model to use
    pub model: Option<String>,
    pub azure_deployment: Option<String>,
    pub azure_api_version: Option<String>,
    /// Terminal lines kept as context
    pub max_context_lines: Option<usize>,
    /// Shell for the interactive session and agent commands
    pub shell: Option<String>,
    /// Timeout for agent shell commands, in seconds
    pub command_timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("termpilot")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("TERMPILOT_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Write the commented example config if no file exists yet
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    pub fn provider(&self) -> Provider {
        self.provider
            .as_deref()
            .map(Provider::from_id)
            .unwrap_or(Provider::OpenAI)
    }

    /// API key from the config, else from the provider's environment variable
    pub fn api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        let var = self.provider().api_key_env_var()?;
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.command_timeout_secs
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        )
    }

    pub fn to_provider_settings(&self) -> ProviderSettings {
        let mut settings = ProviderSettings::new(self.provider());
        settings.base_url = self.base_url.clone();
        settings.api_key = self.api_key();
        settings.model = self.model.clone();
        settings.azure_deployment = self.azure_deployment.clone();
        settings.azure_api_version = self.azure_api_version.clone();
        if let Some(max_tokens) = self.max_tokens {
            settings.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            settings.temperature = temperature;
        }
        settings
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# termpilot configuration file
# Place at ~/.config/termpilot/config.toml (Linux), ~/Library/Application Support/termpilot/config.toml (macOS)
# or %APPDATA%\termpilot\config.toml (Windows). TERMPILOT_CONFIG_PATH overrides the location.

# Provider (openai, azure, deepseek, groq, mistral, openrouter, together, xai, ollama, custom)
provider = "openai"

# Model to use (defaults to the provider's preset)
# model = "gpt-4o-mini"

# Base URL override, required for the custom provider
# base_url = "http://localhost:8080/v1"

# API key. Prefer the provider's environment variable (OPENAI_API_KEY, ...)
# api_key = "sk-..."

# Azure OpenAI
# azure_deployment = "gpt-4o"
# azure_api_version = "2024-10-21"

# Terminal lines kept as context for the agent
max_context_lines = 100

# Shell for the session and for agent commands (defaults to $SHELL)
# shell = "/bin/zsh"

# Timeout for agent shell commands, in seconds
command_timeout_secs = 30

# max_tokens = 4096
# temperature = 0.2
"#
}
