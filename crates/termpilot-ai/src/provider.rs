//! Provider presets and endpoint resolution

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// API version used for Azure deployments when none is configured
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// Known providers speaking the chat completions dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Azure,
    DeepSeek,
    Groq,
    Mistral,
    OpenRouter,
    Together,
    XAI,
    Ollama,
    Custom,
}

/// How the API key is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>` (Azure)
    ApiKeyHeader,
    /// Local provider, no key
    None,
}

/// Static defaults for a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub base_url: Option<&'static str>,
    pub model: Option<&'static str>,
    pub auth: AuthStyle,
}

impl Provider {
    pub const ALL: [Provider; 10] = [
        Provider::OpenAI,
        Provider::Azure,
        Provider::DeepSeek,
        Provider::Groq,
        Provider::Mistral,
        Provider::OpenRouter,
        Provider::Together,
        Provider::XAI,
        Provider::Ollama,
        Provider::Custom,
    ];

    /// Get a human-readable name for this provider
    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAI => "OpenAI",
            Provider::Azure => "Azure OpenAI",
            Provider::DeepSeek => "DeepSeek",
            Provider::Groq => "Groq",
            Provider::Mistral => "Mistral",
            Provider::OpenRouter => "OpenRouter",
            Provider::Together => "Together",
            Provider::XAI => "xAI",
            Provider::Ollama => "Ollama",
            Provider::Custom => "Custom",
        }
    }

    /// Stable identifier used in config files and usage records
    pub fn id(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Azure => "azure",
            Provider::DeepSeek => "deepseek",
            Provider::Groq => "groq",
            Provider::Mistral => "mistral",
            Provider::OpenRouter => "openrouter",
            Provider::Together => "together",
            Provider::XAI => "xai",
            Provider::Ollama => "ollama",
            Provider::Custom => "custom",
        }
    }

    /// Parse a provider id; unknown ids map to `Custom`
    pub fn from_id(id: &str) -> Self {
        let id = id.trim().to_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.id() == id)
            .unwrap_or(Provider::Custom)
    }

    /// Get the environment variable name for this provider's API key
    pub fn api_key_env_var(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAI => Some("OPENAI_API_KEY"),
            Provider::Azure => Some("AZURE_OPENAI_API_KEY"),
            Provider::DeepSeek => Some("DEEPSEEK_API_KEY"),
            Provider::Groq => Some("GROQ_API_KEY"),
            Provider::Mistral => Some("MISTRAL_API_KEY"),
            Provider::OpenRouter => Some("OPENROUTER_API_KEY"),
            Provider::Together => Some("TOGETHER_API_KEY"),
            Provider::XAI => Some("XAI_API_KEY"),
            Provider::Ollama => None,
            Provider::Custom => Some("TERMPILOT_API_KEY"),
        }
    }

    /// The preset table
    pub fn preset(&self) -> Preset {
        match self {
            Provider::OpenAI => Preset {
                base_url: Some("https://api.openai.com/v1"),
                model: Some("gpt-4o-mini"),
                auth: AuthStyle::Bearer,
            },
            Provider::Azure => Preset {
                base_url: None,
                model: None,
                auth: AuthStyle::ApiKeyHeader,
            },
            Provider::DeepSeek => Preset {
                base_url: Some("https://api.deepseek.com/v1"),
                model: Some("deepseek-chat"),
                auth: AuthStyle::Bearer,
            },
            Provider::Groq => Preset {
                base_url: Some("https://api.groq.com/openai/v1"),
                model: Some("llama-3.3-70b-versatile"),
                auth: AuthStyle::Bearer,
            },
            Provider::Mistral => Preset {
                base_url: Some("https://api.mistral.ai/v1"),
                model: Some("mistral-small-latest"),
                auth: AuthStyle::Bearer,
            },
            Provider::OpenRouter => Preset {
                base_url: Some("https://openrouter.ai/api/v1"),
                model: Some("openai/gpt-4o-mini"),
                auth: AuthStyle::Bearer,
            },
            Provider::Together => Preset {
                base_url: Some("https://api.together.xyz/v1"),
                model: Some("meta-llama/Llama-3.3-70B-Instruct-Turbo"),
                auth: AuthStyle::Bearer,
            },
            Provider::XAI => Preset {
                base_url: Some("https://api.x.ai/v1"),
                model: Some("grok-3-mini"),
                auth: AuthStyle::Bearer,
            },
            Provider::Ollama => Preset {
                base_url: Some("http://localhost:11434/v1"),
                model: Some("llama3.1"),
                auth: AuthStyle::None,
            },
            Provider::Custom => Preset {
                base_url: None,
                model: None,
                auth: AuthStyle::Bearer,
            },
        }
    }
}

/// User-facing provider settings. Explicit values override the preset.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub provider: Provider,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub azure_deployment: Option<String>,
    pub azure_api_version: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ProviderSettings {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            base_url: None,
            api_key: None,
            model: None,
            azure_deployment: None,
            azure_api_version: None,
            max_tokens: 4096,
            temperature: 0.2,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Resolve the concrete URL, headers and model, or fail with a
    /// configuration error before any request is made.
    pub fn resolve(&self) -> Result<Endpoint> {
        let preset = self.provider.preset();

        let base_url = non_empty(self.base_url.as_deref())
            .or(preset.base_url)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "no base URL configured for {}",
                    self.provider.name()
                ))
            })?
            .trim_end_matches('/')
            .to_string();

        let model = non_empty(self.model.as_deref())
            .or(preset.model)
            .map(str::to_string);

        let api_key = non_empty(self.api_key.as_deref());
        let mut headers = Vec::new();
        match preset.auth {
            AuthStyle::Bearer => {
                let key = api_key
                    .ok_or_else(|| Error::MissingApiKey(self.provider.name().to_string()))?;
                headers.push(("Authorization".to_string(), format!("Bearer {key}")));
            }
            AuthStyle::ApiKeyHeader => {
                let key = api_key
                    .ok_or_else(|| Error::MissingApiKey(self.provider.name().to_string()))?;
                headers.push(("api-key".to_string(), key.to_string()));
            }
            AuthStyle::None => {}
        }

        let url = if self.provider == Provider::Azure {
            let deployment = non_empty(self.azure_deployment.as_deref())
                .or(model.as_deref())
                .ok_or_else(|| {
                    Error::InvalidConfig("no Azure deployment or model configured".to_string())
                })?;
            let version =
                non_empty(self.azure_api_version.as_deref()).unwrap_or(DEFAULT_AZURE_API_VERSION);
            format!(
                "{base_url}/openai/deployments/{deployment}/chat/completions?api-version={version}"
            )
        } else {
            format!("{base_url}/chat/completions")
        };

        let model = match model {
            Some(m) => m,
            None if self.provider == Provider::Azure => {
                self.azure_deployment.clone().unwrap_or_default()
            }
            None => {
                return Err(Error::InvalidConfig(format!(
                    "no model configured for {}",
                    self.provider.name()
                )));
            }
        };

        Ok(Endpoint {
            url,
            headers,
            model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// A fully resolved request target
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_defaults_fill_missing_values() {
        let endpoint = ProviderSettings::new(Provider::OpenAI)
            .with_api_key("sk-test")
            .resolve()
            .unwrap();
        assert_eq!(endpoint.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(endpoint.model, "gpt-4o-mini");
        assert_eq!(
            endpoint.headers,
            vec![("Authorization".to_string(), "Bearer sk-test".to_string())]
        );
    }

    #[test]
    fn test_overrides_win() {
        let endpoint = ProviderSettings::new(Provider::OpenAI)
            .with_api_key("k")
            .with_base_url("https://proxy.local/v1/")
            .with_model("gpt-4.1")
            .resolve()
            .unwrap();
        assert_eq!(endpoint.url, "https://proxy.local/v1/chat/completions");
        assert_eq!(endpoint.model, "gpt-4.1");
    }

    #[test]
    fn test_azure_url_and_header() {
        let mut settings = ProviderSettings::new(Provider::Azure)
            .with_base_url("https://res.openai.azure.com")
            .with_api_key("azkey");
        settings.azure_deployment = Some("gpt4o-prod".into());
        let endpoint = settings.resolve().unwrap();
        assert_eq!(
            endpoint.url,
            "https://res.openai.azure.com/openai/deployments/gpt4o-prod/chat/completions?api-version=2024-10-21"
        );
        assert_eq!(
            endpoint.headers,
            vec![("api-key".to_string(), "azkey".to_string())]
        );
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let endpoint = ProviderSettings::new(Provider::Ollama).resolve().unwrap();
        assert!(endpoint.headers.is_empty());
        assert_eq!(endpoint.url, "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let err = ProviderSettings::new(Provider::Groq).resolve().unwrap_err();
        assert!(matches!(err, Error::MissingApiKey(_)));
        assert!(err.is_config());
    }

    #[test]
    fn test_custom_without_url_is_config_error() {
        let err = ProviderSettings::new(Provider::Custom)
            .with_api_key("k")
            .resolve()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_blank_key_counts_as_missing() {
        let err = ProviderSettings::new(Provider::OpenAI)
            .with_api_key("   ")
            .resolve()
            .unwrap_err();
        assert!(matches!(err, Error::MissingApiKey(_)));
    }

    #[test]
    fn test_from_id_falls_back_to_custom() {
        assert_eq!(Provider::from_id("DeepSeek"), Provider::DeepSeek);
        assert_eq!(Provider::from_id("my-gateway"), Provider::Custom);
    }
}
