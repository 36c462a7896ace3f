use serde::{Deserialize, Serialize};

/// Connection defaults of an OpenAI-compatible chat-completion backend.
pub struct BackendConfig {
    pub base_url: String,
    pub api_key_env_var: Option<&'static str>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Openrouter,
    Ollama,
    Openai,
}

/// Placeholder key for backends that do not authenticate.
pub const ANONYMOUS_API_KEY: &str =
    "sk-or-v1-0000000000000000000000000000000000000000000000000000000000000000";

impl Backend {
    pub fn config(&self) -> BackendConfig {
        match self {
            Backend::Openrouter => BackendConfig {
                base_url: "https://openrouter.ai/api/v1/".to_string(),
                api_key_env_var: Some("OPENROUTER_API_KEY"),
            },
            Backend::Ollama => BackendConfig {
                base_url: "http://localhost:11434/v1/".to_string(),
                api_key_env_var: None,
            },
            Backend::Openai => BackendConfig {
                base_url: "https://api.openai.com/v1/".to_string(),
                api_key_env_var: Some("OPENAI_API_KEY"),
            },
        }
    }

    /// Reads the API key from the environment. `Err` names the missing variable.
    pub fn api_key(&self) -> Result<String, String> {
        match self.config().api_key_env_var {
            Some(var) => match std::env::var(var) {
                Ok(value) if !value.trim().is_empty() => Ok(value),
                _ => Err(format!("environment variable {var} not set")),
            },
            None => Ok(ANONYMOUS_API_KEY.to_string()),
        }
    }
}
