use crate::backend::Backend;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_ENV_VAR: &str = "AGENT_RUNTIME_CONFIG";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    /// Empty means the backend's default URL.
    pub base_url: String,
    /// Model used when a session does not name one.
    pub model: String,
    /// Additional model ids advertised by `list_models`.
    pub models: Vec<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub agent: AgentConfig,
    pub verify: VerifyConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub history_limit: usize,
    pub repair_attempts: usize,
    /// Empty means the built-in prompt.
    pub system_prompt: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VerifyConfig {
    pub commands: Vec<String>,
    pub timeout_seconds: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub run_retention: usize,
    /// Relative paths are taken from the project root.
    pub state_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            base_url: String::new(),
            model: "google/gemini-2.5-flash".to_string(),
            models: Vec::new(),
            timeout_seconds: 120,
            max_retries: 2,
            agent: AgentConfig::default(),
            verify: VerifyConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 8,
            history_limit: 24,
            repair_attempts: 6,
            system_prompt: String::new(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_seconds: 120,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_retention: 256,
            state_dir: ".agent-runtime".to_string(),
        }
    }
}

impl Config {
    pub fn base_url(&self) -> String {
        if self.base_url.trim().is_empty() {
            self.backend.config().base_url
        } else {
            self.base_url.clone()
        }
    }

    pub fn state_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.runtime.state_dir)
    }
}

/// Picks the config file: explicit path, then the environment, then XDG.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let xdg_dirs = xdg::BaseDirectories::new();
    Ok(xdg_dirs.place_config_file("agent-runtime/config.toml")?)
}

/// Loads the config at `path`, writing a default one first if it does not exist.
/// Zero or empty values fall back to their defaults.
pub fn load_or_create(path: &Path) -> Result<Config> {
    if !path.exists() {
        let default_config = Config::default();
        let toml_string = toml::to_string_pretty(&default_config)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml_string)?;
        info!(path = %path.display(), "created default config");
        return Ok(default_config);
    }

    let config_string = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: Config = toml::from_str(&config_string)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(fill_defaults(config))
}

fn fill_defaults(mut config: Config) -> Config {
    let defaults = Config::default();
    if config.model.is_empty() {
        config.model = defaults.model;
    }
    if config.timeout_seconds == 0 {
        config.timeout_seconds = defaults.timeout_seconds;
    }
    if config.agent.max_steps == 0 {
        config.agent.max_steps = defaults.agent.max_steps;
    }
    if config.agent.history_limit == 0 {
        config.agent.history_limit = defaults.agent.history_limit;
    }
    if config.verify.timeout_seconds == 0 {
        config.verify.timeout_seconds = defaults.verify.timeout_seconds;
    }
    if config.runtime.run_retention == 0 {
        config.runtime.run_retention = defaults.runtime.run_retention;
    }
    if config.runtime.state_dir.is_empty() {
        config.runtime.state_dir = defaults.runtime.state_dir;
    }
    config
}
