use crate::backend::Backend;
use clap::Parser;
use std::path::PathBuf;

/// Local coding agent speaking JSON-RPC over stdio
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Workspace the agent may read and modify
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,

    /// Config file; defaults to $AGENT_RUNTIME_CONFIG or the XDG config dir
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides the configured backend
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Overrides the configured default model
    #[arg(long)]
    pub model: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["agent-runtime"]);
        assert_eq!(cli.project_root, PathBuf::from("."));
        assert_eq!(cli.log_level, "warn");
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "agent-runtime",
            "--project-root",
            "/tmp/ws",
            "--backend",
            "ollama",
            "--model",
            "qwen3",
        ]);
        assert_eq!(cli.backend, Some(Backend::Ollama));
        assert_eq!(cli.model.as_deref(), Some("qwen3"));
    }
}
