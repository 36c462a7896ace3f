use agent_runtime::agent::{AgentRuntime, AgentSettings};
use agent_runtime::cli::Cli;
use agent_runtime::config;
use agent_runtime::llm::openrouter::OpenRouterLlm;
use agent_runtime::rpc::RpcServer;
use agent_runtime::runtime::{ProtocolRuntime, RuntimeSettings};
use agent_runtime::sandbox::Workspace;
use agent_runtime::store::FileSessionStore;
use agent_runtime::tool_collection::ToolCollection;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries protocol frames only.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = config::config_path(cli.config.as_deref())?;
    let mut config = config::load_or_create(&config_path)?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }

    let workspace = Workspace::new(&cli.project_root)
        .with_context(|| format!("invalid project root {}", cli.project_root.display()))?;
    let root = workspace.root().to_path_buf();
    info!(root = %root.display(), backend = ?config.backend, model = %config.model, "starting");

    let store = Arc::new(FileSessionStore::new(&root, config.state_dir(&root)));
    let tools = Arc::new(ToolCollection::with_default_tools(workspace));
    let llm = Arc::new(OpenRouterLlm::new(&config));
    let agent = Arc::new(AgentRuntime::new(
        llm,
        store.clone(),
        tools,
        AgentSettings::from_config(&config),
    ));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let runtime = ProtocolRuntime::new(agent, store, RuntimeSettings::from_config(&config), Some(events_tx));

    let stdin = BufReader::new(tokio::io::stdin());
    RpcServer::new(runtime)
        .serve(stdin, tokio::io::stdout(), Some(events_rx))
        .await?;
    info!("stdin closed, exiting");
    Ok(())
}
