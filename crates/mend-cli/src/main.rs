//! mend - an autonomous coding agent for your terminal
//!
//! Usage:
//!   mend ["task description"]    Start a session, optionally seeding a task
//!
//! The agent works in the current git checkout: it converses over tools
//! (shell, patch, keyword search, code review), commits its work, and
//! serves an HTTP control plane for observers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mend_agent::{Agent, CodingAgent};
use mend_core::{AgentConfig, Budget};
use mend_llm::AnthropicService;
use mend_review::git::current_commit;
use mend_review::{GitCommand, GitExecutor};
use mend_tools::registry::RegistryOptions;
use mend_tui::TermUI;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mend")]
#[command(author, version, about = "Autonomous coding agent")]
struct Cli {
    /// Initial task for the agent; without it, the session starts idle
    task: Option<String>,

    /// Working directory (defaults to the current directory)
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Model to use
    #[arg(long, default_value = "claude-sonnet-4-20250514")]
    model: String,

    /// Address for the HTTP control plane
    #[arg(long, default_value = "127.0.0.1:0")]
    addr: String,

    /// Maximum number of model responses (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_responses: u64,

    /// Maximum wall time in minutes (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_wall_time: u64,

    /// Maximum spend in dollars (0 = unlimited)
    #[arg(long, default_value = "10.0")]
    max_dollars: f64,

    /// Run headless, without the terminal UI
    #[arg(long)]
    no_tui: bool,

    /// Session identifier (defaults to a fresh UUID)
    #[arg(long)]
    session_id: Option<String>,

    /// Disable just-in-time installation of missing binaries
    #[arg(long)]
    no_jit_install: bool,
}

fn init_logging(log_path: &PathBuf) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open session log {}", log_path.display()))?;
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(Arc::new(file))
        .with_ansi(false);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(file_layer)
        .try_init()
        .ok();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .context("ANTHROPIC_API_KEY is not set; the agent needs a model to talk to")?;

    // The agent only operates inside a git checkout.
    let git = GitCommand::detect(&cli.dir)
        .await
        .context("mend must be started inside a git repository")?;
    let repo_root = git.repo_root().clone();
    let git: Arc<dyn GitExecutor> = Arc::new(git);
    let initial_commit = current_commit(git.as_ref())
        .await
        .context("failed to resolve HEAD; make an initial commit first")?;

    let session_id = cli
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // One JSON-lines log file per session.
    let log_dir = repo_root.join(".mend");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let log_path = log_dir.join(format!("{session_id}.log"));
    init_logging(&log_path)?;
    info!(session = %session_id, repo = %repo_root.display(), "session starting");

    let mut config = AgentConfig::new(repo_root.clone(), session_id);
    config.model = cli.model.clone();
    config.budget = Budget {
        max_responses: cli.max_responses,
        max_wall_time: Duration::from_secs(cli.max_wall_time * 60),
        max_dollars: cli.max_dollars,
    };

    let service = Arc::new(AnthropicService::new(api_key, cli.model.clone()));
    let registry_opts = RegistryOptions {
        check_permission: None,
        timeouts: Some(config.timeouts),
        enable_jit_install: !cli.no_jit_install,
    };
    let agent = Agent::new(config, initial_commit, service, git, registry_opts);

    // The HTTP control plane binds first so the UI can show its URL.
    let listener = tokio::net::TcpListener::bind(&cli.addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.addr))?;
    let local_addr = listener.local_addr()?;
    let http_url = format!("http://{local_addr}");
    let server_agent: Arc<dyn CodingAgent> = agent.clone();
    tokio::spawn(async move {
        if let Err(e) = mend_server::serve_on(listener, server_agent).await {
            tracing::error!(error = %e, "control plane exited");
        }
    });

    agent.port_monitor().start().ok();

    let shutdown = CancellationToken::new();
    let agent_task = tokio::spawn(agent.clone().run(shutdown.clone()));

    if let Some(task) = &cli.task {
        agent.user_message(task.clone());
    }

    if cli.no_tui {
        if cli.task.is_none() {
            bail!("--no-tui requires a task argument");
        }
        wait_for_end_of_turn(agent.as_ref()).await;
    } else {
        let ui = TermUI::new(agent.clone(), http_url);
        ui.run(shutdown.clone()).await?;
    }

    shutdown.cancel();
    let _ = agent_task.await;
    info!("session finished");
    Ok(())
}

/// Headless mode: block until the first end-of-turn message.
async fn wait_for_end_of_turn(agent: &dyn CodingAgent) {
    let mut iter = agent.new_iterator(0);
    while let Some(msg) = iter.next().await {
        if msg.end_of_turn {
            break;
        }
    }
}
