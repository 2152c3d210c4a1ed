use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use runnel_core::{
    resolve_logs_dir, AgentStore, ConfigStore, EventBus, SessionStore, WorkspacePaths,
    DEFAULT_HOST, DEFAULT_PORT,
};
use runnel_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use runnel_runner::Runner;
use runnel_server::{serve, AppState};
use runnel_types::RunRequest;
use serde_json::{Map, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "runnel-engine")]
#[command(about = "HTTP and MCP gateway around a local AI assistant CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Workspace root the CLI runs in. Defaults to RUNNEL_WORKSPACE
        /// or the current directory.
        #[arg(long)]
        workspace: Option<String>,
        /// Settings file handed to the CLI via --settings.
        #[arg(long)]
        settings: Option<String>,
        /// MCP config file handed to the CLI via --mcp-config.
        #[arg(long)]
        mcp_config: Option<String>,
        /// Path or name of the assistant CLI binary.
        #[arg(long)]
        cli_bin: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Expose the gateway as MCP tools over stdio.
    Mcp {
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long)]
        settings: Option<String>,
        #[arg(long)]
        mcp_config: Option<String>,
    },
    /// One-shot buffered run; prints the outcome text.
    Run {
        prompt: String,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value_t = false)]
        auto_resume: bool,
        #[arg(long)]
        workspace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            workspace,
            settings,
            mcp_config,
            cli_bin,
            timeout_ms,
        } => {
            let logs_dir = resolve_logs_dir();
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    agent: None,
                    session_id: None,
                    run_id: None,
                    status: Some("ok"),
                    error_code: None,
                    detail: Some("engine jsonl logging initialized"),
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let overrides = build_cli_overrides(settings, mcp_config, cli_bin, timeout_ms);
            let paths = WorkspacePaths::resolve(workspace.as_deref());
            let config = ConfigStore::new(paths.project_config_file(), overrides).await?;
            let state = AppState::new(config, paths);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            serve(addr, state).await?;
        }
        Command::Mcp {
            workspace,
            settings,
            mcp_config,
        } => {
            // stdout carries JSON-RPC; logging stays on stderr + files
            let logs_dir = resolve_logs_dir();
            let (_log_guard, _log_info) = init_process_logging(ProcessKind::Mcp, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Mcp,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "mcp.main",
                    agent: None,
                    session_id: None,
                    run_id: None,
                    status: Some("ok"),
                    error_code: None,
                    detail: Some("mcp jsonl logging initialized"),
                },
            );

            let overrides = build_cli_overrides(settings, mcp_config, None, None);
            let paths = WorkspacePaths::resolve(workspace.as_deref());
            let config = ConfigStore::new(paths.project_config_file(), overrides).await?;
            let sessions = SessionStore::new(paths.sessions_file());
            let runner = Runner::new(
                config,
                paths.clone(),
                sessions.clone(),
                EventBus::new(),
            );
            let server =
                runnel_mcp::GatewayServer::new(runner, AgentStore::new(paths), sessions);
            runnel_mcp::serve_stdio(server).await?;
        }
        Command::Run {
            prompt,
            agent,
            session,
            auto_resume,
            workspace,
        } => {
            let paths = WorkspacePaths::resolve(workspace.as_deref());
            let config = ConfigStore::new(paths.project_config_file(), None).await?;
            let sessions = SessionStore::new(paths.sessions_file());
            let runner = Runner::new(config, paths, sessions, EventBus::new());

            let mut req = RunRequest::new(prompt);
            req.agent_name = agent;
            req.session_id = session;
            req.auto_resume = auto_resume;

            let outcome = runner.run(req).await?;
            println!("{}", outcome.text);
            if let Some(session_id) = outcome.session_id {
                eprintln!("session: {session_id}");
            }
        }
    }

    Ok(())
}

/// Flags become the highest-precedence config layer.
fn build_cli_overrides(
    settings: Option<String>,
    mcp_config: Option<String>,
    cli_bin: Option<String>,
    timeout_ms: Option<u64>,
) -> Option<Value> {
    let mut cli = Map::new();
    if let Some(settings) = settings.filter(|v| !v.trim().is_empty()) {
        cli.insert("settings_path".to_string(), Value::String(settings));
    }
    if let Some(mcp_config) = mcp_config.filter(|v| !v.trim().is_empty()) {
        cli.insert("mcp_config_path".to_string(), Value::String(mcp_config));
    }
    if let Some(bin) = cli_bin.filter(|v| !v.trim().is_empty()) {
        cli.insert("bin".to_string(), Value::String(bin));
    }

    let mut root = Map::new();
    if !cli.is_empty() {
        root.insert("cli".to_string(), Value::Object(cli));
    }
    if let Some(ms) = timeout_ms {
        root.insert("timeout_ms".to_string(), Value::Number(ms.into()));
    }
    if root.is_empty() {
        None
    } else {
        Some(Value::Object(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_means_no_override_layer() {
        assert!(build_cli_overrides(None, None, None, None).is_none());
    }

    #[test]
    fn flags_land_in_the_cli_layer() {
        let overrides = build_cli_overrides(
            Some(".claude/settings.json".to_string()),
            None,
            Some("/usr/local/bin/claude".to_string()),
            Some(60_000),
        )
        .expect("overrides");
        assert_eq!(overrides["cli"]["settings_path"], ".claude/settings.json");
        assert_eq!(overrides["cli"]["bin"], "/usr/local/bin/claude");
        assert_eq!(overrides["timeout_ms"], 60_000);
        assert!(overrides["cli"].get("mcp_config_path").is_none());
    }

    #[test]
    fn blank_flag_values_are_ignored() {
        let overrides = build_cli_overrides(Some("  ".to_string()), None, None, Some(5));
        let overrides = overrides.expect("timeout still present");
        assert!(overrides.get("cli").is_none());
        assert_eq!(overrides["timeout_ms"], 5);
    }
}
