use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use cadre_agents::AgentLaunchSpec;
use cadre_observability::{init_engine_logging, LoggingOptions};
use cadre_server::{serve, AppState, AppStateOptions};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cadre-engine")]
#[command(about = "Headless multi-agent orchestration backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine HTTP/WebSocket server.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        /// Project tree the code runner and skills are scoped to.
        #[arg(long)]
        project_root: Option<String>,
        /// Agent binary spawned per thread; omit to run threads detached.
        #[arg(long, env = "CADRE_AGENT_PROGRAM")]
        agent_program: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            project_root,
            agent_program,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = cadre_observability::canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_engine_logging(&LoggingOptions {
                logs_dir,
                retention_days: 14,
            })?;
            if log_info.pruned_files > 0 {
                info!(pruned = log_info.pruned_files, "pruned stale engine logs");
            }

            let project_root = project_root
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
            let db_path = std::env::var("CADRE_DB_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| state_dir.join("cadre.db"));

            let agent_launch = agent_program.map(|program| AgentLaunchSpec {
                program,
                args: vec!["serve".to_string()],
                cwd: Some(project_root.clone()),
                env: Default::default(),
            });

            let options = AppStateOptions {
                state_dir: state_dir.clone(),
                db_path,
                workspace_root_dir: state_dir.join("workspaces"),
                project_root: project_root.clone(),
                user_config_path: cadre_core::default_user_config_path(),
                workspace_config_path: Some(cadre_core::workspace_config_path(&project_root)),
                agent_launch,
            };
            let state = AppState::build(options).await?;

            let shutdown = state.shutdown.clone();
            let manager = state.manager.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    manager.stop_all().await;
                    shutdown.cancel();
                }
            });

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup(&state_dir, &project_root, &addr);
            serve(addr, state).await?;
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("CADRE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".cadre")
}

fn log_startup(state_dir: &PathBuf, project_root: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!(
        state_dir = %state_dir.display(),
        project_root = %project_root.display(),
        exe = %exe.display(),
        %addr,
        "starting cadre engine"
    );
}
