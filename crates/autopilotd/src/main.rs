//! autopilotd - autonomous task control plane daemon.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use autopilotd::{default_db_path, Daemon, DaemonConfig, DEFAULT_PORT};
use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "autopilotd", about = "Autonomous task control plane daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database path
    #[arg(long, env = "AUTOPILOT_DB")]
    db: Option<PathBuf>,

    /// Bearer token required on every API request
    #[arg(long, env = "AUTOPILOT_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Tuning file (defaults to .autopilot/config in the workspace)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace root used to discover the tuning file
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig {
        db_path: cli.db.unwrap_or_else(default_db_path),
        port: cli.port,
        auth_token: cli.auth_token,
        config_path: cli.config,
        workspace_root: cli.workspace,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .wrap_err("failed to initialize daemon")?;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            let run = daemon.run();
            tokio::pin!(run);
            tokio::select! {
                result = &mut run => return result.wrap_err("daemon error"),
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                }
            }
            daemon.shutdown();
            run.await.wrap_err("daemon error")
        }

        #[cfg(not(unix))]
        {
            let run = daemon.run();
            tokio::pin!(run);
            tokio::select! {
                result = &mut run => return result.wrap_err("daemon error"),
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received Ctrl-C, initiating graceful shutdown");
                }
            }
            daemon.shutdown();
            run.await.wrap_err("daemon error")
        }
    })
}
