//! zenbridge Bridge
//!
//! Supervises the Zen-C toolchain server (`zc lsp`) and exposes the
//! editor-facing command surface (run, build, restart) over its own
//! stdin, one command per line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use zenbridge_bridge::bridge::{Bridge, ConfigLoader};
use zenbridge_core::config;

#[derive(Parser, Debug)]
#[command(name = "zenbridge-bridge")]
#[command(version, about = "zenbridge - Zen-C toolchain supervisor and protocol bridge")]
struct Args {
    /// Path to the Zen-C toolchain binary
    #[arg(long, env = "ZENBRIDGE_BINARY")]
    binary: Option<PathBuf>,

    /// Workspace root, used as the server's working directory
    #[arg(long, env = "ZENBRIDGE_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Compiler forwarded to run/build via --cc
    #[arg(long = "cc", env = "ZENBRIDGE_CC")]
    compiler: Option<String>,

    /// Seconds to wait for graceful server shutdown before SIGKILL
    #[arg(long, env = "ZENBRIDGE_TERMINATE_TIMEOUT")]
    terminate_timeout: Option<u64>,

    /// Log level filter for the bridge (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "ZENBRIDGE_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "ZENBRIDGE_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// CLI flags are the top of the configuration hierarchy.
    fn config_loader(&self) -> ConfigLoader {
        let binary = self.binary.clone();
        let workspace_root = self.workspace_root.clone();
        let compiler = self.compiler.clone();
        let terminate_timeout = self.terminate_timeout;

        Box::new(move || {
            let mut cfg = config::load_config(workspace_root.as_deref())?;
            if let Some(binary) = &binary {
                cfg.toolchain.binary.clone_from(binary);
            }
            if workspace_root.is_some() {
                cfg.toolchain.workspace_root.clone_from(&workspace_root);
            }
            if let Some(compiler) = &compiler {
                cfg.toolchain.compiler.clone_from(compiler);
            }
            if let Some(secs) = terminate_timeout {
                cfg.bridge.terminate_timeout_secs = secs;
            }
            Ok(cfg)
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("zenbridge_bridge={0},zenbridge_core={0}", args.log_level);
    zenbridge_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        binary = ?args.binary,
        workspace_root = ?args.workspace_root,
        "Starting zenbridge-bridge"
    );

    let bridge = Arc::new(Bridge::new(args.config_loader()));
    bridge.start().await?;

    // Surface crashes; relaunching stays an explicit `restart` command.
    let mut crash_rx = bridge.subscribe_crashes();
    tokio::spawn(async move {
        while let Ok(report) = crash_rx.recv().await {
            warn!(
                session_id = %report.session_id,
                exit_code = ?report.exit_code,
                "Toolchain server crashed; send `restart` to relaunch"
            );
        }
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the bridge is ready (unix only). The `true`
    // parameter unsets $NOTIFY_SOCKET so the toolchain subprocesses don't
    // accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    info!("Bridge ready, reading control commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_command(&bridge, line.trim()).await,
                Ok(None) => {
                    info!("stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read control command");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break;
            }
            _ = sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                break;
            }
        }
    }

    bridge.stop().await?;
    info!("Bridge stopped");
    Ok(())
}

/// Dispatch one control line: `run [path]`, `build [path]`, `restart`,
/// `status`.
async fn handle_command(bridge: &Bridge, line: &str) {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return;
    };

    match command {
        "restart" | "restart-language-server" => {
            if let Err(e) = bridge.restart().await {
                error!(error = %e, "Restart failed");
            }
        }
        "run" | "build" => {
            let path = parts.next().map(PathBuf::from);
            if let Err(e) = bridge.execute(command, path).await {
                error!(command, error = %e, "Command failed");
            }
        }
        "status" => {
            info!(
                state = ?bridge.state().await,
                session_id = ?bridge.session_id().await,
                "Bridge status"
            );
        }
        "ping" => match bridge
            .request("ping", serde_json::Value::Null, Duration::from_secs(5))
            .await
        {
            Ok(response) => info!(id = response.id, "Server answered ping"),
            Err(e) => warn!(error = %e, "Ping failed"),
        },
        other => warn!(command = other, "Unknown control command"),
    }
}
