//! Command facade: named, parameterized toolchain actions.
//!
//! Looks up a `CommandSpec`, formats the invocation (declarative flag
//! injection first, user positionals preserved) and either forwards the
//! line to the interactive terminal or runs a one-shot subprocess whose
//! output streams line-by-line to the same sink.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use zenbridge_core::commands::{CommandKind, CommandRegistry, CommandSpec};
use zenbridge_core::config::ToolchainConfig;

use crate::terminal::TerminalSink;

/// Errors from command execution.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    /// No spec registered under the requested name.
    #[error("Unknown command: {name}")]
    UnknownCommand { name: String },

    #[error("Failed to spawn `{invocation}`: {source}")]
    SpawnFailed {
        invocation: String,
        source: std::io::Error,
    },

    #[error("Failed to wait for `{invocation}`: {source}")]
    WaitFailed {
        invocation: String,
        source: std::io::Error,
    },
}

/// Executes named actions against the toolchain binary.
pub struct CommandFacade {
    registry: CommandRegistry,
    toolchain: ToolchainConfig,
    terminal: Arc<dyn TerminalSink>,
}

impl CommandFacade {
    pub fn new(
        registry: CommandRegistry,
        toolchain: ToolchainConfig,
        terminal: Arc<dyn TerminalSink>,
    ) -> Self {
        Self {
            registry,
            toolchain,
            terminal,
        }
    }

    /// Execute a named action with user-supplied arguments.
    pub async fn execute(&self, name: &str, args: &[String]) -> Result<(), FacadeError> {
        let spec = self
            .registry
            .get(name)
            .ok_or_else(|| FacadeError::UnknownCommand {
                name: name.to_string(),
            })?;

        let argv = spec.format_args(&self.toolchain.compiler, args);
        debug!(command = name, argv = ?argv, "Executing toolchain command");

        match spec.kind {
            CommandKind::Interactive => {
                self.terminal.write_line(&self.invocation_line(&argv));
                Ok(())
            }
            CommandKind::OneShot => self.run_one_shot(spec, &argv).await,
        }
    }

    /// Path-taking actions: a `None` path passes no argument through.
    pub async fn execute_with_path(
        &self,
        name: &str,
        path: Option<PathBuf>,
    ) -> Result<(), FacadeError> {
        let args = path
            .map(|p| vec![p.display().to_string()])
            .unwrap_or_default();
        self.execute(name, &args).await
    }

    fn invocation_line(&self, argv: &[String]) -> String {
        format!("{} {}", self.toolchain.binary.display(), argv.join(" "))
    }

    async fn run_one_shot(&self, spec: &CommandSpec, argv: &[String]) -> Result<(), FacadeError> {
        let invocation = self.invocation_line(argv);
        self.terminal.write_line(&format!("$ {invocation}"));

        let mut cmd = Command::new(&self.toolchain.binary);
        cmd.args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(root) = &self.toolchain.workspace_root {
            cmd.current_dir(root);
        }

        let mut child = cmd.spawn().map_err(|e| FacadeError::SpawnFailed {
            invocation: invocation.clone(),
            source: e,
        })?;

        let mut tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let sink = Arc::clone(&self.terminal);
            tasks.push(tokio::spawn(async move {
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.write_line(&line);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = Arc::clone(&self.terminal);
            tasks.push(tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.write_line(&line);
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }

        let status = child.wait().await.map_err(|e| FacadeError::WaitFailed {
            invocation: invocation.clone(),
            source: e,
        })?;

        info!(command = %spec.name, ?status, "Toolchain command finished");
        if !status.success() {
            self.terminal.write_line(&format!(
                "{} exited with code {}",
                spec.name,
                status.code().unwrap_or(-1)
            ));
        }

        Ok(())
    }
}
