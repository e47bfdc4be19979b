//! Session state for one supervised toolchain server process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Lifecycle of a supervised session.
///
/// `Unstarted → Starting → Running → Stopping → Stopped`, with
/// `Running → Crashed` on unexpected exit. A crashed session only comes
/// back through an explicit restart, which produces a new [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// The process exited without a stop request.
    Crashed,
}

impl Lifecycle {
    /// Terminal states: the process has been reaped.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

/// Immutable spawn settings for one session, snapshotted at start.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Toolchain binary to launch.
    pub binary: PathBuf,
    /// Arguments for the long-lived server subcommand.
    pub args: Vec<String>,
    /// Working directory; unset when no workspace root is known.
    pub working_directory: Option<PathBuf>,
    /// Grace period between stop request and SIGKILL.
    pub terminate_timeout: Duration,
}

impl SessionConfig {
    /// Spawn settings for the long-lived `lsp` server subcommand.
    pub fn server(
        binary: PathBuf,
        working_directory: Option<PathBuf>,
        terminate_timeout: Duration,
    ) -> Self {
        Self {
            binary,
            args: vec!["lsp".to_string()],
            working_directory,
            terminate_timeout,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::server(PathBuf::from("zc"), None, Duration::from_secs(5))
    }
}

/// One lifecycle instance of the supervised server process.
///
/// The process handle itself is owned by the supervisor's exit-monitor
/// task; a `Session` carries everything callers may touch: the stdin
/// channel, the lifecycle watch, and bookkeeping.
#[derive(Debug)]
pub struct Session {
    /// Unique identifier for this session.
    pub id: String,
    /// Settings the process was spawned with.
    pub config: SessionConfig,
    /// OS process id, for diagnostics.
    pub pid: Option<u32>,
    /// How many times this logical session has been restarted.
    pub restart_count: u32,
    pub(crate) started_at: Instant,
    pub(crate) stdin_tx: mpsc::Sender<String>,
    pub(crate) state: Arc<watch::Sender<Lifecycle>>,
    pub(crate) stop_tx: watch::Sender<bool>,
}

impl Session {
    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<Lifecycle> {
        self.state.subscribe()
    }

    /// Sender for lines queued to the process stdin.
    pub fn stdin(&self) -> mpsc::Sender<String> {
        self.stdin_tx.clone()
    }

    /// Time since the process was spawned.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
