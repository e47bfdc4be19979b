//! Composition root binding supervisor, multiplexer, and facade.
//!
//! The bridge owns exactly one supervisor and one terminal-sink handle,
//! wires a multiplexer to each live session, and exposes the uniform
//! control surface (start/stop/restart/execute) to the embedding host.
//! Crash policy lives here: a `Crashed` session is surfaced to
//! subscribers, never silently respawned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, broadcast, mpsc};
use tracing::{info, warn};

use zenbridge_core::commands::builtin_commands;
use zenbridge_core::config::Config;
use zenbridge_core::protocol::{Notification, Response};

use crate::facade::{CommandFacade, FacadeError};
use crate::multiplexer::{MultiplexerConfig, MultiplexerError, StreamMultiplexer};
use crate::supervisor::{
    CrashReport, Lifecycle, ProcessSupervisor, Session, SessionConfig, SupervisorError,
};
use crate::terminal::{LogSink, TerminalSink};
use crate::watcher::SourceWatcher;

/// Resolves configuration; called once per session creation and again on
/// every explicit restart.
pub type ConfigLoader = Box<dyn Fn() -> zenbridge_core::Result<Config> + Send + Sync>;

/// Builds the terminal sink on first use.
pub type TerminalFactory = Box<dyn Fn() -> Arc<dyn TerminalSink> + Send + Sync>;

/// Errors surfaced through the bridge's control surface.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Command(#[from] FacadeError),

    #[error(transparent)]
    Multiplexer(#[from] MultiplexerError),

    #[error(transparent)]
    Core(#[from] zenbridge_core::Error),

    #[error("No running session")]
    NotRunning,
}

struct Live {
    session: Arc<Session>,
    mux: Arc<StreamMultiplexer>,
    config: Config,
    _watcher: Option<SourceWatcher>,
}

/// The bridge: one supervised server session plus the command facade.
pub struct Bridge {
    load_config: ConfigLoader,
    supervisor: ProcessSupervisor,
    terminal: OnceCell<Arc<dyn TerminalSink>>,
    terminal_factory: TerminalFactory,
    live: Mutex<Option<Live>>,
}

impl Bridge {
    /// Bridge whose terminal output goes to the log.
    pub fn new(load_config: ConfigLoader) -> Self {
        Self::with_terminal_factory(load_config, Box::new(|| Arc::new(LogSink)))
    }

    pub fn with_terminal_factory(load_config: ConfigLoader, factory: TerminalFactory) -> Self {
        Self {
            load_config,
            supervisor: ProcessSupervisor::new(),
            terminal: OnceCell::new(),
            terminal_factory: factory,
            live: Mutex::new(None),
        }
    }

    /// Resolve configuration and start the server session.
    ///
    /// A no-op when a session already exists; a crashed session only
    /// comes back through [`Bridge::restart`].
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut live = self.live.lock().await;
        if live.is_some() {
            info!("Session already exists, ignoring start");
            return Ok(());
        }

        let config = (self.load_config)()?;
        *live = Some(self.spawn_session(config).await?);
        Ok(())
    }

    /// Stop the live session, if any. Idempotent.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let mut live = self.live.lock().await;
        if let Some(old) = live.take() {
            self.supervisor.stop(&old.session).await?;
        }
        Ok(())
    }

    /// Stop, re-resolve configuration, start fresh.
    ///
    /// In-flight requests against the old session fail as the old stream
    /// closes; their correlation ids die with that process.
    pub async fn restart(&self) -> Result<(), BridgeError> {
        let config = (self.load_config)()?;
        let mut live = self.live.lock().await;

        if let Some(old) = live.take() {
            let session_config = Self::session_config(&config);
            let (lines_tx, lines_rx) = mpsc::channel(128);
            let session = self
                .supervisor
                .restart(&old.session, session_config, lines_tx)
                .await?;
            *live = Some(self.wire_session(session, lines_rx, config));
        } else {
            *live = Some(self.spawn_session(config).await?);
        }

        info!("Toolchain server restarted");
        Ok(())
    }

    /// Execute a named action (`run`, `build`) with an optional file path.
    ///
    /// Absent paths are typed absence: no argument is passed through.
    pub async fn execute(&self, name: &str, path: Option<PathBuf>) -> Result<(), BridgeError> {
        let toolchain = {
            let live = self.live.lock().await;
            live.as_ref().map(|l| l.config.toolchain.clone())
        };
        let toolchain = match toolchain {
            Some(t) => t,
            None => (self.load_config)()?.toolchain,
        };

        let terminal = self.terminal().await;
        let facade = CommandFacade::new(builtin_commands(), toolchain, terminal);
        facade.execute_with_path(name, path).await?;
        Ok(())
    }

    /// Issue a correlated request against the live session.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Response, BridgeError> {
        let mux = self.live_mux().await.ok_or(BridgeError::NotRunning)?;
        Ok(mux.request(method, params, timeout).await?)
    }

    /// Forward a notification to the live session.
    pub async fn notify(&self, notification: &Notification) -> Result<(), BridgeError> {
        let mux = self.live_mux().await.ok_or(BridgeError::NotRunning)?;
        Ok(mux.send(notification).await?)
    }

    /// Subscribe to unsolicited server notifications of the live session.
    pub async fn subscribe_notifications(
        &self,
    ) -> Result<broadcast::Receiver<Notification>, BridgeError> {
        let mux = self.live_mux().await.ok_or(BridgeError::NotRunning)?;
        Ok(mux.subscribe())
    }

    /// Crash notifications. The bridge surfaces these and leaves the
    /// restart decision to its caller.
    pub fn subscribe_crashes(&self) -> broadcast::Receiver<CrashReport> {
        self.supervisor.subscribe_crashes()
    }

    /// Lifecycle of the current session; `Unstarted` when none exists.
    pub async fn state(&self) -> Lifecycle {
        let live = self.live.lock().await;
        live.as_ref()
            .map_or(Lifecycle::Unstarted, |l| l.session.state())
    }

    /// Id of the current session, if any.
    pub async fn session_id(&self) -> Option<String> {
        let live = self.live.lock().await;
        live.as_ref().map(|l| l.session.id.clone())
    }

    async fn live_mux(&self) -> Option<Arc<StreamMultiplexer>> {
        let live = self.live.lock().await;
        live.as_ref().map(|l| Arc::clone(&l.mux))
    }

    async fn terminal(&self) -> Arc<dyn TerminalSink> {
        self.terminal
            .get_or_init(|| async { (self.terminal_factory)() })
            .await
            .clone()
    }

    fn session_config(config: &Config) -> SessionConfig {
        SessionConfig::server(
            config.toolchain.binary.clone(),
            config.toolchain.workspace_root.clone(),
            config.bridge.terminate_timeout(),
        )
    }

    async fn spawn_session(&self, config: Config) -> Result<Live, BridgeError> {
        let session_config = Self::session_config(&config);
        let (lines_tx, lines_rx) = mpsc::channel(128);
        let session = self.supervisor.start(session_config, lines_tx).await?;
        Ok(self.wire_session(session, lines_rx, config))
    }

    fn wire_session(
        &self,
        session: Arc<Session>,
        lines_rx: mpsc::Receiver<String>,
        config: Config,
    ) -> Live {
        let mux = Arc::new(StreamMultiplexer::attach(
            session.stdin(),
            lines_rx,
            &MultiplexerConfig::default(),
        ));

        let watcher = config.toolchain.workspace_root.as_ref().and_then(|root| {
            match SourceWatcher::spawn(root, &config.toolchain.source_extension, Arc::clone(&mux))
            {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, root = %root.display(), "Source watcher unavailable");
                    None
                }
            }
        });

        Live {
            session,
            mux,
            config,
            _watcher: watcher,
        }
    }
}
