//! Toolchain server lifecycle supervisor.
//!
//! Spawns the server with piped stdio, monitors its exit asynchronously,
//! and terminates it gracefully: stdin closed first, SIGINT, then SIGKILL
//! after a bounded grace period. Unexpected exit is a state transition to
//! `Crashed` plus exactly one crash notification; respawn policy belongs
//! to the bridge, not here.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::session::{Lifecycle, Session, SessionConfig};

/// Emitted once when a session's process exits without a stop request.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub session_id: String,
    pub exit_code: Option<i32>,
}

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn toolchain server: {reason}")]
    SpawnFailed { reason: String },
}

/// Supervisor for the toolchain server subprocess.
///
/// All `start`/`stop`/`restart` transitions are serialized by an internal
/// lock, so a restart can never leave two live processes behind.
pub struct ProcessSupervisor {
    transitions: Mutex<()>,
    crash_tx: broadcast::Sender<CrashReport>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        let (crash_tx, _) = broadcast::channel(16);
        Self {
            transitions: Mutex::new(()),
            crash_tx,
        }
    }

    /// Subscribe to crash notifications. One report per crashed session.
    pub fn subscribe_crashes(&self) -> broadcast::Receiver<CrashReport> {
        self.crash_tx.subscribe()
    }

    /// Spawn the server and wire up its stdio.
    ///
    /// Raw stdout lines are forwarded through `stdout_tx`; stderr is
    /// drained to the log.
    pub async fn start(
        &self,
        config: SessionConfig,
        stdout_tx: mpsc::Sender<String>,
    ) -> Result<Arc<Session>, SupervisorError> {
        let _guard = self.transitions.lock().await;
        self.spawn_locked(config, stdout_tx, 0)
    }

    /// Request graceful termination and wait until the process is reaped.
    ///
    /// Idempotent: stopping an already-terminal session is a no-op. The
    /// wait is bounded by the session's grace period, enforced by the exit
    /// monitor.
    pub async fn stop(&self, session: &Session) -> Result<(), SupervisorError> {
        let _guard = self.transitions.lock().await;
        Self::stop_locked(session).await;
        Ok(())
    }

    /// Stop `session` and start a fresh one with `config`.
    ///
    /// Both halves run under the transition lock: the old process is fully
    /// reaped before the new one is spawned, so at no instant are two
    /// server processes alive.
    pub async fn restart(
        &self,
        session: &Session,
        config: SessionConfig,
        stdout_tx: mpsc::Sender<String>,
    ) -> Result<Arc<Session>, SupervisorError> {
        let _guard = self.transitions.lock().await;
        Self::stop_locked(session).await;
        self.spawn_locked(config, stdout_tx, session.restart_count + 1)
    }

    async fn stop_locked(session: &Session) {
        if session.state().is_terminal() {
            debug!(session_id = %session.id, "Session already stopped");
            return;
        }

        session.state.send_replace(Lifecycle::Stopping);
        session.stop_tx.send_replace(true);

        let mut state_rx = session.subscribe_state();
        let _ = state_rx.wait_for(|s| s.is_terminal()).await;
        info!(session_id = %session.id, uptime = ?session.uptime(), "Session stopped");
    }

    #[allow(clippy::too_many_lines)]
    fn spawn_locked(
        &self,
        config: SessionConfig,
        stdout_tx: mpsc::Sender<String>,
        restart_count: u32,
    ) -> Result<Arc<Session>, SupervisorError> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let (state_tx, _) = watch::channel(Lifecycle::Starting);
        let state = Arc::new(state_tx);
        let (stop_tx, _) = watch::channel(false);

        let mut cmd = Command::new(&config.binary);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_directory {
            cmd.current_dir(dir);
        }

        info!(
            session_id = %session_id,
            binary = %config.binary.display(),
            args = ?config.args,
            working_dir = ?config.working_directory,
            restart_count,
            "Spawning toolchain server"
        );
        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::SpawnFailed {
                reason: "Failed to capture stdin".to_string(),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        let pid = child.id();
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);

        // Stdin writer task. Ends when either the channel closes or a stop
        // is requested, dropping the pipe so the server sees EOF.
        let mut stop_rx_writer = stop_tx.subscribe();
        tokio::spawn(async move {
            let mut stdin = stdin;
            loop {
                tokio::select! {
                    line = stdin_rx.recv() => {
                        let Some(line) = line else { break };
                        if let Err(e) = stdin.write_all(line.as_bytes()).await {
                            error!("Failed to write to stdin: {}", e);
                            break;
                        }
                        if let Err(e) = stdin.write_all(b"\n").await {
                            error!("Failed to write newline: {}", e);
                            break;
                        }
                        if let Err(e) = stdin.flush().await {
                            error!("Failed to flush stdin: {}", e);
                            break;
                        }
                    }
                    _ = stop_rx_writer.changed() => break,
                }
            }
        });

        // Stdout reader task.
        let sid = session_id.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session_id = %sid, "stdout: {}", line);
                if stdout_tx.send(line).await.is_err() {
                    warn!(session_id = %sid, "stdout channel closed");
                    break;
                }
            }
            info!(session_id = %sid, "stdout reader finished");
        });

        // Stderr reader for diagnostics.
        if let Some(stderr) = child.stderr.take() {
            let sid_err = session_id.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(session_id = %sid_err, "stderr: {}", line);
                }
                debug!(session_id = %sid_err, "stderr reader finished");
            });
        }

        // Exit monitor: owns the child. Either the process exits on its
        // own (crash, unless a stop raced in) or a stop request arrives
        // and the monitor escalates SIGINT then SIGKILL within the grace
        // period. Only this task reports the terminal state, so a crash
        // produces exactly one notification.
        let monitor_state = Arc::clone(&state);
        let mut stop_rx_monitor = stop_tx.subscribe();
        let crash_tx = self.crash_tx.clone();
        let sid_monitor = session_id.clone();
        let grace = config.terminate_timeout;
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let stop_requested = *stop_rx_monitor.borrow();
                    match status {
                        Ok(status) if stop_requested => {
                            info!(session_id = %sid_monitor, ?status, "Server exited during stop");
                            monitor_state.send_replace(Lifecycle::Stopped);
                        }
                        Ok(status) => {
                            warn!(session_id = %sid_monitor, ?status, "Server exited unexpectedly");
                            monitor_state.send_replace(Lifecycle::Crashed);
                            let _ = crash_tx.send(CrashReport {
                                session_id: sid_monitor,
                                exit_code: status.code(),
                            });
                        }
                        Err(e) => {
                            error!(session_id = %sid_monitor, error = %e, "Error waiting for server");
                            monitor_state.send_replace(Lifecycle::Crashed);
                            let _ = crash_tx.send(CrashReport {
                                session_id: sid_monitor,
                                exit_code: None,
                            });
                        }
                    }
                }
                _ = stop_rx_monitor.changed() => {
                    #[cfg(unix)]
                    if let Some(pid) = child.id() {
                        // SAFETY: pid is a valid process ID obtained from our own
                        // Child handle. kill(2) with SIGINT is safe to call on any
                        // owned subprocess.
                        #[allow(unsafe_code)]
                        #[allow(clippy::cast_possible_wrap)]
                        let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
                        if ret != 0 {
                            let err = std::io::Error::last_os_error();
                            warn!(session_id = %sid_monitor, pid, error = %err, "Failed to send SIGINT");
                        }
                    }

                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(Ok(status)) => {
                            info!(session_id = %sid_monitor, ?status, "Server exited gracefully");
                        }
                        Ok(Err(e)) => {
                            warn!(session_id = %sid_monitor, error = %e, "Error waiting for server, killing");
                            child.kill().await.ok();
                        }
                        Err(_) => {
                            warn!(session_id = %sid_monitor, "Timeout waiting for graceful shutdown, killing");
                            child.kill().await.ok();
                        }
                    }
                    monitor_state.send_replace(Lifecycle::Stopped);
                }
            }
        });

        state.send_replace(Lifecycle::Running);

        Ok(Arc::new(Session {
            id: session_id,
            config,
            pid,
            restart_count,
            started_at: Instant::now(),
            stdin_tx,
            state,
            stop_tx,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn quiet_config(binary: &str, args: &[&str]) -> SessionConfig {
        SessionConfig {
            binary: PathBuf::from(binary),
            args: args.iter().map(|s| (*s).to_string()).collect(),
            working_directory: None,
            terminate_timeout: Duration::from_secs(2),
        }
    }

    /// Signal-0 probe for process liveness.
    fn process_alive(pid: u32) -> bool {
        // SAFETY: signal 0 performs no action, it only checks that the
        // process exists and we may signal it.
        #[allow(unsafe_code)]
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, 0) == 0
        }
    }

    async fn wait_for_state(session: &Session, want: Lifecycle) {
        let mut rx = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let supervisor = ProcessSupervisor::new();
        let (tx, _rx) = mpsc::channel(8);
        let result = supervisor
            .start(quiet_config("/nonexistent/zc-binary", &[]), tx)
            .await;
        assert!(matches!(result, Err(SupervisorError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn start_then_stop_leaves_no_live_process() {
        let supervisor = ProcessSupervisor::new();
        let (tx, _rx) = mpsc::channel(8);
        let session = supervisor.start(quiet_config("cat", &[]), tx).await.unwrap();
        assert_eq!(session.state(), Lifecycle::Running);
        let pid = session.pid.unwrap();
        assert!(process_alive(pid));

        supervisor.stop(&session).await.unwrap();
        assert_eq!(session.state(), Lifecycle::Stopped);
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let supervisor = ProcessSupervisor::new();
        let (tx, _rx) = mpsc::channel(8);
        let session = supervisor.start(quiet_config("cat", &[]), tx).await.unwrap();

        supervisor.stop(&session).await.unwrap();
        supervisor.stop(&session).await.unwrap();
        assert_eq!(session.state(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn self_exit_transitions_to_crashed_with_one_report() {
        let supervisor = ProcessSupervisor::new();
        let mut crashes = supervisor.subscribe_crashes();
        let (tx, _rx) = mpsc::channel(8);
        let session = supervisor
            .start(quiet_config("sh", &["-c", "exit 3"]), tx)
            .await
            .unwrap();

        wait_for_state(&session, Lifecycle::Crashed).await;

        let report = tokio::time::timeout(Duration::from_secs(2), crashes.recv())
            .await
            .expect("no crash report")
            .unwrap();
        assert_eq!(report.session_id, session.id);
        assert_eq!(report.exit_code, Some(3));

        // Exactly one report, not one per stream read attempt.
        assert!(matches!(
            crashes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn out_of_band_kill_is_a_crash() {
        let supervisor = ProcessSupervisor::new();
        let mut crashes = supervisor.subscribe_crashes();
        let (tx, _rx) = mpsc::channel(8);
        let session = supervisor.start(quiet_config("cat", &[]), tx).await.unwrap();
        let pid = session.pid.unwrap();

        // SAFETY: pid belongs to the subprocess this test just spawned.
        #[allow(unsafe_code)]
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }

        wait_for_state(&session, Lifecycle::Crashed).await;
        let report = tokio::time::timeout(Duration::from_secs(2), crashes.recv())
            .await
            .expect("no crash report")
            .unwrap();
        assert_eq!(report.session_id, session.id);
        assert!(matches!(
            crashes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn stop_does_not_report_a_crash() {
        let supervisor = ProcessSupervisor::new();
        let mut crashes = supervisor.subscribe_crashes();
        let (tx, _rx) = mpsc::channel(8);
        let session = supervisor.start(quiet_config("cat", &[]), tx).await.unwrap();

        supervisor.stop(&session).await.unwrap();
        assert!(matches!(
            crashes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn restart_replaces_the_process_without_overlap() {
        let supervisor = ProcessSupervisor::new();
        let (tx, _rx) = mpsc::channel(8);
        let session = supervisor.start(quiet_config("cat", &[]), tx).await.unwrap();
        let old_pid = session.pid.unwrap();

        let (tx2, _rx2) = mpsc::channel(8);
        let new_session = supervisor
            .restart(&session, quiet_config("cat", &[]), tx2)
            .await
            .unwrap();

        // Old session fully reaped, new one live, lineage tracked.
        assert_eq!(session.state(), Lifecycle::Stopped);
        assert!(!process_alive(old_pid));
        assert_eq!(new_session.state(), Lifecycle::Running);
        assert!(process_alive(new_session.pid.unwrap()));
        assert_eq!(new_session.restart_count, 1);
        assert_ne!(new_session.id, session.id);

        supervisor.stop(&new_session).await.unwrap();
    }

    #[tokio::test]
    async fn sigint_ignoring_process_is_killed_within_grace() {
        let supervisor = ProcessSupervisor::new();
        let (tx, _rx) = mpsc::channel(8);
        let session = supervisor
            .start(quiet_config("sh", &["-c", "trap '' INT; sleep 600"]), tx)
            .await
            .unwrap();
        let pid = session.pid.unwrap();

        supervisor.stop(&session).await.unwrap();
        assert_eq!(session.state(), Lifecycle::Stopped);
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn stdout_lines_are_forwarded() {
        let supervisor = ProcessSupervisor::new();
        let (tx, mut rx) = mpsc::channel(8);
        let session = supervisor
            .start(quiet_config("sh", &["-c", "echo hello; sleep 600"]), tx)
            .await
            .unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no stdout line")
            .unwrap();
        assert_eq!(line, "hello");

        supervisor.stop(&session).await.unwrap();
    }

    #[tokio::test]
    async fn stdin_lines_reach_the_process() {
        let supervisor = ProcessSupervisor::new();
        let (tx, mut rx) = mpsc::channel(8);
        let session = supervisor.start(quiet_config("cat", &[]), tx).await.unwrap();

        session.stdin().send("ping".to_string()).await.unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no echoed line")
            .unwrap();
        assert_eq!(line, "ping");

        supervisor.stop(&session).await.unwrap();
    }
}
