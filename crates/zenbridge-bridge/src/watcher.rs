//! Source-file change forwarding.
//!
//! Watches the workspace root for changes to the toolchain's source
//! extension and forwards each batch to the live session as a
//! `workspace/didChangeWatchedFiles` notification. This is a passive
//! sink: watch errors degrade to a logged warning, never a crash.

use std::path::Path;
use std::sync::Arc;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use zenbridge_core::protocol::Notification;

use crate::multiplexer::StreamMultiplexer;

/// Forwards matching file events to a session for as long as both the
/// watcher and the session live.
pub struct SourceWatcher {
    /// Held for its side effect: dropping it stops the OS watch.
    _watcher: RecommendedWatcher,
}

impl SourceWatcher {
    /// Watch `root` recursively and forward changed `.{extension}` paths
    /// through `mux`.
    pub fn spawn(
        root: &Path,
        extension: &str,
        mux: Arc<StreamMultiplexer>,
    ) -> notify::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // notify's callback runs on its own thread; hop onto the runtime
        // through an unbounded channel.
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| {
                let _ = tx.send(result);
            })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let extension = extension.to_string();
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(event) => {
                        let changed: Vec<String> = event
                            .paths
                            .iter()
                            .filter(|p| {
                                p.extension().is_some_and(|e| e == extension.as_str())
                            })
                            .map(|p| p.display().to_string())
                            .collect();
                        if changed.is_empty() {
                            continue;
                        }

                        debug!(?changed, "Forwarding source-file changes");
                        let notification = Notification {
                            method: "workspace/didChangeWatchedFiles".to_string(),
                            params: json!({ "changes": changed }),
                        };
                        if mux.send(&notification).await.is_err() {
                            debug!("Session stream closed, stopping watch forwarding");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "File watch error"),
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}
