//! Request/response multiplexing over the server's stdio streams.
//!
//! One writer (the session's stdin channel) and one reader loop per
//! session. Outbound requests are correlated by id; responses resolve the
//! matching pending request in any arrival order. Unsolicited server
//! notifications fan out to broadcast subscribers in arrival order,
//! decoupled from correlation. Malformed frames are logged and skipped;
//! the session keeps going.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use zenbridge_core::protocol::{self, Inbound, Notification, Request, Response};

type PendingMap = HashMap<u64, oneshot::Sender<Response>>;

/// Configuration for the multiplexer.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Notification broadcast channel capacity.
    pub broadcast_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
        }
    }
}

/// Multiplexer errors.
#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    /// The session's input or output stream is closed.
    #[error("Session stream closed")]
    StreamClosed,

    /// No correlated response arrived within the caller's deadline.
    #[error("Request {id} timed out after {timeout:?}")]
    Timeout { id: u64, timeout: Duration },

    #[error("Failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Frames and correlates traffic for one session.
pub struct StreamMultiplexer {
    stdin_tx: mpsc::Sender<String>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    notify_tx: broadcast::Sender<Notification>,
}

impl StreamMultiplexer {
    /// Attach to a session's streams and start the reader loop.
    ///
    /// `stdin_tx` is the session's stdin channel; `lines_rx` carries the
    /// raw stdout lines the supervisor forwards.
    pub fn attach(
        stdin_tx: mpsc::Sender<String>,
        lines_rx: mpsc::Receiver<String>,
        config: &MultiplexerConfig,
    ) -> Self {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, _) = broadcast::channel(config.broadcast_capacity);

        tokio::spawn(read_loop(
            lines_rx,
            Arc::clone(&pending),
            notify_tx.clone(),
        ));

        Self {
            stdin_tx,
            pending,
            next_id: AtomicU64::new(1),
            notify_tx,
        }
    }

    /// Write one notification frame to the session's input stream.
    pub async fn send(&self, notification: &Notification) -> Result<(), MultiplexerError> {
        let line = serde_json::to_string(notification)?;
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| MultiplexerError::StreamClosed)
    }

    /// Send a correlated request and await its response.
    ///
    /// Only the caller suspends; concurrent requests stay in flight. On
    /// timeout the pending entry is discarded and a later response for the
    /// id is dropped. Dropping the returned future cancels the request
    /// without affecting others.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Response, MultiplexerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        // Removes the pending entry on timeout or caller cancellation; a
        // resolved request was already removed by the reader.
        let _guard = PendingGuard {
            id,
            pending: Arc::clone(&self.pending),
        };

        let line = serde_json::to_string(&Request {
            id,
            method: method.to_string(),
            params,
        })?;
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| MultiplexerError::StreamClosed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the reader loop ended and failed all pending.
            Ok(Err(_)) => Err(MultiplexerError::StreamClosed),
            Err(_) => Err(MultiplexerError::Timeout { id, timeout }),
        }
    }

    /// Subscribe to unsolicited server notifications, delivered in the
    /// order they arrive.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

fn lock_pending(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingGuard {
    id: u64,
    pending: Arc<Mutex<PendingMap>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

async fn read_loop(
    mut lines_rx: mpsc::Receiver<String>,
    pending: Arc<Mutex<PendingMap>>,
    notify_tx: broadcast::Sender<Notification>,
) {
    while let Some(line) = lines_rx.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match protocol::parse_line(line) {
            Ok(Inbound::Response(response)) => {
                let waiter = lock_pending(&pending).remove(&response.id);
                if let Some(tx) = waiter {
                    // A closed receiver means the caller cancelled; the
                    // response is dropped like any other late arrival.
                    let _ = tx.send(response);
                } else {
                    debug!(id = response.id, "Dropping response for discarded request id");
                }
            }
            Ok(Inbound::Notification(notification)) => {
                if notify_tx.send(notification).is_err() {
                    debug!("No subscribers for server notification");
                }
            }
            Ok(Inbound::Unknown { payload }) => {
                debug!(%payload, "Ignoring frame of unknown shape");
            }
            Err(e) => {
                warn!(error = %e, "Skipping malformed frame");
            }
        }
    }

    // Stream closed: fail everything still pending. Dropping the senders
    // wakes each waiting caller with a closed-channel error.
    let abandoned = {
        let mut pending = lock_pending(&pending);
        pending.drain().count()
    };
    if abandoned > 0 {
        warn!(abandoned, "Session ended with requests still pending");
    }
    debug!("reader loop finished");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Harness {
        mux: Arc<StreamMultiplexer>,
        /// Outbound lines the multiplexer wrote (the "server" side of stdin).
        outbound_rx: mpsc::Receiver<String>,
        /// Feed for inbound lines (the "server" side of stdout).
        inbound_tx: mpsc::Sender<String>,
    }

    fn harness() -> Harness {
        let (stdin_tx, outbound_rx) = mpsc::channel(32);
        let (inbound_tx, lines_rx) = mpsc::channel(32);
        let mux = Arc::new(StreamMultiplexer::attach(
            stdin_tx,
            lines_rx,
            &MultiplexerConfig::default(),
        ));
        Harness {
            mux,
            outbound_rx,
            inbound_tx,
        }
    }

    fn request_id(line: &str) -> u64 {
        let frame: Value = serde_json::from_str(line).unwrap();
        frame["id"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn responses_resolve_out_of_order() {
        let mut h = harness();

        let mut handles = Vec::new();
        for n in 0..5 {
            let mux = Arc::clone(&h.mux);
            handles.push(tokio::spawn(async move {
                mux.request("echo", json!({"n": n}), Duration::from_secs(5))
                    .await
            }));
        }

        // Collect the five outbound requests (spawn order is arbitrary, so
        // map each caller's `n` to its allocated id), then answer in
        // reverse order.
        let mut id_for_n = std::collections::HashMap::new();
        for _ in 0..5 {
            let line = h.outbound_rx.recv().await.unwrap();
            let frame: Value = serde_json::from_str(&line).unwrap();
            id_for_n.insert(
                frame["params"]["n"].as_u64().unwrap(),
                frame["id"].as_u64().unwrap(),
            );
        }
        for n in (0..5u64).rev() {
            let id = id_for_n[&n];
            h.inbound_tx
                .send(format!(r#"{{"id":{id},"result":{{"answered":{n}}}}}"#))
                .await
                .unwrap();
        }

        for (n, handle) in handles.into_iter().enumerate() {
            let response = handle.await.unwrap().unwrap();
            // Each caller got the response correlated to its own request.
            assert_eq!(response.payload["answered"], json!(n as u64));
        }
        assert_eq!(h.mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_discards_the_pending_request() {
        let mut h = harness();

        let result = h
            .mux
            .request("slow", Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(MultiplexerError::Timeout { .. })));
        assert_eq!(h.mux.pending_count(), 0);

        // The late response is dropped, and a subsequent request still works.
        let line = h.outbound_rx.recv().await.unwrap();
        let stale_id = request_id(&line);
        h.inbound_tx
            .send(format!(r#"{{"id":{stale_id},"result":"late"}}"#))
            .await
            .unwrap();

        let mux = Arc::clone(&h.mux);
        let handle = tokio::spawn(async move {
            mux.request("echo", Value::Null, Duration::from_secs(5)).await
        });
        let line = h.outbound_rx.recv().await.unwrap();
        let id = request_id(&line);
        h.inbound_tx
            .send(format!(r#"{{"id":{id},"result":"fresh"}}"#))
            .await
            .unwrap();

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.payload, json!("fresh"));
    }

    #[tokio::test]
    async fn cancellation_removes_the_pending_entry() {
        let mut h = harness();

        let mux = Arc::clone(&h.mux);
        let mut fut = Box::pin(async move {
            mux.request("never", Value::Null, Duration::from_secs(60)).await
        });

        // Poll long enough for the request to hit the wire, then drop it.
        tokio::select! {
            _ = &mut fut => panic!("request resolved without a response"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
        drop(fut);

        let _ = h.outbound_rx.recv().await.unwrap();
        assert_eq!(h.mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn notifications_arrive_in_order() {
        let h = harness();
        let mut sub = h.mux.subscribe();

        for n in 0..3 {
            h.inbound_tx
                .send(format!(r#"{{"method":"diag","params":{{"n":{n}}}}}"#))
                .await
                .unwrap();
        }

        for n in 0..3 {
            let notification =
                tokio::time::timeout(Duration::from_secs(2), sub.recv())
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(notification.method, "diag");
            assert_eq!(notification.params["n"], json!(n));
        }
    }

    #[tokio::test]
    async fn malformed_frames_do_not_kill_the_session() {
        let mut h = harness();

        h.inbound_tx.send("{{{ garbage".to_string()).await.unwrap();

        let mux = Arc::clone(&h.mux);
        let handle = tokio::spawn(async move {
            mux.request("echo", Value::Null, Duration::from_secs(5)).await
        });
        let line = h.outbound_rx.recv().await.unwrap();
        let id = request_id(&line);
        h.inbound_tx
            .send(format!(r#"{{"id":{id},"result":"ok"}}"#))
            .await
            .unwrap();

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn closed_input_stream_is_a_write_error() {
        let h = harness();
        drop(h.outbound_rx);

        let notification = Notification {
            method: "noop".into(),
            params: Value::Null,
        };
        assert!(matches!(
            h.mux.send(&notification).await,
            Err(MultiplexerError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn session_end_fails_pending_requests() {
        let mut h = harness();

        let mux = Arc::clone(&h.mux);
        let handle = tokio::spawn(async move {
            mux.request("echo", Value::Null, Duration::from_secs(60)).await
        });
        let _ = h.outbound_rx.recv().await.unwrap();

        drop(h.inbound_tx);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(MultiplexerError::StreamClosed)));
        assert_eq!(h.mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn correlation_ids_are_unique() {
        let mut h = harness();

        let mux = Arc::clone(&h.mux);
        tokio::spawn(async move {
            let _ = mux.request("a", Value::Null, Duration::from_millis(200)).await;
        });
        let mux = Arc::clone(&h.mux);
        tokio::spawn(async move {
            let _ = mux.request("b", Value::Null, Duration::from_millis(200)).await;
        });

        let first = request_id(&h.outbound_rx.recv().await.unwrap());
        let second = request_id(&h.outbound_rx.recv().await.unwrap());
        assert_ne!(first, second);
    }
}
