//! Terminal sink for command invocations and their output.
//!
//! The bridge owns exactly one sink handle, created lazily on first use
//! and shared by every command invocation. No ambient globals: the sink
//! is passed explicitly to whoever writes to it.

use std::sync::Arc;
use tokio::sync::mpsc;

/// Where formatted invocations and subprocess output lines go.
pub trait TerminalSink: Send + Sync {
    /// Append one line to the terminal.
    fn write_line(&self, line: &str);
}

/// Sink that writes lines through `tracing`, tagged as terminal output.
#[derive(Debug, Default)]
pub struct LogSink;

impl TerminalSink for LogSink {
    fn write_line(&self, line: &str) {
        tracing::info!(target: "zenbridge::terminal", "{line}");
    }
}

/// Sink that forwards lines over a channel. Used by hosts that render the
/// terminal themselves, and by tests to capture output.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl TerminalSink for ChannelSink {
    fn write_line(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_captures_lines_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.write_line("first");
        sink.write_line("second");

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn channel_sink_survives_a_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.write_line("nobody listening");
    }
}
