//! Output routing
//!
//! Every line the engine produces, whether read from a script's stdout or
//! stderr, or generated as progress/diagnostic text, flows through one
//! bounded channel to a single consumer. Callers drain the receiving end
//! however they like (print, persist, forward); the engine never blocks on
//! anything slower than this channel.

use cb_protocol::{OutputChannel, OutputLine};
use tokio::sync::mpsc;

/// Capacity of the routed-output channel.
///
/// This buffer holds lines between the stream readers and the consumer.
///
/// # Value Choice
///
/// 256 provides headroom for:
/// - Bursty script output (package managers print in large chunks)
/// - Brief delays in the consumer (e.g., log persistence)
///
/// Too small: readers stall on every consumer hiccup
/// Too large: memory usage when the consumer is slow
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Error returned when the output consumer has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputClosed;

/// Sends tagged output lines to the session's consumer.
///
/// Cloning is cheap; each reader task holds its own router.
#[derive(Clone)]
pub struct OutputRouter {
    tx: mpsc::Sender<OutputLine>,
}

impl OutputRouter {
    /// Create a router and the receiving end for the consumer.
    pub fn channel() -> (Self, mpsc::Receiver<OutputLine>) {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Deliver one line on the given channel.
    ///
    /// Blocks while the buffer is full, which is what gives long script
    /// runs backpressure instead of unbounded memory growth.
    pub async fn emit(
        &self,
        text: impl Into<String>,
        channel: OutputChannel,
    ) -> Result<(), OutputClosed> {
        self.tx
            .send(OutputLine::new(text, channel))
            .await
            .map_err(|_| OutputClosed)
    }

    /// Engine progress line. Delivery failures are ignored; losing a
    /// progress line must not fail the deployment.
    pub async fn info(&self, text: impl Into<String>) {
        if self.emit(text, OutputChannel::Info).await.is_err() {
            tracing::trace!("Output consumer dropped, info line discarded");
        }
    }

    /// Engine diagnostic line for failures.
    pub async fn error(&self, text: impl Into<String>) {
        if self.emit(text, OutputChannel::Error).await.is_err() {
            tracing::trace!("Output consumer dropped, error line discarded");
        }
    }

    /// Forward multi-line command output, one routed line per line of text.
    pub async fn forward(&self, text: &str, channel: OutputChannel) {
        for line in text.lines() {
            if self.emit(line, channel).await.is_err() {
                return;
            }
        }
    }
}
