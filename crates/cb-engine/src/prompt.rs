//! Interactive prompt handling
//!
//! Scripts occasionally stop and ask something ("Overwrite? [y/N]"). The
//! engine does not detect prompts itself; the caller watches the output
//! stream and, when it spots one, hands the prompt text back through a
//! registered sink. A non-empty sink response is written to the script's
//! stdin with a newline appended.

use std::sync::Arc;

use tokio::sync::mpsc;

/// Caller-registered responder for interactive prompts.
///
/// Invoked synchronously with the prompt text; returning an empty string
/// means "no answer", and nothing is sent.
pub type PromptSink = dyn Fn(&str) -> String + Send + Sync;

/// Cheap handle for answering prompts while a script runs.
///
/// The session hands these out so prompt handling can live in a different
/// task than the one driving execution. Clones share the same stdin
/// channel and sink.
#[derive(Clone)]
pub struct PromptHandle {
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    sink: Option<Arc<PromptSink>>,
}

impl PromptHandle {
    pub(crate) fn new(
        stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
        sink: Option<Arc<PromptSink>>,
    ) -> Self {
        Self { stdin_tx, sink }
    }

    /// Answer one prompt through the registered sink.
    ///
    /// Does nothing when no sink is registered or when the sink returns an
    /// empty response. Send failures are logged, not surfaced: by the time
    /// a response fails to send, the script is already gone and its exit
    /// status is the error that matters.
    pub async fn handle_prompt(&self, prompt: &str) {
        let Some(sink) = &self.sink else {
            tracing::debug!("Prompt ignored, no sink registered: {}", prompt);
            return;
        };

        let response = sink(prompt);
        if response.is_empty() {
            tracing::debug!("Prompt sink returned no answer: {}", prompt);
            return;
        }

        let Some(stdin_tx) = &self.stdin_tx else {
            tracing::warn!("Prompt response dropped, session input is closed");
            return;
        };

        let mut data = response.into_bytes();
        data.push(b'\n');
        if stdin_tx.send(data).await.is_err() {
            tracing::warn!("Prompt response dropped, session input is closed");
        }
    }
}
