//! Lifecycle script execution
//!
//! Runs one lifecycle script on the session's pty-backed primary channel.
//! A dedicated I/O task demultiplexes channel messages into two in-memory
//! pipes, one per stream; a line reader per pipe assembles complete lines
//! and forwards them through the router. The executor itself just races
//! the I/O task's completion report against the session's cancellation
//! token, so a cancelled run returns promptly no matter what the remote
//! side is doing.
//!
//! Output is treated as UTF-8 text. A reader that hits invalid bytes stops
//! and logs; the script itself keeps running to its exit status.

use cb_protocol::{LifecycleScript, Manifest, OutputChannel};
use futures::StreamExt;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, ExitDetail, TransportError, ValidationError};
use crate::inject;
use crate::router::OutputRouter;
use crate::session::Session;

/// Longest line the stream readers will assemble.
///
/// Lines beyond this are skipped rather than buffered without bound;
/// package managers occasionally emit enormous single-line progress dumps.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Buffer size of each in-memory pipe between the I/O task and a reader.
const STREAM_BUFFER_SIZE: usize = 8192;

/// What the I/O task reports back when the channel finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RunEnd {
    /// Exit status the remote side reported, if any
    exit_status: Option<u32>,
    /// The server refused the exec request
    exec_rejected: bool,
}

/// Run one lifecycle script to completion or cancellation.
///
/// The environment is injected first, then the script runs via
/// `cd <path> && chmod +x <script> && <script>` on the primary channel.
/// Returns when the remote side reports an exit status and both output
/// streams are drained, or as soon as cancellation fires.
pub async fn run_lifecycle_script(
    session: &mut Session,
    manifest: &Manifest,
    script: LifecycleScript,
    router: &OutputRouter,
) -> Result<(), EngineError> {
    let cancel = session.cancellation_token();
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let script_path = manifest
        .script_path(script)
        .ok_or(ValidationError::MissingScript { script })?
        .to_string();
    let deploy_path = session.deploy_path().to_string();

    inject::inject_environment(&*session, &deploy_path, session.environment(), router).await?;

    let command = format!(
        "cd {} && chmod +x {} && {}",
        deploy_path, script_path, script_path
    );
    router
        .info(format!("[CIP] Executing script '{}'", script))
        .await;
    router.info(format!("[CIP] Command: {}", command)).await;

    let channel = session.acquire_primary().await?;
    let stdin_rx = session.take_stdin();

    let (stdout_wr, stdout_rd) = duplex(STREAM_BUFFER_SIZE);
    let (stderr_wr, stderr_rd) = duplex(STREAM_BUFFER_SIZE);
    let stdout_reader = spawn_line_reader(stdout_rd, OutputChannel::Stdout, router.clone());
    let stderr_reader = spawn_line_reader(stderr_rd, OutputChannel::Stderr, router.clone());

    channel
        .exec(true, command.as_str())
        .await
        .map_err(|e| TransportError::Session {
            source: anyhow::anyhow!("Failed to start script execution: {}", e),
        })?;

    let (end_tx, end_rx) = oneshot::channel();
    let io_task = tokio::spawn(run_channel_io(
        channel,
        stdin_rx,
        stdout_wr,
        stderr_wr,
        cancel.clone(),
        end_tx,
    ));
    session.set_io_task(io_task);

    let end = match await_run_end(&cancel, end_rx).await {
        Ok(end) => end,
        Err(e) => {
            router
                .info(format!("[CIP] Script '{}' execution cancelled", script))
                .await;
            return Err(e);
        }
    };

    // The channel is done; reclaim the stdin receiver and let the readers
    // flush whatever is still buffered.
    if let Some(rx) = session.reap_io_task().await {
        session.restore_stdin(rx);
    }
    let _ = stdout_reader.await;
    let _ = stderr_reader.await;

    if end.exec_rejected {
        router
            .error(format!("[CIP] Script '{}' was rejected by the host", script))
            .await;
        return Err(EngineError::Execution {
            script,
            detail: ExitDetail::ExecRejected,
        });
    }

    match end.exit_status {
        Some(0) => {
            router
                .info(format!("[CIP] Script '{}' completed successfully", script))
                .await;
            Ok(())
        }
        Some(code) => {
            router
                .error(format!(
                    "[CIP] Script '{}' failed with exit status {}",
                    script, code
                ))
                .await;
            Err(EngineError::Execution {
                script,
                detail: ExitDetail::Code(code),
            })
        }
        None => {
            router
                .error(format!(
                    "[CIP] Script '{}' channel closed without an exit status",
                    script
                ))
                .await;
            Err(EngineError::Execution {
                script,
                detail: ExitDetail::ClosedWithoutStatus,
            })
        }
    }
}

/// Race the I/O task's completion report against cancellation.
async fn await_run_end(
    cancel: &CancellationToken,
    end_rx: oneshot::Receiver<RunEnd>,
) -> Result<RunEnd, EngineError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        end = end_rx => Ok(end.unwrap_or(RunEnd {
            exit_status: None,
            exec_rejected: false,
        })),
    }
}

/// Shuttle bytes between the primary channel and the session's local ends.
///
/// Owns the channel for the duration of the run. Channel data fans out to
/// the per-stream pipes, stdin writes flow in from the session's channel,
/// and the exit status is captured when it arrives. On cancellation the
/// channel is closed and the task ends; the remote process sees a closed
/// connection rather than a signal.
///
/// Returns the stdin receiver so the session can reuse it for a later run.
async fn run_channel_io(
    mut channel: Channel<Msg>,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    mut stdout_wr: DuplexStream,
    mut stderr_wr: DuplexStream,
    cancel: CancellationToken,
    end_tx: oneshot::Sender<RunEnd>,
) -> mpsc::Receiver<Vec<u8>> {
    let mut end = RunEnd {
        exit_status: None,
        exec_rejected: false,
    };
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = channel.close().await;
                break;
            }
            input = stdin_rx.recv(), if stdin_open => {
                match input {
                    Some(data) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            tracing::warn!("Failed to write to remote stdin: {}", e);
                        }
                    }
                    None => {
                        stdin_open = false;
                        let _ = channel.eof().await;
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        if stdout_wr.write_all(data).await.is_err() {
                            tracing::debug!("stdout reader is gone, discarding output");
                        }
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                        if stderr_wr.write_all(data).await.is_err() {
                            tracing::debug!("stderr reader is gone, discarding output");
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        // More data may still be queued behind the status;
                        // keep draining until the channel closes.
                        end.exit_status = Some(exit_status);
                    }
                    Some(ChannelMsg::Failure) => {
                        end.exec_rejected = true;
                        let _ = channel.close().await;
                        break;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    // Dropping the write halves delivers EOF to the line readers.
    drop(stdout_wr);
    drop(stderr_wr);
    let _ = end_tx.send(end);
    stdin_rx
}

/// Read complete lines from one stream pipe and route them.
fn spawn_line_reader(
    stream: DuplexStream,
    channel: OutputChannel,
    router: OutputRouter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        while let Some(item) = lines.next().await {
            match item {
                Ok(line) => {
                    if router.emit(line, channel).await.is_err() {
                        break;
                    }
                }
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!("{} line exceeded {} bytes, skipped", channel, MAX_LINE_LENGTH);
                }
                Err(e) => {
                    tracing::warn!("{} reader stopped: {}", channel, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_line_reader_splits_and_flushes_partial_tail() {
        let (router, mut rx) = OutputRouter::channel();
        let (mut wr, rd) = duplex(256);
        let reader = spawn_line_reader(rd, OutputChannel::Stdout, router.clone());

        wr.write_all(b"first\nsecond\r\npartial").await.unwrap();
        drop(wr);
        reader.await.unwrap();
        drop(router);

        let mut seen = Vec::new();
        while let Some(line) = rx.recv().await {
            assert_eq!(line.channel, OutputChannel::Stdout);
            seen.push(line.text);
        }
        assert_eq!(seen, vec!["first", "second", "partial"]);
    }

    #[tokio::test]
    async fn test_line_reader_reassembles_split_writes() {
        let (router, mut rx) = OutputRouter::channel();
        let (mut wr, rd) = duplex(256);
        let reader = spawn_line_reader(rd, OutputChannel::Stderr, router.clone());

        wr.write_all(b"hel").await.unwrap();
        wr.write_all(b"lo\nwor").await.unwrap();
        wr.write_all(b"ld\n").await.unwrap();
        drop(wr);
        reader.await.unwrap();
        drop(router);

        let mut seen = Vec::new();
        while let Some(line) = rx.recv().await {
            seen.push(line.text);
        }
        assert_eq!(seen, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_a_pending_run() {
        let cancel = CancellationToken::new();
        let (_end_tx, end_rx) = oneshot::channel::<RunEnd>();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let raced = tokio::time::timeout(
            Duration::from_secs(1),
            await_run_end(&cancel, end_rx),
        )
        .await
        .expect("cancellation must unblock the race promptly");
        assert!(matches!(raced, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_completion_wins_when_not_cancelled() {
        let cancel = CancellationToken::new();
        let (end_tx, end_rx) = oneshot::channel();
        end_tx
            .send(RunEnd {
                exit_status: Some(0),
                exec_rejected: false,
            })
            .unwrap();

        let end = await_run_end(&cancel, end_rx).await.unwrap();
        assert_eq!(end.exit_status, Some(0));
        assert!(!end.exec_rejected);
    }

    #[tokio::test]
    async fn test_lost_io_task_counts_as_closed_without_status() {
        let cancel = CancellationToken::new();
        let (end_tx, end_rx) = oneshot::channel::<RunEnd>();
        drop(end_tx);

        let end = await_run_end(&cancel, end_rx).await.unwrap();
        assert_eq!(end.exit_status, None);
    }
}
