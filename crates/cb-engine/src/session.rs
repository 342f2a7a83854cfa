//! Deployment session lifecycle
//!
//! A [`Session`] owns one authenticated SSH connection to the deployment
//! host, the pty-backed primary channel lifecycle scripts run on, and the
//! stdin path used to answer interactive prompts. Auxiliary commands run
//! through the [`CommandRunner`] impl on short-lived channels. Everything
//! a session allocates is released by [`Session::close`], in order, no
//! matter which step of a deployment failed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cb_core::{env, DeploymentDescriptor, EngineConfig, HostConfig, SessionId};

use crate::error::{EngineError, TransportError};
use crate::prompt::PromptHandle;
use crate::transport::connector::{ClientHandler, Connector};
use crate::transport::{CommandOutput, CommandRunner};

/// Capacity of the stdin channel feeding the primary pty.
///
/// Prompt responses are rare and small; a few slots decouple the prompt
/// sink from the channel writer without buffering unbounded input.
const STDIN_CHANNEL_CAPACITY: usize = 16;

/// How long teardown waits for the primary I/O task to finish.
const IO_TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// An open deployment session.
///
/// The environment contract and deployment path are computed once at open
/// time and stay fixed for the session's lifetime.
pub struct Session {
    id: SessionId,
    config: EngineConfig,
    deploy_path: String,
    environment: BTreeMap<String, String>,
    handle: Handle<ClientHandler>,
    primary: Option<Channel<Msg>>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    stdin_rx: Option<mpsc::Receiver<Vec<u8>>>,
    io_task: Option<JoinHandle<mpsc::Receiver<Vec<u8>>>>,
    prompt_sink: Option<Arc<crate::prompt::PromptSink>>,
    cancel: CancellationToken,
    closed: bool,
}

impl Session {
    /// Open an authenticated session to the deployment host.
    ///
    /// Resolves the deployment path, computes the environment contract,
    /// dials, authenticates, and opens the primary pty channel. When the
    /// channel or pty negotiation fails after a successful connection, the
    /// connection is closed before the error returns.
    pub async fn open(
        config: EngineConfig,
        host: &HostConfig,
        deployment: &DeploymentDescriptor,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let deploy_path = env::resolve_deploy_path(deployment, host);
        let environment = env::build_environment(deployment, host, &deploy_path);
        let id = SessionId::generate(deployment.id);

        let connector = Connector::new(config.clone());
        let handle = connector.connect(host).await?;
        let primary = match connector.open_primary(&handle).await {
            Ok(channel) => channel,
            Err(e) => {
                // Partial failure: the connection must not leak
                if let Err(close_err) = handle
                    .disconnect(Disconnect::ByApplication, "closing", "en")
                    .await
                {
                    tracing::debug!("Disconnect after failed channel setup: {}", close_err);
                }
                return Err(e.into());
            }
        };

        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);

        tracing::info!("Session {} established to {}", id, host.address());

        Ok(Self {
            id,
            config,
            deploy_path,
            environment,
            handle,
            primary: Some(primary),
            stdin_tx: Some(stdin_tx),
            stdin_rx: Some(stdin_rx),
            io_task: None,
            prompt_sink: None,
            cancel,
            closed: false,
        })
    }

    /// The session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The resolved remote deployment path.
    pub fn deploy_path(&self) -> &str {
        &self.deploy_path
    }

    /// The environment contract computed at open time.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Token observed by running executions. Cancelling it stops them.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal cancellation to any running execution.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether `close` has already run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Register the responder used for interactive prompts.
    pub fn set_prompt_sink<F>(&mut self, sink: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.prompt_sink = Some(Arc::new(sink));
    }

    /// Handle for answering prompts from another task while a script runs.
    pub fn prompt_handle(&self) -> PromptHandle {
        PromptHandle::new(self.stdin_tx.clone(), self.prompt_sink.clone())
    }

    /// Answer one interactive prompt. See [`PromptHandle::handle_prompt`].
    pub async fn handle_prompt(&self, prompt: &str) {
        self.prompt_handle().handle_prompt(prompt).await;
    }

    /// Take the primary channel for a script run, opening a fresh one when
    /// an earlier run consumed it. SSH allows a single exec per channel.
    pub(crate) async fn acquire_primary(&mut self) -> Result<Channel<Msg>, TransportError> {
        if let Some(channel) = self.primary.take() {
            return Ok(channel);
        }
        let connector = Connector::new(self.config.clone());
        connector.open_primary(&self.handle).await
    }

    pub(crate) fn take_stdin(&mut self) -> mpsc::Receiver<Vec<u8>> {
        if let Some(rx) = self.stdin_rx.take() {
            return rx;
        }
        // The previous receiver went down with a cancelled run; start a
        // fresh pair. Outstanding prompt handles hold the stale sender.
        let (tx, rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
        self.stdin_tx = Some(tx);
        rx
    }

    pub(crate) fn restore_stdin(&mut self, rx: mpsc::Receiver<Vec<u8>>) {
        self.stdin_rx = Some(rx);
    }

    pub(crate) fn set_io_task(&mut self, task: JoinHandle<mpsc::Receiver<Vec<u8>>>) {
        self.io_task = Some(task);
    }

    /// Wait briefly for the primary I/O task and hand back the stdin
    /// receiver for the next run.
    pub(crate) async fn reap_io_task(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        let task = self.io_task.take()?;
        match tokio::time::timeout(IO_TASK_SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(rx)) => Some(rx),
            Ok(Err(e)) => {
                tracing::warn!("Primary I/O task ended abnormally: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!("Primary I/O task did not stop in time");
                None
            }
        }
    }

    /// Close the session, releasing every resource in order.
    ///
    /// Steps: signal cancellation, close the input stream, close the
    /// primary channel and reap its I/O task, then disconnect. Each step
    /// runs regardless of earlier failures; failures are logged and the
    /// first one is returned as a best-effort diagnostic. Closing twice is
    /// a no-op.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        tracing::info!("Closing session {}", self.id);
        let mut first_error: Option<anyhow::Error> = None;

        // 1. Stop any running execution
        self.cancel.cancel();

        // 2. Close the input stream; the I/O task answers with EOF
        self.stdin_tx.take();

        // 3. Close the primary channel and reap its I/O task
        if let Some(channel) = self.primary.take() {
            if let Err(e) = channel.close().await {
                tracing::warn!("Failed to close primary channel: {}", e);
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!("failed to close primary channel: {}", e));
                }
            }
        }
        if let Some(task) = self.io_task.take() {
            match tokio::time::timeout(IO_TASK_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(_stdin_rx)) => {}
                Ok(Err(e)) => tracing::warn!("Primary I/O task ended abnormally: {}", e),
                Err(_) => tracing::warn!(
                    "Primary I/O task did not stop within {:?}",
                    IO_TASK_SHUTDOWN_TIMEOUT
                ),
            }
        }

        // 4. Drop the transport connection
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::warn!("Failed to disconnect from host: {}", e);
            if first_error.is_none() {
                first_error = Some(anyhow::anyhow!("failed to disconnect: {}", e));
            }
        }

        match first_error {
            Some(e) => Err(TransportError::Teardown(e)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CommandRunner for Session {
    /// Run one auxiliary command on a short-lived channel.
    ///
    /// Stdout and stderr are captured combined, in arrival order, and kept
    /// even when the command fails. The configured command timeout bounds
    /// the whole run.
    async fn run_command(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let mut channel =
            self.handle
                .channel_open_session()
                .await
                .map_err(|e| TransportError::Session {
                    source: anyhow::anyhow!("Failed to open auxiliary channel: {}", e),
                })?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Session {
                source: anyhow::anyhow!("Failed to start auxiliary command: {}", e),
            })?;

        let mut output = Vec::new();
        let mut exit_status = None;

        let drain = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                        output.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                    _ => {}
                }
            }
        };

        if tokio::time::timeout(self.config.command_timeout, drain)
            .await
            .is_err()
        {
            let _ = channel.close().await;
            return Err(TransportError::CommandTimeout {
                timeout: self.config.command_timeout,
            });
        }

        Ok(CommandOutput {
            output: String::from_utf8_lossy(&output).into_owned(),
            exit_status,
        })
    }
}
