//! SSH transport layer
//!
//! Owns the authenticated connection to the deployment host. The primary
//! channel carries lifecycle scripts on a pty; auxiliary commands each get
//! a short-lived channel of their own so validation probes never disturb a
//! running script.

pub mod auth;
pub mod connector;

use async_trait::async_trait;

use crate::error::{ExitDetail, TransportError};

/// Captured result of one auxiliary command.
///
/// Output is combined stdout and stderr in arrival order; it is captured
/// even when the command fails, since failure output is usually the part
/// worth reading.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Combined stdout and stderr
    pub output: String,
    /// Remote exit status, or None if the channel closed without one
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Failure detail for error construction.
    pub fn exit_detail(&self) -> ExitDetail {
        match self.exit_status {
            Some(code) => ExitDetail::Code(code),
            None => ExitDetail::ClosedWithoutStatus,
        }
    }
}

/// Runs one-shot commands on the deployment host.
///
/// Implementations open a fresh channel per invocation and run the command
/// to completion, so callers can treat each call as isolated.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion and capture its combined output.
    async fn run_command(&self, command: &str) -> Result<CommandOutput, TransportError>;
}
