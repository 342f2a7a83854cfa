//! Error types for the deployment engine

use std::fmt;
use std::time::Duration;

use cb_protocol::{LifecycleScript, ProtocolError};
use thiserror::Error;

/// Errors establishing or using the SSH transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP dial or SSH handshake failed
    #[error("Connection to {address} failed: {source}")]
    Connection {
        address: String,
        #[source]
        source: anyhow::Error,
    },

    /// Key material could not be decoded into a usable key
    #[error("Unusable private key: {0}")]
    KeyUnusable(String),

    /// Key material is passphrase-protected
    #[error("Private key is encrypted; passphrase-protected keys are not supported")]
    KeyEncrypted,

    /// The server rejected our credentials
    #[error("Authentication rejected for user '{username}'")]
    AuthRejected { username: String },

    /// The server's host key failed the configured policy
    #[error("Host key verification failed: {message}")]
    HostKeyRejected { message: String },

    /// Channel or pty negotiation failed on an established connection
    #[error("Session channel failure: {source}")]
    Session {
        #[source]
        source: anyhow::Error,
    },

    /// An auxiliary command exceeded the configured time bound
    #[error("Auxiliary command timed out after {timeout:?}")]
    CommandTimeout { timeout: Duration },

    /// Best-effort teardown reported at least one failure
    #[error("Session teardown failed: {0}")]
    Teardown(anyhow::Error),
}

/// CIP compliance failures
#[derive(Debug, Error)]
pub enum ValidationError {
    /// cloudbox.json is absent from the deployment path
    #[error("cloudbox.json not found in {path} - application is not CIP compliant")]
    ManifestMissing { path: String },

    /// A required lifecycle script is not defined in the manifest
    #[error("Required script '{script}' is not defined in cloudbox.json")]
    MissingScript { script: LifecycleScript },

    /// The manifest names a script file that does not exist
    #[error("Script '{script}' not found at '{path}'")]
    ScriptNotFound {
        script: LifecycleScript,
        path: String,
    },
}

/// Environment injection failures
#[derive(Debug, Error)]
pub enum InjectionError {
    /// Writing the environment script failed
    #[error("Failed to write environment script: {output}")]
    WriteFailed { output: String },

    /// Sourcing the environment script failed
    #[error("Failed to source environment script: {output}")]
    SourceFailed { output: String },
}

/// How a remote command or script run ended when it did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDetail {
    /// The remote process exited with this non-zero status
    Code(u32),
    /// The remote side rejected the exec request
    ExecRejected,
    /// The channel closed before reporting an exit status
    ClosedWithoutStatus,
}

impl fmt::Display for ExitDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitDetail::Code(code) => write!(f, "exit status {}", code),
            ExitDetail::ExecRejected => write!(f, "exec request rejected by host"),
            ExitDetail::ClosedWithoutStatus => {
                write!(f, "channel closed without an exit status")
            }
        }
    }
}

/// Top-level error for deployment operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// SSH transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// CIP compliance validation failure
    #[error("CIP validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Environment injection failure
    #[error("Environment injection failed: {0}")]
    Injection(#[from] InjectionError),

    /// Manifest data failed to parse
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A lifecycle script ran and failed
    #[error("Script '{script}' execution failed: {detail}")]
    Execution {
        script: LifecycleScript,
        detail: ExitDetail,
    },

    /// An orchestration command ran and failed
    #[error("{step} failed: {detail}")]
    CommandFailed { step: String, detail: ExitDetail },

    /// Execution was cancelled through the session's cancellation token
    #[error("Execution cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_message_names_script_and_status() {
        let err = EngineError::Execution {
            script: LifecycleScript::Start,
            detail: ExitDetail::Code(127),
        };
        assert_eq!(
            err.to_string(),
            "Script 'start' execution failed: exit status 127"
        );
    }

    #[test]
    fn test_validation_errors_carry_context() {
        let missing = ValidationError::MissingScript {
            script: LifecycleScript::Stop,
        };
        assert!(missing.to_string().contains("'stop'"));

        let not_found = ValidationError::ScriptNotFound {
            script: LifecycleScript::Install,
            path: "./scripts/install.sh".to_string(),
        };
        assert!(not_found.to_string().contains("./scripts/install.sh"));
    }
}
