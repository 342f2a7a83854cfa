//! Protocol error types

use thiserror::Error;

/// Errors that can occur while interpreting CIP protocol data
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Manifest is not valid JSON
    #[error("Invalid manifest JSON: {0}")]
    InvalidManifest(#[from] serde_json::Error),

    /// Manifest has no `scripts` section
    #[error("Manifest has no \"scripts\" section")]
    MissingScriptsSection,

    /// Not a recognized lifecycle script name
    #[error("Unknown lifecycle script: {0}")]
    UnknownScript(String),
}
