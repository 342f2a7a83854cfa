//! Routed output types
//!
//! Script execution streams line-oriented output back to the caller. Every
//! line carries a channel tag so callers can distinguish remote program
//! output from engine progress messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Destination tag for a routed output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    /// Remote process standard output
    Stdout,
    /// Remote process standard error
    Stderr,
    /// Engine progress messages
    Info,
    /// Engine failure messages
    Error,
}

impl OutputChannel {
    /// The channel tag as exposed to callers.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputChannel::Stdout => "stdout",
            OutputChannel::Stderr => "stderr",
            OutputChannel::Info => "info",
            OutputChannel::Error => "error",
        }
    }
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of routed output.
///
/// Ordering is preserved within a channel; lines from different channels
/// may interleave arbitrarily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// Line text, without the trailing newline
    pub text: String,
    /// Channel the line belongs to
    pub channel: OutputChannel,
}

impl OutputLine {
    /// Create a line tagged with an arbitrary channel.
    pub fn new(text: impl Into<String>, channel: OutputChannel) -> Self {
        Self {
            text: text.into(),
            channel,
        }
    }

    /// Create an engine progress line.
    pub fn info(text: impl Into<String>) -> Self {
        Self::new(text, OutputChannel::Info)
    }

    /// Create an engine failure line.
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(text, OutputChannel::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_tags() {
        assert_eq!(OutputChannel::Stdout.as_str(), "stdout");
        assert_eq!(OutputChannel::Stderr.as_str(), "stderr");
        assert_eq!(OutputChannel::Info.as_str(), "info");
        assert_eq!(OutputChannel::Error.as_str(), "error");
    }

    #[test]
    fn test_line_constructors() {
        let line = OutputLine::info("validating");
        assert_eq!(line.channel, OutputChannel::Info);
        assert_eq!(line.text, "validating");
    }
}
