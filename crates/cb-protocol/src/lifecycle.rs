//! Lifecycle script identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// One of the four lifecycle operations a CIP-compliant application exposes.
///
/// Every conformant manifest must map each of these names to an executable
/// script path. Validation walks them in the order of [`LifecycleScript::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleScript {
    /// Install dependencies and prepare the application
    Install,
    /// Start the application
    Start,
    /// Stop the application
    Stop,
    /// Report whether the application is healthy
    Status,
}

impl LifecycleScript {
    /// All required scripts, in the fixed order validation checks them.
    pub const ALL: [LifecycleScript; 4] = [
        LifecycleScript::Install,
        LifecycleScript::Start,
        LifecycleScript::Stop,
        LifecycleScript::Status,
    ];

    /// The script name as it appears in the manifest's `scripts` section.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleScript::Install => "install",
            LifecycleScript::Start => "start",
            LifecycleScript::Stop => "stop",
            LifecycleScript::Status => "status",
        }
    }
}

impl fmt::Display for LifecycleScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleScript {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(LifecycleScript::Install),
            "start" => Ok(LifecycleScript::Start),
            "stop" => Ok(LifecycleScript::Stop),
            "status" => Ok(LifecycleScript::Status),
            other => Err(ProtocolError::UnknownScript(other.to_string())),
        }
    }
}
