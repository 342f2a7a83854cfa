//! CIP manifest model
//!
//! The manifest is the `scripts` section of a remote application's
//! `cloudbox.json`:
//!
//! ```json
//! { "scripts": { "install": "<path>", "start": "<path>",
//!                "stop": "<path>", "status": "<path>" } }
//! ```
//!
//! All four keys are required; paths are relative to the manifest's
//! directory. The file lives on the remote host and is re-read on every
//! validation pass, so a [`Manifest`] value is only ever a snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::lifecycle::LifecycleScript;

/// File name of the CIP manifest, relative to the deployment path.
pub const MANIFEST_FILE: &str = "cloudbox.json";

/// Parsed `scripts` section of a `cloudbox.json` manifest.
///
/// Keys are script names, values are script paths. Entries beyond the four
/// required lifecycle scripts are preserved but never invoked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Script name to path mapping
    pub scripts: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse a manifest from raw `cloudbox.json` text.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        let doc: RawManifest = serde_json::from_str(raw)?;
        let scripts = doc.scripts.ok_or(ProtocolError::MissingScriptsSection)?;
        Ok(Self { scripts })
    }

    /// Record the resolved path for a lifecycle script.
    pub fn set_script(&mut self, script: LifecycleScript, path: impl Into<String>) {
        self.scripts.insert(script.as_str().to_string(), path.into());
    }

    /// Look up the path for a lifecycle script.
    ///
    /// Empty values and the literal string `null` count as undefined; that is
    /// what remote-side extraction yields for absent or null keys.
    pub fn script_path(&self, script: LifecycleScript) -> Option<&str> {
        self.scripts
            .get(script.as_str())
            .map(String::as_str)
            .filter(|path| !path.is_empty() && *path != "null")
    }

    /// Required lifecycle scripts this manifest does not define.
    pub fn missing_scripts(&self) -> Vec<LifecycleScript> {
        LifecycleScript::ALL
            .iter()
            .copied()
            .filter(|script| self.script_path(*script).is_none())
            .collect()
    }
}

/// Top-level `cloudbox.json` shape; fields other than `scripts` are ignored.
#[derive(Deserialize)]
struct RawManifest {
    scripts: Option<BTreeMap<String, String>>,
}
