//! cb-protocol: CloudBox Install Protocol definitions
//!
//! This crate defines the contract a remote application must follow to be
//! deployable: a `cloudbox.json` manifest whose `scripts` section names the
//! four lifecycle scripts, plus the channel tags used when streaming
//! execution output back to the caller.

pub mod error;
pub mod lifecycle;
pub mod manifest;
pub mod output;

pub use error::ProtocolError;
pub use lifecycle::LifecycleScript;
pub use manifest::{Manifest, MANIFEST_FILE};
pub use output::{OutputChannel, OutputLine};

/// Current protocol version string, injected as `CLOUDBOX_VERSION`.
///
/// Format: "MAJOR.MINOR" where MAJOR changes indicate breaking changes
/// to the manifest shape or the environment contract.
pub const CIP_VERSION: &str = "1.0";

/// Name of the generated environment script placed in the deployment path.
pub const ENV_SCRIPT_FILE: &str = ".cloudbox-env.sh";

/// Prefix shared by every injected environment variable.
pub const ENV_VAR_PREFIX: &str = "CLOUDBOX_";
