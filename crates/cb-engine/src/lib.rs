//! cb-engine: CloudBox deployment execution engine
//!
//! Executes CloudBox Install Protocol (CIP) lifecycle scripts on remote
//! hosts over SSH. Each deployment owns one authenticated session with a
//! pty-backed primary channel for scripts plus short-lived auxiliary
//! channels for validation and injection commands; script output is
//! tokenized into lines and delivered through the output router.

pub mod deploy;
pub mod error;
pub mod execute;
pub mod inject;
pub mod ports;
pub mod prompt;
pub mod router;
pub mod session;
pub mod shell;
pub mod transport;
pub mod validate;

pub use deploy::{run_deployment, run_script, DeploymentOutcome, RepositorySpec};
pub use error::{EngineError, InjectionError, TransportError, ValidationError};
pub use router::OutputRouter;
pub use session::Session;
