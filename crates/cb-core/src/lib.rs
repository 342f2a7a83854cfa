//! cb-core: Shared abstractions for the CloudBox deployment engine
//!
//! This crate holds the types that flow between the caller and the engine:
//! the deployment descriptor and host configuration handed in by the
//! data-access layer, the session identifier, the pure environment builder,
//! and the engine's TOML configuration.

pub mod config;
pub mod env;
pub mod error;
pub mod types;

pub use config::{EngineConfig, HostKeyPolicy};
pub use error::ConfigError;
pub use types::{DeploymentDescriptor, HostConfig, SessionId};
