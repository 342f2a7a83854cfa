//! SSH connection establishment
//!
//! Dials the deployment host, authenticates with the configured private
//! key, and opens the pty-backed primary channel that lifecycle scripts
//! run on.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Pty};
use russh_keys::key::PublicKey;

use cb_core::{EngineConfig, HostConfig, HostKeyPolicy};

use crate::error::TransportError;
use crate::transport::auth;

/// Baud rate advertised in the pty request.
const PTY_BAUD_RATE: u32 = 14_400;

/// Opens authenticated connections and pty-backed primary channels.
pub struct Connector {
    config: EngineConfig,
}

impl Connector {
    /// Create a connector using the given engine configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Dial the host and authenticate with its configured private key.
    ///
    /// The connect timeout covers the TCP dial and SSH handshake together.
    /// The host key is judged by the configured policy before
    /// authentication starts.
    pub async fn connect(
        &self,
        host: &HostConfig,
    ) -> Result<Handle<ClientHandler>, TransportError> {
        let key = auth::parse_private_key(&host.private_key)?;

        let ssh_config = Arc::new(Config::default());
        let handler = ClientHandler::new(self.config.host_key_policy.clone(), host.address());

        tracing::debug!("Connecting to {}", host.address());
        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(ssh_config, (host.hostname.as_str(), host.port), handler),
        )
        .await
        .map_err(|_| TransportError::Connection {
            address: host.address(),
            source: anyhow::anyhow!("timed out after {:?}", self.config.connect_timeout),
        })?
        .map_err(|e| {
            let err_str = e.to_string();
            // russh reports a handler rejection as "Unknown server key"
            if err_str.contains("Unknown server key") || err_str.contains("server key") {
                return TransportError::HostKeyRejected {
                    message: format!(
                        "{} presented a host key outside the configured policy",
                        host.address()
                    ),
                };
            }
            TransportError::Connection {
                address: host.address(),
                source: anyhow::anyhow!(e),
            }
        })?;

        tracing::debug!("Authenticating as user '{}'", host.username);
        let authenticated = handle
            .authenticate_publickey(&host.username, Arc::new(key))
            .await
            .map_err(|e| TransportError::Connection {
                address: host.address(),
                source: anyhow::anyhow!("Authentication exchange failed: {}", e),
            })?;

        if !authenticated {
            return Err(TransportError::AuthRejected {
                username: host.username.clone(),
            });
        }

        tracing::debug!("Authenticated to {}", host.address());
        Ok(handle)
    }

    /// Open a session channel and negotiate the pty scripts expect.
    ///
    /// Installers probe for a terminal; without a pty many of them hang on
    /// hidden prompts or switch to a non-interactive code path. Echo is
    /// enabled so prompt text round-trips into the output stream where the
    /// caller can see it.
    pub async fn open_primary(
        &self,
        handle: &Handle<ClientHandler>,
    ) -> Result<Channel<Msg>, TransportError> {
        let mut channel =
            handle
                .channel_open_session()
                .await
                .map_err(|e| TransportError::Session {
                    source: anyhow::anyhow!("Failed to open session channel: {}", e),
                })?;

        channel
            .request_pty(
                true,
                &self.config.terminal,
                self.config.pty_cols,
                self.config.pty_rows,
                0,
                0,
                &[
                    (Pty::ECHO, 1),
                    (Pty::TTY_OP_ISPEED, PTY_BAUD_RATE),
                    (Pty::TTY_OP_OSPEED, PTY_BAUD_RATE),
                ],
            )
            .await
            .map_err(|e| TransportError::Session {
                source: anyhow::anyhow!("Failed to request pty: {}", e),
            })?;

        // want_reply is set, so the server answers Success or Failure
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(channel),
                Some(ChannelMsg::Failure) => {
                    return Err(TransportError::Session {
                        source: anyhow::anyhow!("Server rejected the pty request"),
                    });
                }
                Some(msg) => {
                    tracing::trace!("Ignoring message during pty negotiation: {:?}", msg);
                }
                None => {
                    return Err(TransportError::Session {
                        source: anyhow::anyhow!("Channel closed during pty negotiation"),
                    });
                }
            }
        }
    }
}

/// Client-side SSH event handler.
///
/// Host key verification is the only event the engine handles here; all
/// channel I/O flows through `Channel` handles rather than handler
/// callbacks.
pub struct ClientHandler {
    policy: HostKeyPolicy,
    address: String,
}

impl ClientHandler {
    fn new(policy: HostKeyPolicy, address: String) -> Self {
        Self { policy, address }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        if host_key_acceptable(&self.policy, &fingerprint) {
            tracing::debug!("Host key {} for {} accepted", fingerprint, self.address);
            Ok(true)
        } else {
            tracing::error!(
                "Host key {} for {} is not in the pinned set",
                fingerprint,
                self.address
            );
            Ok(false)
        }
    }
}

/// Judge a host key fingerprint against the configured policy.
fn host_key_acceptable(policy: &HostKeyPolicy, fingerprint: &str) -> bool {
    match policy {
        HostKeyPolicy::TrustAny => true,
        HostKeyPolicy::Pinned { fingerprints } => {
            fingerprints.iter().any(|pinned| pinned == fingerprint)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_any_accepts_every_fingerprint() {
        assert!(host_key_acceptable(
            &HostKeyPolicy::TrustAny,
            "SHA256:doesnotmatter"
        ));
    }

    #[test]
    fn test_pinned_policy_accepts_only_listed_fingerprints() {
        let policy = HostKeyPolicy::Pinned {
            fingerprints: vec![
                "SHA256:aaaa".to_string(),
                "SHA256:bbbb".to_string(),
            ],
        };
        assert!(host_key_acceptable(&policy, "SHA256:bbbb"));
        assert!(!host_key_acceptable(&policy, "SHA256:cccc"));
    }

    #[test]
    fn test_empty_pinned_set_rejects_everything() {
        let policy = HostKeyPolicy::Pinned {
            fingerprints: Vec::new(),
        };
        assert!(!host_key_acceptable(&policy, "SHA256:aaaa"));
    }
}
