//! The in-process SSH carrier, built on `russh`.
//!
//! Implements the `direct-tcpip` contract the SSH bridge consumes. Server
//! keys are accepted as-is: the threat model is the network between here
//! and the server, and the session is only a carrier for already-encrypted
//! traffic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use russh::client::{self, AuthResult};
use russh::keys::PrivateKeyWithHashAlg;
use veilnet_tunnel::bridge::{BoxedStream, SshTransport};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
}

pub struct RusshTransport {
    handle: client::Handle<Handler>,
}

impl RusshTransport {
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let client_config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        });

        let mut handle = client::connect(
            client_config,
            (config.host.as_str(), config.port),
            Handler,
        )
        .await
        .with_context(|| format!("Failed to reach {}:{}", config.host, config.port))?;

        let authenticated = match (&config.key_path, &config.password) {
            (Some(key_path), _) => {
                let key = russh::keys::load_secret_key(key_path, None)
                    .with_context(|| format!("Failed to load {}", key_path.display()))?;
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .context("Failed to negotiate an RSA hash")?
                    .flatten();

                handle
                    .authenticate_publickey(
                        config.username.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .context("Public-key authentication failed")?
            }
            (None, Some(password)) => handle
                .authenticate_password(config.username.clone(), password.clone())
                .await
                .context("Password authentication failed")?,
            (None, None) => anyhow::bail!("ssh profile has neither key nor password"),
        };

        if !matches!(authenticated, AuthResult::Success) {
            anyhow::bail!("SSH server rejected the credentials");
        }

        tracing::info!(host = %config.host, "SSH session established");

        Ok(Self { handle })
    }

    pub async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

#[async_trait::async_trait]
impl SshTransport for RusshTransport {
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .with_context(|| format!("direct-tcpip to {host}:{port} was not opened"))?;

        Ok(Box::new(channel.into_stream()))
    }
}

struct Handler;

impl client::Handler for Handler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
