//! russh implementation of the shell backend traits.
//!
//! - [`SshBackend`] connects and authenticates with the strategy matching the
//!   target's credential.
//! - [`SshLink`] wraps the authenticated `client::Handle`; every command gets
//!   its own session channel.
//! - [`SshExecChannel`] maps `ChannelMsg` onto [`ChannelEvent`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client};
use tracing::{debug, info, warn};

use super::backend::{ChannelEvent, ExecChannel, ShellBackend, ShellLink};
use crate::relay::auth::strategy_for;
use crate::relay::error::{RelayError, classify_connect_failure};
use crate::relay::handler::RelayClientHandler;
use crate::relay::protocol::TargetConfig;

/// Build SSH client configuration for relay connections.
///
/// Sessions live until the client disconnects or goes idle at the registry
/// level, so the transport has no inactivity timeout. Keepalives detect dead
/// peers: after 3 unanswered probes at 30s the connection is dropped and the
/// link reports closed.
pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Opens real SSH connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshBackend;

impl SshBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ShellBackend for SshBackend {
    async fn open(&self, target: &TargetConfig) -> Result<Arc<dyn ShellLink>, RelayError> {
        let config = build_client_config();
        let handler = RelayClientHandler::new(target.host.as_str());

        let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
            .await
            .map_err(|e| classify_connect_failure(format!("Failed to connect: {}", e)))?;

        let strategy = strategy_for(&target.credential);
        let accepted = strategy.authenticate(&mut handle, &target.username).await?;
        if !accepted {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(RelayError::AuthenticationFailed(format!(
                "{} credentials rejected",
                strategy.name()
            )));
        }

        info!(
            "Authenticated {} using {}",
            target.display_address(),
            strategy.name()
        );

        Ok(Arc::new(SshLink { handle }))
    }
}

/// An authenticated russh connection.
pub struct SshLink {
    handle: client::Handle<RelayClientHandler>,
}

#[async_trait]
impl ShellLink for SshLink {
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, RelayError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| RelayError::channel(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| RelayError::channel(format!("Failed to execute command: {}", e)))?;

        Ok(Box::new(SshExecChannel { channel }))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn disconnect(&self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed by relay", "en")
            .await
        {
            warn!("Error during disconnect: {}", e);
        }
    }
}

/// One session channel running one command.
pub struct SshExecChannel {
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl ExecChannel for SshExecChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(ChannelEvent::Stdout(data.to_vec())),
                // ext == 1 is stderr in SSH protocol
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    return Some(ChannelEvent::Stderr(data.to_vec()));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ChannelEvent::ExitStatus(exit_status));
                }
                ChannelMsg::Eof => return Some(ChannelEvent::Eof),
                ChannelMsg::Close => return Some(ChannelEvent::Closed),
                other => debug!("Ignoring channel message: {:?}", other),
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), RelayError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| RelayError::channel(format!("Failed to write to channel: {}", e)))
    }

    async fn send_eof(&mut self) -> Result<(), RelayError> {
        self.channel
            .eof()
            .await
            .map_err(|e| RelayError::channel(format!("Failed to send EOF: {}", e)))
    }

    async fn close(&mut self) {
        let _ = self.channel.close().await;
    }
}
