//! Backend trait definitions for remote shell access.
//!
//! These traits isolate the SSH library from the connector's state machine,
//! output limits and streaming, enabling dependency injection and testing
//! with a scripted backend.

use std::sync::Arc;

use async_trait::async_trait;

use crate::relay::error::RelayError;
use crate::relay::protocol::TargetConfig;

/// One message read from an exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    Eof,
    Closed,
}

/// A single exec channel running one remote command.
#[async_trait]
pub trait ExecChannel: Send {
    /// Next event, or `None` once the channel is gone.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Write to the command's stdin.
    async fn write(&mut self, data: &[u8]) -> Result<(), RelayError>;

    /// Signal end of stdin.
    async fn send_eof(&mut self) -> Result<(), RelayError>;

    /// Force-close the channel. Errors are ignored.
    async fn close(&mut self);
}

/// An authenticated connection to one target host.
#[async_trait]
pub trait ShellLink: Send + Sync {
    /// Open a channel and start `command` on it.
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, RelayError>;

    /// Whether the underlying connection has been closed.
    fn is_closed(&self) -> bool;

    /// Release the connection. Safe to call more than once.
    async fn disconnect(&self);
}

/// Opens authenticated links to target hosts.
#[async_trait]
pub trait ShellBackend: Send + Sync {
    /// Connect and authenticate. Timeouts are applied by the caller.
    async fn open(&self, target: &TargetConfig) -> Result<Arc<dyn ShellLink>, RelayError>;
}
