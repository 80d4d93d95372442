//! Remote shell connector: one SSH connection to one target host.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> Connecting -> Ready -> (Running -> Ready)* -> Closed
//! ```
//!
//! - A failed connect moves straight to `Closed`; a connector is never reused
//!   after failure, callers build a new one.
//! - Only one command runs at a time. A second [`RemoteShellConnector::start`]
//!   while one is outstanding fails with [`RelayError::Busy`] instead of queueing.
//! - [`RemoteShellConnector::disconnect`] is idempotent, valid in any state,
//!   and force-closes an in-flight run. No chunk is emitted after it.
//!
//! ## Limits
//!
//! Each run is bounded by [`ExecLimits`]: a wall-clock timeout and a combined
//! stdout/stderr byte ceiling. Exceeding either closes the channel and fails
//! the run; the connection itself stays usable.

pub mod backend;
pub mod output;
pub mod ssh;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::backend::{ChannelEvent, ExecChannel, ShellBackend, ShellLink};
use self::output::OutputBuffer;
use super::config::ExecLimits;
use super::error::RelayError;
use super::protocol::{CommandCompletion, TargetConfig, now_millis};

/// Observable connector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Ready,
    Running,
    Closed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorState::Idle => write!(f, "idle"),
            ConnectorState::Connecting => write!(f, "connecting"),
            ConnectorState::Ready => write!(f, "ready"),
            ConnectorState::Running => write!(f, "running"),
            ConnectorState::Closed => write!(f, "closed"),
        }
    }
}

enum Slot {
    Idle,
    Connecting,
    Ready(Arc<dyn ShellLink>),
    Running(Arc<dyn ShellLink>),
    Closed,
}

impl Slot {
    fn state(&self) -> ConnectorState {
        match self {
            Slot::Idle => ConnectorState::Idle,
            Slot::Connecting => ConnectorState::Connecting,
            Slot::Ready(_) => ConnectorState::Ready,
            Slot::Running(_) => ConnectorState::Running,
            Slot::Closed => ConnectorState::Closed,
        }
    }
}

/// Owns one SSH connection and runs commands on it with streamed output.
pub struct RemoteShellConnector {
    backend: Arc<dyn ShellBackend>,
    limits: ExecLimits,
    slot: Mutex<Slot>,
    cancel: CancellationToken,
}

impl RemoteShellConnector {
    pub fn new(backend: Arc<dyn ShellBackend>, limits: ExecLimits) -> Self {
        Self {
            backend,
            limits,
            slot: Mutex::new(Slot::Idle),
            cancel: CancellationToken::new(),
        }
    }

    // State transitions never await while holding the lock, so a poisoned
    // lock still holds a consistent slot.
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectorState {
        self.slot().state()
    }

    pub fn limits(&self) -> ExecLimits {
        self.limits
    }

    /// Open and authenticate the connection, bounded by `timeout`.
    ///
    /// Any failure leaves the connector `Closed`.
    pub async fn connect(&self, target: &TargetConfig, timeout: Duration) -> Result<(), RelayError> {
        {
            let mut slot = self.slot();
            if !matches!(*slot, Slot::Idle) {
                return Err(RelayError::Connection(format!(
                    "Connector is {}, create a new one to reconnect",
                    slot.state()
                )));
            }
            *slot = Slot::Connecting;
        }

        info!("Connecting to {} with timeout {:?}", target.display_address(), timeout);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            opened = tokio::time::timeout(timeout, self.backend.open(target)) => {
                match opened {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::ConnectTimeout(timeout)),
                }
            }
        };

        match result {
            Ok(link) => {
                let accepted = {
                    let mut slot = self.slot();
                    if matches!(*slot, Slot::Connecting) {
                        *slot = Slot::Ready(link.clone());
                        true
                    } else {
                        false
                    }
                };
                if accepted {
                    info!("Connected to {}", target.display_address());
                    Ok(())
                } else {
                    // Disconnected while the handshake was finishing
                    link.disconnect().await;
                    Err(RelayError::Cancelled)
                }
            }
            Err(e) => {
                *self.slot() = Slot::Closed;
                warn!("Connection to {} failed: {}", target.display_address(), e);
                Err(e)
            }
        }
    }

    /// Reserve the connection for one command.
    ///
    /// The transition to `Running` happens synchronously, so a second call
    /// observes `Busy` even before the first run is polled.
    pub fn start(self: &Arc<Self>, command: impl Into<String>) -> Result<RunTicket, RelayError> {
        let mut slot = self.slot();
        match &*slot {
            Slot::Ready(link) if link.is_closed() => {
                *slot = Slot::Closed;
                Err(RelayError::ShellClosed)
            }
            Slot::Ready(link) => {
                let link = link.clone();
                *slot = Slot::Running(link.clone());
                Ok(RunTicket {
                    connector: self.clone(),
                    link,
                    command: command.into(),
                })
            }
            Slot::Running(_) => Err(RelayError::Busy),
            Slot::Idle | Slot::Connecting => Err(RelayError::NotAuthenticated),
            Slot::Closed => Err(RelayError::ShellClosed),
        }
    }

    /// Run one command to completion, relaying stdout chunks through `on_chunk`.
    pub async fn run(
        self: &Arc<Self>,
        command: &str,
        on_chunk: &mut (dyn FnMut(String) + Send),
    ) -> Result<CommandCompletion, RelayError> {
        self.start(command)?.run(on_chunk).await
    }

    fn finish_run(&self) {
        let mut slot = self.slot();
        let link = match &*slot {
            Slot::Running(link) => link.clone(),
            _ => return,
        };
        *slot = if link.is_closed() {
            Slot::Closed
        } else {
            Slot::Ready(link)
        };
    }

    /// The live link, for operations that use their own channel.
    fn live_link(&self) -> Result<Arc<dyn ShellLink>, RelayError> {
        let mut slot = self.slot();
        let link = match &*slot {
            Slot::Ready(link) | Slot::Running(link) => link.clone(),
            Slot::Idle | Slot::Connecting => return Err(RelayError::NotAuthenticated),
            Slot::Closed => return Err(RelayError::ShellClosed),
        };
        if link.is_closed() {
            *slot = Slot::Closed;
            return Err(RelayError::ShellClosed);
        }
        Ok(link)
    }

    /// Write `content` to `remote_path` on the target.
    pub async fn upload(&self, remote_path: &str, content: &[u8]) -> Result<(), RelayError> {
        let command = format!("cat > {}", shell_quote(remote_path)?);
        self.transfer(&command, Some(content)).await.map(|_| ())
    }

    /// Read the full content of `remote_path` on the target.
    pub async fn download(&self, remote_path: &str) -> Result<Vec<u8>, RelayError> {
        let command = format!("cat {}", shell_quote(remote_path)?);
        self.transfer(&command, None).await
    }

    async fn transfer(&self, command: &str, stdin: Option<&[u8]>) -> Result<Vec<u8>, RelayError> {
        let link = self.live_link()?;
        let limits = self.limits;
        let mut channel: Option<Box<dyn ExecChannel>> = None;

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            _ = tokio::time::sleep(limits.timeout) => Err(RelayError::ExecutionTimeout(limits.timeout)),
            r = drive_transfer(link.as_ref(), command, stdin, limits.max_output_bytes, &mut channel) => r,
        };

        if let Some(mut channel) = channel.take() {
            channel.close().await;
        }

        match result {
            Err(e) if link.is_closed() && !matches!(e, RelayError::Cancelled) => {
                *self.slot() = Slot::Closed;
                Err(RelayError::ShellClosed)
            }
            other => other,
        }
    }

    /// Release the connection. Idempotent and valid in any state.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let previous = std::mem::replace(&mut *self.slot(), Slot::Closed);
        match previous {
            Slot::Ready(link) | Slot::Running(link) => {
                debug!("Closing SSH connection");
                link.disconnect().await;
            }
            Slot::Idle | Slot::Connecting | Slot::Closed => {}
        }
    }
}

/// A reserved run slot. Dropping it returns the connector to `Ready`.
pub struct RunTicket {
    connector: Arc<RemoteShellConnector>,
    link: Arc<dyn ShellLink>,
    command: String,
}

impl RunTicket {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Execute the reserved command.
    ///
    /// Emits each decoded stdout chunk through `on_chunk` as soon as it is
    /// read, then returns exactly one terminal result.
    pub async fn run(
        self,
        on_chunk: &mut (dyn FnMut(String) + Send),
    ) -> Result<CommandCompletion, RelayError> {
        let limits = self.connector.limits;
        let cancel = self.connector.cancel.clone();
        let mut output = OutputBuffer::new(limits.max_output_bytes);
        let mut exit_code: Option<i32> = None;
        let mut channel: Option<Box<dyn ExecChannel>> = None;

        debug!("Running command: {}", self.command);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            _ = tokio::time::sleep(limits.timeout) => Err(RelayError::ExecutionTimeout(limits.timeout)),
            r = drive_command(
                self.link.as_ref(),
                &self.command,
                &mut channel,
                &mut output,
                &mut exit_code,
                on_chunk,
            ) => r,
        };

        if let Some(mut channel) = channel.take() {
            channel.close().await;
        }

        if let Err(e) = result {
            match &e {
                RelayError::ExecutionTimeout(_) | RelayError::OutputTooLarge(_) => warn!(
                    "Command '{}' aborted after {} bytes: {}",
                    self.command,
                    output.total_bytes(),
                    e
                ),
                _ => debug!("Command '{}' failed: {}", self.command, e),
            }
            if self.link.is_closed() && !matches!(e, RelayError::Cancelled) {
                return Err(RelayError::ShellClosed);
            }
            return Err(e);
        }

        let tail = output.finish_stdout();
        if !tail.is_empty() && !cancel.is_cancelled() {
            on_chunk(tail);
        }

        let (stdout, stderr) = output.into_parts();
        Ok(CommandCompletion {
            command: self.command.clone(),
            stdout,
            stderr,
            exit_code,
            timestamp: now_millis(),
        })
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.connector.finish_run();
    }
}

/// Open the exec channel and read it until the remote side finishes.
async fn drive_command(
    link: &dyn ShellLink,
    command: &str,
    slot: &mut Option<Box<dyn ExecChannel>>,
    output: &mut OutputBuffer,
    exit_code: &mut Option<i32>,
    on_chunk: &mut (dyn FnMut(String) + Send),
) -> Result<(), RelayError> {
    let channel = slot.insert(link.exec(command).await?);

    loop {
        match channel.next_event().await {
            Some(ChannelEvent::Stdout(data)) => {
                let text = output.push_stdout(&data)?;
                if !text.is_empty() {
                    on_chunk(text);
                }
            }
            Some(ChannelEvent::Stderr(data)) => output.push_stderr(&data)?,
            Some(ChannelEvent::ExitStatus(code)) => *exit_code = Some(code as i32),
            Some(ChannelEvent::Eof) => {
                // Continue to wait for exit status if not received yet
                if exit_code.is_some() {
                    break;
                }
            }
            Some(ChannelEvent::Closed) | None => break,
        }
    }

    Ok(())
}

/// Run a transfer command, feeding `stdin` if given, and return its stdout.
async fn drive_transfer(
    link: &dyn ShellLink,
    command: &str,
    stdin: Option<&[u8]>,
    max_bytes: usize,
    slot: &mut Option<Box<dyn ExecChannel>>,
) -> Result<Vec<u8>, RelayError> {
    let channel = slot.insert(link.exec(command).await?);

    if let Some(data) = stdin {
        channel.write(data).await?;
    }
    channel.send_eof().await?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code: Option<u32> = None;

    loop {
        match channel.next_event().await {
            Some(ChannelEvent::Stdout(data)) => {
                if stdout.len() + data.len() > max_bytes {
                    return Err(RelayError::OutputTooLarge(max_bytes));
                }
                stdout.extend_from_slice(&data);
            }
            Some(ChannelEvent::Stderr(data)) => {
                // Error text only; keep it small
                if stderr.len() < 4096 {
                    stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelEvent::ExitStatus(code)) => exit_code = Some(code),
            Some(ChannelEvent::Eof) => {
                if exit_code.is_some() {
                    break;
                }
            }
            Some(ChannelEvent::Closed) | None => break,
        }
    }

    match exit_code {
        Some(0) => Ok(stdout),
        Some(code) => {
            let message = String::from_utf8_lossy(&stderr).trim().to_string();
            Err(RelayError::transfer(if message.is_empty() {
                format!("Transfer failed with exit status {}", code)
            } else {
                message
            }))
        }
        None => Err(RelayError::transfer(
            "Transfer ended without an exit status",
        )),
    }
}

/// Quote a path for a POSIX shell.
///
/// Single quotes inside the path are closed, emitted as a literal, and reopened.
pub(crate) fn shell_quote(path: &str) -> Result<String, RelayError> {
    if path.trim().is_empty() {
        return Err(RelayError::invalid_request("Missing remotePath"));
    }
    if path.contains('\0') {
        return Err(RelayError::invalid_request("remotePath contains a NUL byte"));
    }
    Ok(format!("'{}'", path.replace('\'', "'\"'\"'")))
}
