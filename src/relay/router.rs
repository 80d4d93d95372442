//! Frame dispatch between a WebSocket and its [`ClientSession`].
//!
//! The router is the only layer that speaks frames. It admits sessions through
//! the [`SessionRegistry`], decodes every inbound text frame into a
//! [`ClientFrame`], calls the matching session operation and queues exactly
//! one response frame for it (`execute` answers asynchronously through its
//! background task instead).
//!
//! | Request | Response |
//! |---------|----------|
//! | `connect` | `connect_response` |
//! | `execute` | `command_output`* then `command_result` |
//! | `upload` | `upload_response` |
//! | `download` | `download_response` |
//! | `disconnect` | `disconnect_response`, then the socket closes |
//! | `ping` | `pong` |
//! | anything else | `error` |

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use super::config::RelaySettings;
use super::connector::backend::ShellBackend;
use super::error::RelayError;
use super::protocol::{self, ClientFrame, ServerFrame};
use super::registry::SessionRegistry;
use super::session::ClientSession;

pub struct ProtocolRouter {
    registry: Arc<SessionRegistry>,
    backend: Arc<dyn ShellBackend>,
    settings: RelaySettings,
}

impl ProtocolRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        backend: Arc<dyn ShellBackend>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            registry,
            backend,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Admit a new connection and queue its `welcome` frame.
    ///
    /// On rejection the returned error is what the client must be told before
    /// its socket is closed.
    pub fn open_session(
        &self,
        remote_addr: Option<String>,
    ) -> Result<(ClientSession, UnboundedReceiver<ServerFrame>), RelayError> {
        let (handle, outbound) = match self.registry.admit(remote_addr.clone()) {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(
                    "Rejected connection from {}: {}",
                    remote_addr.as_deref().unwrap_or("unknown"),
                    e
                );
                return Err(e);
            }
        };

        let session = ClientSession::new(handle, self.backend.clone(), &self.settings);
        session.reply(ServerFrame::welcome(session.id()));
        Ok((session, outbound))
    }

    /// Handle one inbound text frame.
    pub async fn dispatch(&self, session: &mut ClientSession, text: &str) {
        let frame = match protocol::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Session {} sent an invalid frame: {}", session.id(), e);
                session.reply(ServerFrame::error(e.to_string()));
                return;
            }
        };

        debug!("Session {} received {}", session.id(), frame.kind());
        // Counted from arrival so a slow transfer is not swept as idle
        session.handle().touch();

        match frame {
            ClientFrame::Connect(request) => {
                let result = session.connect(request).await;
                session.reply(ServerFrame::connect_response(result));
            }
            ClientFrame::Execute { command } => {
                if let Err(e) = session.execute(&command) {
                    session.reply(ServerFrame::command_result(Err(e)));
                }
            }
            ClientFrame::Upload {
                content,
                remote_path,
            } => {
                let result = session.upload(&content, &remote_path).await;
                session.reply(ServerFrame::upload_response(result));
            }
            ClientFrame::Download { remote_path } => {
                let result = session.download(&remote_path).await;
                session.reply(ServerFrame::download_response(result));
            }
            ClientFrame::Disconnect {} => {
                session.disconnect().await;
                session.reply(ServerFrame::DisconnectResponse { success: true });
                session.handle().close();
            }
            ClientFrame::Ping {} => session.reply(ServerFrame::pong()),
        }

        session.handle().touch();
    }

    /// Tear down a session whose socket is going away, for any reason.
    pub async fn close_session(&self, session: &mut ClientSession) {
        session.disconnect().await;
        if self.registry.remove(session.id()).is_some() {
            info!(
                "Session {} closed ({} active)",
                session.id(),
                self.registry.len()
            );
        }
    }
}
