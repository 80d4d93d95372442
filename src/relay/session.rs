//! One client's session: at most one shell connection bound to one WebSocket.
//!
//! A [`ClientSession`] is owned by the connection task of its socket, so its
//! mutable state (connector, target, running command) needs no locking. The
//! parts other tasks must see live on the shared
//! [`SessionHandle`](super::registry::SessionHandle).
//!
//! Every operation returns a `Result`; the router turns each error into a
//! response frame, so no failure here ends the session. Only transport close,
//! eviction, shutdown or an explicit `disconnect` does.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{ExecLimits, RelaySettings};
use super::connector::RemoteShellConnector;
use super::connector::backend::ShellBackend;
use super::error::RelayError;
use super::protocol::{ConnectRequest, DownloadBody, ServerFrame, TargetConfig};
use super::registry::SessionHandle;
use super::safety::{self, Verdict};

pub struct ClientSession {
    handle: Arc<SessionHandle>,
    backend: Arc<dyn ShellBackend>,
    connect_timeout: Duration,
    limits: ExecLimits,
    connector: Option<Arc<RemoteShellConnector>>,
    target: Option<TargetConfig>,
    running: Option<JoinHandle<()>>,
}

impl ClientSession {
    pub fn new(
        handle: Arc<SessionHandle>,
        backend: Arc<dyn ShellBackend>,
        settings: &RelaySettings,
    ) -> Self {
        Self {
            handle,
            backend,
            connect_timeout: settings.connect_timeout,
            limits: settings.exec,
            connector: None,
            target: None,
            running: None,
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn is_authenticated(&self) -> bool {
        self.connector.is_some() && self.handle.is_authenticated()
    }

    /// The connected target, while authenticated.
    pub fn target(&self) -> Option<&TargetConfig> {
        self.target.as_ref().filter(|_| self.is_authenticated())
    }

    /// Queue a frame for the client.
    pub fn reply(&self, frame: ServerFrame) {
        let kind = frame.kind();
        if !self.handle.send(frame) {
            debug!("Session {} dropped {} frame, socket closed", self.id(), kind);
        }
    }

    fn require_connector(&self) -> Result<Arc<RemoteShellConnector>, RelayError> {
        match &self.connector {
            Some(connector) if self.handle.is_authenticated() => Ok(connector.clone()),
            _ => Err(RelayError::NotAuthenticated),
        }
    }

    /// Record the outcome of a shell operation against the session state.
    fn observe<T>(&self, result: &Result<T, RelayError>) {
        if let Err(e) = result
            && e.invalidates_shell()
        {
            warn!("Session {} lost its SSH connection", self.id());
            self.handle.set_authenticated(false);
        }
    }

    /// Open a fresh SSH connection, replacing any existing one.
    ///
    /// Returns the success message for `connect_response`.
    pub async fn connect(&mut self, request: ConnectRequest) -> Result<String, RelayError> {
        let target = TargetConfig::try_from(request)?;

        if self.connector.is_some() {
            info!("Session {} reconnecting, closing previous connection", self.id());
            self.release().await;
        }

        let connector = Arc::new(RemoteShellConnector::new(self.backend.clone(), self.limits));
        if let Err(e) = connector.connect(&target, self.connect_timeout).await {
            error!(
                "Session {} failed to connect to {}: {}",
                self.id(),
                target.display_address(),
                e
            );
            return Err(e);
        }

        let message = format!("Connected to {}", target.host);
        info!("Session {} connected to {}", self.id(), target.display_address());
        self.connector = Some(connector);
        self.target = Some(target);
        self.handle.set_authenticated(true);
        Ok(message)
    }

    /// Start a command in the background.
    ///
    /// Rejections (not connected, empty, blocked, busy) are returned
    /// immediately without touching the remote host. Once started, output
    /// chunks and exactly one `command_result` are queued on the session.
    pub fn execute(&mut self, command: &str) -> Result<(), RelayError> {
        let connector = self.require_connector()?;

        let command = command.trim();
        if command.is_empty() {
            return Err(RelayError::invalid_request("No command provided"));
        }

        if let Verdict::Blocked(reason) = safety::classify(command) {
            warn!("Session {} blocked command '{}': {}", self.id(), command, reason);
            return Err(RelayError::SafetyViolation(reason));
        }

        let ticket = connector.start(command);
        self.observe(&ticket);
        let ticket = ticket?;

        info!("Session {} executing: {}", self.id(), command);

        let handle = self.handle.clone();
        self.running = Some(tokio::spawn(async move {
            let chunks = handle.clone();
            let mut relay = move |chunk: String| {
                chunks.send(ServerFrame::command_output(chunk));
            };
            let result = ticket.run(&mut relay).await;

            if let Err(e) = &result {
                if e.invalidates_shell() {
                    warn!("Session {} lost its SSH connection", handle.id());
                    handle.set_authenticated(false);
                }
                debug!("Session {} command failed: {}", handle.id(), e);
            }
            handle.touch();
            handle.send(ServerFrame::command_result(result));
        }));

        Ok(())
    }

    /// Write base64 `content` to `remote_path`. Returns the path written.
    pub async fn upload(&mut self, content: &str, remote_path: &str) -> Result<String, RelayError> {
        let connector = self.require_connector()?;

        let bytes = STANDARD
            .decode(content.trim())
            .map_err(|e| RelayError::invalid_request(format!("Invalid base64 content: {}", e)))?;

        let result = connector.upload(remote_path, &bytes).await;
        self.observe(&result);
        match result {
            Ok(()) => {
                info!(
                    "Session {} uploaded {} bytes to {}",
                    self.id(),
                    bytes.len(),
                    remote_path
                );
                Ok(remote_path.to_string())
            }
            Err(e) => {
                warn!("Session {} upload to {} failed: {}", self.id(), remote_path, e);
                Err(e)
            }
        }
    }

    /// Read `remote_path` and return it base64 encoded.
    pub async fn download(&mut self, remote_path: &str) -> Result<DownloadBody, RelayError> {
        let connector = self.require_connector()?;

        let result = connector.download(remote_path).await;
        self.observe(&result);
        match result {
            Ok(bytes) => {
                info!(
                    "Session {} downloaded {} bytes from {}",
                    self.id(),
                    bytes.len(),
                    remote_path
                );
                Ok(DownloadBody {
                    content: STANDARD.encode(&bytes),
                    path: remote_path.to_string(),
                })
            }
            Err(e) => {
                warn!("Session {} download of {} failed: {}", self.id(), remote_path, e);
                Err(e)
            }
        }
    }

    /// Close the SSH connection, cancelling any running command. Idempotent.
    ///
    /// A cancelled command has queued its `command_result` by the time this
    /// returns.
    pub async fn disconnect(&mut self) {
        self.release().await;
    }

    async fn release(&mut self) {
        if let Some(connector) = self.connector.take() {
            connector.disconnect().await;
        }
        if let Some(task) = self.running.take()
            && let Err(e) = task.await
        {
            error!("Session {} command task failed: {}", self.id(), e);
        }
        self.target = None;
        self.handle.set_authenticated(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connector::backend::ChannelEvent;
    use crate::relay::connector::testing::{ScriptedBackend, Step};
    use crate::relay::protocol::{AuthMethod, Outcome};
    use crate::relay::registry::SessionRegistry;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn settings() -> RelaySettings {
        RelaySettings {
            exec: ExecLimits {
                timeout: Duration::from_secs(300),
                max_output_bytes: 4096,
            },
            ..RelaySettings::default()
        }
    }

    fn request(host: &str) -> ConnectRequest {
        ConnectRequest {
            host: host.to_string(),
            username: "ops".to_string(),
            auth_method: Some(AuthMethod::Password),
            password: Some("pw".to_string()),
            ..ConnectRequest::default()
        }
    }

    fn session(
        registry: &SessionRegistry,
        backend: &ScriptedBackend,
    ) -> (ClientSession, UnboundedReceiver<ServerFrame>) {
        let (handle, rx) = registry.admit(None).unwrap();
        (
            ClientSession::new(handle, Arc::new(backend.clone()), &settings()),
            rx,
        )
    }

    async fn next_result(rx: &mut UnboundedReceiver<ServerFrame>) -> (Vec<String>, ServerFrame) {
        let mut chunks = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                ServerFrame::CommandOutput { data, finished } => {
                    assert!(!finished);
                    chunks.push(data);
                }
                frame => return (chunks, frame),
            }
        }
    }

    mod connect {
        use super::*;

        #[tokio::test]
        async fn test_connect_authenticates() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, _rx) = session(&registry, &backend);

            let message = session.connect(request("db-1")).await.unwrap();
            assert_eq!(message, "Connected to db-1");
            assert!(session.is_authenticated());
            assert!(session.handle().is_authenticated());
            assert_eq!(session.target().unwrap().port, 22);
        }

        #[tokio::test]
        async fn test_failed_connect_stays_unauthenticated() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new().rejecting("password credentials rejected");
            let (mut session, _rx) = session(&registry, &backend);

            let err = session.connect(request("db-1")).await.unwrap_err();
            assert!(matches!(err, RelayError::AuthenticationFailed(_)));
            assert!(!session.is_authenticated());
            assert!(session.target().is_none());
        }

        #[tokio::test]
        async fn test_unreachable_host_can_retry() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new().unreachable("Failed to connect: refused");
            let (mut session, _rx) = session(&registry, &backend);

            let err = session.connect(request("db-1")).await.unwrap_err();
            assert_eq!(err.to_string(), "Failed to connect: refused");

            // No automatic retry; a new connect makes a new attempt
            let _ = session.connect(request("db-1")).await;
            assert_eq!(backend.targets().len(), 2);
        }

        #[tokio::test]
        async fn test_invalid_request_makes_no_connection() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, _rx) = session(&registry, &backend);

            let err = session.connect(request("  ")).await.unwrap_err();
            assert_eq!(err.to_string(), "Missing required fields: host, username");
            assert!(backend.targets().is_empty());
        }

        #[tokio::test]
        async fn test_reconnect_replaces_previous_connection() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, _rx) = session(&registry, &backend);

            session.connect(request("db-1")).await.unwrap();
            session.connect(request("db-2")).await.unwrap();

            assert_eq!(backend.disconnects(), 1);
            assert_eq!(backend.targets(), vec!["ops@db-1:22", "ops@db-2:22"]);
            assert_eq!(session.target().unwrap().host, "db-2");
        }
    }

    mod execute {
        use super::*;

        #[tokio::test]
        async fn test_requires_authentication() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, _rx) = session(&registry, &backend);

            assert_eq!(
                session.execute("ls").unwrap_err(),
                RelayError::NotAuthenticated
            );
            assert!(backend.commands().is_empty());
        }

        #[tokio::test]
        async fn test_empty_command() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, _rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();

            let err = session.execute("   ").unwrap_err();
            assert_eq!(err.to_string(), "No command provided");
        }

        #[tokio::test]
        async fn test_blocked_command_never_reaches_host() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, mut rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();

            let err = session.execute("sudo RM -RF /var").unwrap_err();
            assert_eq!(err.to_string(), "Dangerous command blocked: rm -rf");
            assert!(backend.commands().is_empty());
            assert!(rx.try_recv().is_err());
            assert!(session.is_authenticated());
        }

        #[tokio::test]
        async fn test_streams_chunks_then_result() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new().with_script(|_| {
                vec![
                    Step::stdout("a.txt\n"),
                    Step::stdout("b.txt\n"),
                    Step::exit(0),
                    Step::Event(ChannelEvent::Closed),
                ]
            });
            let (mut session, mut rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();

            session.execute("  ls  ").unwrap();
            let (chunks, result) = next_result(&mut rx).await;

            assert_eq!(chunks, vec!["a.txt\n", "b.txt\n"]);
            match result {
                ServerFrame::CommandResult {
                    success: true,
                    outcome: Outcome::Success(completion),
                } => {
                    assert_eq!(completion.command, "ls");
                    assert_eq!(completion.stdout, chunks.concat());
                    assert_eq!(completion.exit_code, Some(0));
                }
                other => panic!("unexpected frame: {:?}", other),
            }
            assert_eq!(backend.commands(), vec!["ls"]);
        }

        #[tokio::test]
        async fn test_second_execute_is_busy() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new().with_script(|_| vec![Step::Pending]);
            let (mut session, _rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();

            session.execute("sleep 100").unwrap();
            assert_eq!(session.execute("ls").unwrap_err(), RelayError::Busy);
        }

        #[tokio::test]
        async fn test_disconnect_cancels_running_command() {
            let registry = SessionRegistry::new(10);
            let backend =
                ScriptedBackend::new().with_script(|_| vec![Step::stdout("tick\n"), Step::Pending]);
            let (mut session, mut rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();

            session.execute("tail -f /var/log/syslog").unwrap();
            assert_eq!(
                rx.recv().await.unwrap(),
                ServerFrame::command_output("tick\n")
            );

            session.disconnect().await;

            let (chunks, result) = next_result(&mut rx).await;
            assert!(chunks.is_empty());
            assert_eq!(
                result,
                ServerFrame::command_result(Err(RelayError::Cancelled))
            );
            assert!(rx.try_recv().is_err());
            assert!(!session.is_authenticated());

            // Idempotent
            session.disconnect().await;
        }

        #[tokio::test]
        async fn test_dead_link_unauthenticates_session() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, _rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();
            backend.kill_link();

            assert_eq!(session.execute("ls").unwrap_err(), RelayError::ShellClosed);
            assert!(!session.is_authenticated());
            assert_eq!(
                session.execute("ls").unwrap_err(),
                RelayError::NotAuthenticated
            );
        }
    }

    mod transfer {
        use super::*;

        #[tokio::test]
        async fn test_upload_decodes_base64() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, _rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();

            let path = session.upload("aGVsbG8=", "/tmp/hello").await.unwrap();
            assert_eq!(path, "/tmp/hello");
            assert_eq!(backend.stdin(), b"hello".to_vec());
        }

        #[tokio::test]
        async fn test_upload_rejects_invalid_base64() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, _rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();

            let err = session.upload("not base64!", "/tmp/x").await.unwrap_err();
            assert!(err.to_string().starts_with("Invalid base64 content"));
            assert!(backend.commands().is_empty());
        }

        #[tokio::test]
        async fn test_download_encodes_base64() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new().with_script(|_| {
                vec![
                    Step::stdout("hello"),
                    Step::exit(0),
                    Step::Event(ChannelEvent::Closed),
                ]
            });
            let (mut session, _rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();

            let body = session.download("/tmp/hello").await.unwrap();
            assert_eq!(body.content, "aGVsbG8=");
            assert_eq!(body.path, "/tmp/hello");
        }

        #[tokio::test]
        async fn test_transfer_failure_keeps_session() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new().with_script(|_| {
                vec![
                    Step::stderr("cat: /root/secret: Permission denied\n"),
                    Step::exit(1),
                    Step::Event(ChannelEvent::Closed),
                ]
            });
            let (mut session, _rx) = session(&registry, &backend);
            session.connect(request("db-1")).await.unwrap();

            let err = session.download("/root/secret").await.unwrap_err();
            assert_eq!(err.to_string(), "cat: /root/secret: Permission denied");
            assert!(session.is_authenticated());
        }

        #[tokio::test]
        async fn test_transfer_requires_authentication() {
            let registry = SessionRegistry::new(10);
            let backend = ScriptedBackend::new();
            let (mut session, _rx) = session(&registry, &backend);

            assert_eq!(
                session.download("/etc/hosts").await.unwrap_err(),
                RelayError::NotAuthenticated
            );
            assert_eq!(
                session.upload("aGk=", "/tmp/x").await.unwrap_err(),
                RelayError::NotAuthenticated
            );
        }
    }
}
