//! Wire frames exchanged over the WebSocket.
//!
//! Every frame is a JSON object whose `type` field selects the variant.
//! Inbound frames decode into [`ClientFrame`], a closed set of request kinds;
//! anything else is rejected with a [`RelayError::Protocol`] before any session
//! state is touched. Outbound frames are [`ServerFrame`]s.
//!
//! Field names on the wire are camelCase (`authMethod`, `remotePath`,
//! `exitCode`, `clientId`). Timestamps are Unix epoch milliseconds.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::RelayError;

/// Default SSH port used when `port` is omitted.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Request kinds a client may send, by wire name.
pub const REQUEST_TYPES: &[&str] = &[
    "connect",
    "execute",
    "upload",
    "download",
    "disconnect",
    "ping",
];

/// Current time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// How the relay authenticates against the target host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    Key,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password => write!(f, "password"),
            AuthMethod::Key => write!(f, "key"),
        }
    }
}

/// Body of a `connect` frame.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub auth_method: Option<AuthMethod>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    /// Passphrase protecting `private_key`, if any
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Decoded inbound frame.
#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect(ConnectRequest),
    #[serde(rename_all = "camelCase")]
    Execute {
        #[serde(default)]
        command: String,
    },
    #[serde(rename_all = "camelCase")]
    Upload {
        #[serde(default)]
        content: String,
        #[serde(default)]
        remote_path: String,
    },
    #[serde(rename_all = "camelCase")]
    Download {
        #[serde(default)]
        remote_path: String,
    },
    Disconnect {},
    Ping {},
}

impl ClientFrame {
    /// Wire name of this request kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Connect(_) => "connect",
            ClientFrame::Execute { .. } => "execute",
            ClientFrame::Upload { .. } => "upload",
            ClientFrame::Download { .. } => "download",
            ClientFrame::Disconnect {} => "disconnect",
            ClientFrame::Ping {} => "ping",
        }
    }
}

/// Decode one inbound text frame.
///
/// The `type` tag is checked against [`REQUEST_TYPES`] first so an unknown kind
/// is reported by name instead of as a generic serde error.
pub fn decode(text: &str) -> Result<ClientFrame, RelayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RelayError::protocol(format!("Invalid JSON frame: {}", e)))?;

    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => {
            return Err(RelayError::protocol(format!(
                "Unknown message type: {}",
                other
            )));
        }
        None => return Err(RelayError::protocol("Missing message type")),
    };

    if !REQUEST_TYPES.contains(&kind.as_str()) {
        return Err(RelayError::protocol(format!(
            "Unknown message type: {}",
            kind
        )));
    }

    serde_json::from_value(value)
        .map_err(|e| RelayError::protocol(format!("Invalid {} request: {}", kind, e)))
}

/// Target host and credentials for one SSH connection.
///
/// Held in memory for the lifetime of the session only.
#[derive(Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

/// Credential material matching an [`AuthMethod`].
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    Key {
        private_key: String,
        passphrase: Option<String>,
    },
}

impl Credential {
    pub fn method(&self) -> AuthMethod {
        match self {
            Credential::Password(_) => AuthMethod::Password,
            Credential::Key { .. } => AuthMethod::Key,
        }
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credential material is never printed
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.credential.method())
            .finish()
    }
}

impl TargetConfig {
    /// `user@host:port`, for logs and messages.
    pub fn display_address(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl TryFrom<ConnectRequest> for TargetConfig {
    type Error = RelayError;

    fn try_from(request: ConnectRequest) -> Result<Self, Self::Error> {
        let host = request.host.trim().to_string();
        let username = request.username.trim().to_string();
        if host.is_empty() || username.is_empty() {
            return Err(RelayError::invalid_request(
                "Missing required fields: host, username",
            ));
        }

        let method = match request.auth_method {
            Some(method) => method,
            None if request.password.is_some() => AuthMethod::Password,
            None if request.private_key.is_some() => AuthMethod::Key,
            None => {
                return Err(RelayError::invalid_request(
                    "Missing credentials for authentication",
                ));
            }
        };

        let credential = match method {
            AuthMethod::Password => Credential::Password(request.password.ok_or_else(|| {
                RelayError::invalid_request("Missing password for password authentication")
            })?),
            AuthMethod::Key => Credential::Key {
                private_key: request.private_key.ok_or_else(|| {
                    RelayError::invalid_request("Missing privateKey for key authentication")
                })?,
                passphrase: request.passphrase,
            },
        };

        Ok(TargetConfig {
            host,
            port: request.port.unwrap_or(DEFAULT_SSH_PORT),
            username,
            credential,
        })
    }
}

/// Either a success body or an error string, flattened into a response frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outcome<T> {
    Success(T),
    Failure { error: String },
}

impl<T> Outcome<T> {
    fn from_result(result: Result<T, RelayError>) -> (bool, Self) {
        match result {
            Ok(body) => (true, Outcome::Success(body)),
            Err(e) => (
                false,
                Outcome::Failure {
                    error: e.to_string(),
                },
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectBody {
    pub message: String,
}

/// Aggregate result of one completed command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCompletion {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the remote side closed without reporting a status
    pub exit_code: Option<i32>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadBody {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadBody {
    /// Base64 file content
    pub content: String,
    pub path: String,
}

/// Frames sent from the relay to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Welcome {
        client_id: String,
        server_version: String,
        timestamp: i64,
    },
    ConnectResponse {
        success: bool,
        #[serde(flatten)]
        outcome: Outcome<ConnectBody>,
    },
    CommandOutput {
        data: String,
        finished: bool,
    },
    CommandResult {
        success: bool,
        #[serde(flatten)]
        outcome: Outcome<CommandCompletion>,
    },
    UploadResponse {
        success: bool,
        #[serde(flatten)]
        outcome: Outcome<UploadBody>,
    },
    DownloadResponse {
        success: bool,
        #[serde(flatten)]
        outcome: Outcome<DownloadBody>,
    },
    DisconnectResponse {
        success: bool,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        message: String,
    },
    ServerShutdown {
        message: String,
    },
}

impl ServerFrame {
    pub fn welcome(client_id: impl Into<String>) -> Self {
        ServerFrame::Welcome {
            client_id: client_id.into(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn connect_response(result: Result<String, RelayError>) -> Self {
        let (success, outcome) =
            Outcome::from_result(result.map(|message| ConnectBody { message }));
        ServerFrame::ConnectResponse { success, outcome }
    }

    /// One incremental stdout chunk of a running command.
    pub fn command_output(data: impl Into<String>) -> Self {
        ServerFrame::CommandOutput {
            data: data.into(),
            finished: false,
        }
    }

    pub fn command_result(result: Result<CommandCompletion, RelayError>) -> Self {
        let (success, outcome) = Outcome::from_result(result);
        ServerFrame::CommandResult { success, outcome }
    }

    pub fn upload_response(result: Result<String, RelayError>) -> Self {
        let (success, outcome) = Outcome::from_result(result.map(|path| UploadBody { path }));
        ServerFrame::UploadResponse { success, outcome }
    }

    pub fn download_response(result: Result<DownloadBody, RelayError>) -> Self {
        let (success, outcome) = Outcome::from_result(result);
        ServerFrame::DownloadResponse { success, outcome }
    }

    pub fn pong() -> Self {
        ServerFrame::Pong {
            timestamp: now_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    pub fn server_shutdown() -> Self {
        ServerFrame::ServerShutdown {
            message: "Server is shutting down".to_string(),
        }
    }

    /// Wire name of this frame kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Welcome { .. } => "welcome",
            ServerFrame::ConnectResponse { .. } => "connect_response",
            ServerFrame::CommandOutput { .. } => "command_output",
            ServerFrame::CommandResult { .. } => "command_result",
            ServerFrame::UploadResponse { .. } => "upload_response",
            ServerFrame::DownloadResponse { .. } => "download_response",
            ServerFrame::DisconnectResponse { .. } => "disconnect_response",
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::Error { .. } => "error",
            ServerFrame::ServerShutdown { .. } => "server_shutdown",
        }
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            // Only reachable if a body fails to serialize, which plain data cannot
            format!(
                r#"{{"type":"error","message":"Failed to encode {} frame: {}"}}"#,
                self.kind(),
                e
            )
        })
    }
}
