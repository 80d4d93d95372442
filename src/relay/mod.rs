//! WebSocket relay to SSH.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Settings resolution with environment variable support
//! - `error`: Error taxonomy and connect failure classification
//! - `safety`: Advisory command classifier
//! - `protocol`: Wire frames and target validation
//! - `auth`: SSH authentication strategies
//! - `handler`: russh client handler
//! - `connector`: One SSH connection with bounded, streamed command runs
//! - `session`: Per-client session operations
//! - `registry`: Admission, idle eviction and shutdown of sessions
//! - `router`: Frame decoding and dispatch
//! - `server`: poem routes and the WebSocket pump

pub mod auth;
pub mod config;
pub mod connector;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod safety;
pub mod server;
pub mod session;

pub use config::RelaySettings;
pub use connector::RemoteShellConnector;
pub use connector::ssh::SshBackend;
pub use error::RelayError;
pub use registry::SessionRegistry;
pub use router::ProtocolRouter;
pub use session::ClientSession;
