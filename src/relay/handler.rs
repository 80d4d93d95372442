//! russh client handler for outbound relay connections.
//!
//! # Security Note
//!
//! `RelayClientHandler` accepts every server host key, like
//! `StrictHostKeyChecking=no` in OpenSSH. The relay connects to hosts named by
//! its clients, so deployments exposed beyond a trusted network should verify
//! keys against a known_hosts store.

use russh::{client, keys};
use tracing::debug;

/// Client handler that accepts all host keys.
pub struct RelayClientHandler {
    host: String,
}

impl RelayClientHandler {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl client::Handler for RelayClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting host key {} for {}",
            server_public_key.algorithm(),
            self.host
        );
        Ok(true)
    }
}
