//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::relay::error::RelayError;
use crate::relay::handler::RelayClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Credentials were rejected by the server
    /// * `Err(error)` - The attempt itself failed (bad key material, transport error)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<RelayClientHandler>,
        username: &str,
    ) -> Result<bool, RelayError>;

    /// Get the name of this authentication strategy.
    ///
    /// Used for logging and error messages.
    fn name(&self) -> &'static str;
}
