//! Private key SSH authentication with key material held in memory.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::relay::error::{RelayError, classify_connect_failure};
use crate::relay::handler::RelayClientHandler;

use super::traits::AuthStrategy;

/// Public key authentication using a key supplied by the client.
///
/// The key text (OpenSSH or PEM) is decoded in memory and never written to disk.
pub struct KeyAuth {
    private_key: String,
    passphrase: Option<String>,
}

impl KeyAuth {
    pub fn new(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            private_key: private_key.into(),
            passphrase,
        }
    }

    fn decode(&self) -> Result<keys::PrivateKey, RelayError> {
        keys::decode_secret_key(&self.private_key, self.passphrase.as_deref()).map_err(|e| {
            RelayError::AuthenticationFailed(format!("Failed to decode private key: {}", e))
        })
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<RelayClientHandler>,
        username: &str,
    ) -> Result<bool, RelayError> {
        let key_pair = self.decode()?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| classify_connect_failure(format!("Key authentication failed: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
