//! Authentication strategies for relay SSH connections.
//!
//! Each supported [`AuthMethod`](crate::relay::protocol::AuthMethod) maps to
//! one [`AuthStrategy`] implementation:
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: Private key supplied inline by the client

mod key;
mod password;
mod traits;

pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;

use super::protocol::Credential;

/// Build the strategy matching a target's credential.
pub fn strategy_for(credential: &Credential) -> Box<dyn AuthStrategy> {
    match credential {
        Credential::Password(password) => Box::new(PasswordAuth::new(password.clone())),
        Credential::Key {
            private_key,
            passphrase,
        } => Box::new(KeyAuth::new(private_key.clone(), passphrase.clone())),
    }
}
