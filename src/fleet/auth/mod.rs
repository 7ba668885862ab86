//! Authentication strategies for SSH connections.
//!
//! Each [`AuthMethod`](crate::fleet::connection::AuthMethod) variant maps to
//! one strategy:
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: In-memory private key, optionally passphrase protected

mod key;
mod password;
mod traits;

pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;

use crate::fleet::connection::AuthMethod;

/// Pick the strategy for an auth method.
pub fn strategy_for(auth: &AuthMethod) -> Box<dyn AuthStrategy> {
    match auth {
        AuthMethod::Password(password) => Box::new(PasswordAuth::new(password.clone())),
        AuthMethod::Key { pem, passphrase } => {
            Box::new(KeyAuth::new(pem.clone(), passphrase.clone()))
        }
    }
}
