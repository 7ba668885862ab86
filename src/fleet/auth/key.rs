//! Private key SSH authentication.
//!
//! Keys arrive decrypted from the credential store as PEM/OpenSSH text and
//! are never written to disk.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::fleet::error::FleetError;
use crate::fleet::session::FleetClientHandler;

use super::traits::AuthStrategy;

/// In-memory private key authentication strategy.
pub struct KeyAuth {
    pem: String,
    passphrase: Option<String>,
}

impl KeyAuth {
    pub fn new(pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            pem: pem.into(),
            passphrase,
        }
    }

    fn decode(&self) -> Result<keys::PrivateKey, FleetError> {
        keys::decode_secret_key(&self.pem, self.passphrase.as_deref())
            .map_err(|e| FleetError::Credential(format!("Failed to decode private key: {}", e)))
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<FleetClientHandler>,
        username: &str,
    ) -> Result<bool, FleetError> {
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
            .map_err(|e| FleetError::Auth(format!("Key authentication failed: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        if self.passphrase.is_some() {
            "key+passphrase"
        } else {
            "key"
        }
    }
}
