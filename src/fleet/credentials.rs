//! Credential decryption collaborator.

use crate::fleet::error::FleetError;

/// Turns stored ciphertext into usable secrets.
///
/// The real key management lives outside this crate; implementations must be
/// cheap enough to call on every connection config cache miss.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, FleetError>;
}

/// Decryptor for inventories that store secrets in plain text.
///
/// Used by the standalone binaries, where the inventory file is already
/// protected by filesystem permissions.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDecryptor;

impl CredentialDecryptor for PassthroughDecryptor {
    fn decrypt(&self, ciphertext: &str) -> Result<String, FleetError> {
        if ciphertext.is_empty() {
            return Err(FleetError::Credential("empty secret".to_string()));
        }
        Ok(ciphertext.to_string())
    }
}
