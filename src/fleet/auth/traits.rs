//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::fleet::error::FleetError;
use crate::fleet::session::FleetClientHandler;

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
    /// * `Ok(false)` - Authentication failed (credentials rejected)
    /// * `Err(error)` - Error during authentication attempt
    async fn authenticate(
        &self,
        handle: &mut client::Handle<FleetClientHandler>,
        username: &str,
    ) -> Result<bool, FleetError>;

    /// Get the name of this authentication strategy.
    ///
    /// Used for logging and error messages.
    fn name(&self) -> &'static str;
}
