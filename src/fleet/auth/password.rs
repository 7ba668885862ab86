//! Password-based SSH authentication.

use async_trait::async_trait;
use russh::client;

use crate::fleet::error::FleetError;
use crate::fleet::session::FleetClientHandler;

use super::traits::AuthStrategy;

/// Password authentication strategy.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<FleetClientHandler>,
        username: &str,
    ) -> Result<bool, FleetError> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| FleetError::Auth(format!("Password authentication failed: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
