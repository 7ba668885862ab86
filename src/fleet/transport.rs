//! Transport seams between the fleet logic and the SSH client.
//!
//! Opening a session is split into the steps the connection tester reports
//! on separately:
//!
//! 1. [`Dialer::resolve`] - DNS resolution
//! 2. [`Dialer::handshake`] - TCP connect plus SSH protocol handshake
//! 3. [`verify_host_key`] - policy check on the captured host key, before any
//!    credential leaves the process
//! 4. [`PendingConnection::authenticate`] - password or key authentication
//!
//! The russh implementation lives in [`crate::fleet::client`]; tests plug in
//! scripted fakes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::fleet::connection::{AuthMethod, ConnectionConfig};
use crate::fleet::error::FleetError;
use crate::fleet::types::HostKeyPolicy;

/// Host key presented by the server during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyInfo {
    /// `SHA256:<base64>` fingerprint.
    pub fingerprint: String,
    pub algorithm: String,
}

/// Output of one remote command, before sanitization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
    pub timed_out: bool,
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, FleetError>;

    /// Connect to `addr` and complete the SSH handshake within `timeout`.
    async fn handshake(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Box<dyn PendingConnection>, FleetError>;
}

/// A handshaken but unauthenticated connection.
#[async_trait]
pub trait PendingConnection: Send {
    fn host_key(&self) -> Option<HostKeyInfo>;

    async fn authenticate(
        self: Box<Self>,
        username: &str,
        auth: &AuthMethod,
    ) -> Result<Arc<dyn RemoteConnection>, FleetError>;

    /// Drop the connection without sending credentials.
    async fn abort(self: Box<Self>);
}

/// An authenticated connection able to run commands.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RawOutput, FleetError>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Result of checking a presented host key against the stored expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerdict {
    /// Key matches a stored fingerprint.
    Matched,
    /// First key seen under TOFU; the caller persists it.
    TrustOnFirstUse,
    /// Verification is switched off for this target.
    Skipped,
    /// Key differs from every stored fingerprint.
    Mismatch,
    /// The server presented no key that could be captured.
    Missing,
}

impl HostKeyVerdict {
    /// Whether the connection may proceed to authentication.
    pub fn allows_auth(&self) -> bool {
        matches!(
            self,
            HostKeyVerdict::Matched | HostKeyVerdict::TrustOnFirstUse | HostKeyVerdict::Skipped
        )
    }
}

/// Check a presented host key against the target's policy.
///
/// Under TOFU a key is only trusted when no fingerprint is stored yet; a known
/// but different key is a mismatch, same as under strict pinning.
pub fn verify_host_key(
    policy: HostKeyPolicy,
    known_fingerprints: &[String],
    observed: Option<&HostKeyInfo>,
) -> HostKeyVerdict {
    if policy == HostKeyPolicy::Disabled {
        return HostKeyVerdict::Skipped;
    }

    let Some(observed) = observed else {
        return HostKeyVerdict::Missing;
    };

    if known_fingerprints
        .iter()
        .any(|known| known == &observed.fingerprint)
    {
        return HostKeyVerdict::Matched;
    }

    match policy {
        HostKeyPolicy::Tofu if known_fingerprints.is_empty() => HostKeyVerdict::TrustOnFirstUse,
        _ => HostKeyVerdict::Mismatch,
    }
}

/// An authenticated connection together with how its host key was judged.
pub struct Established {
    pub connection: Arc<dyn RemoteConnection>,
    pub host_key: Option<HostKeyInfo>,
    pub verdict: HostKeyVerdict,
}

/// Resolve, handshake, verify and authenticate in one go.
///
/// Each resolved address is tried in order until one completes the
/// handshake.
pub async fn establish(
    dialer: &dyn Dialer,
    config: &ConnectionConfig,
) -> Result<Established, FleetError> {
    let addrs = dialer.resolve(&config.host, config.port).await?;

    let mut last_error = None;
    let mut pending = None;
    for addr in addrs {
        match dialer.handshake(addr, config.timeout).await {
            Ok(connection) => {
                pending = Some(connection);
                break;
            }
            Err(e) => {
                debug!("Handshake with {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    let pending = match (pending, last_error) {
        (Some(pending), _) => pending,
        (None, Some(e)) => return Err(e),
        (None, None) => {
            return Err(FleetError::from_transport(format!(
                "no addresses for {}",
                config.host
            )));
        }
    };

    let host_key = pending.host_key();
    let verdict = verify_host_key(
        config.host_key.policy,
        &config.host_key.known_fingerprints,
        host_key.as_ref(),
    );

    if !verdict.allows_auth() {
        pending.abort().await;
        let observed = host_key
            .map(|k| k.fingerprint)
            .unwrap_or_else(|| "no host key".to_string());
        warn!(
            "Refusing to authenticate to {}: host key {} not trusted",
            config.address(),
            observed
        );
        return Err(FleetError::HostKeyMismatch {
            target_id: config.target_id.clone(),
            observed,
        });
    }

    let connection = authenticate_within(pending, config).await?;

    Ok(Established {
        connection,
        host_key,
        verdict,
    })
}

/// Authenticate, bounded by the config's connect timeout.
pub(crate) async fn authenticate_within(
    pending: Box<dyn PendingConnection>,
    config: &ConnectionConfig,
) -> Result<Arc<dyn RemoteConnection>, FleetError> {
    tokio::time::timeout(
        config.timeout,
        pending.authenticate(&config.username, &config.auth),
    )
    .await
    .map_err(|_| FleetError::timeout("authentication", config.timeout.as_secs()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::testing::{FakeDialer, connection_config};

    fn key(fingerprint: &str) -> HostKeyInfo {
        HostKeyInfo {
            fingerprint: fingerprint.to_string(),
            algorithm: "ssh-ed25519".to_string(),
        }
    }

    mod verification {
        use super::*;

        #[test]
        fn test_strict_requires_match() {
            let known = vec!["SHA256:aaa".to_string()];
            assert_eq!(
                verify_host_key(HostKeyPolicy::StrictPinned, &known, Some(&key("SHA256:aaa"))),
                HostKeyVerdict::Matched
            );
            assert_eq!(
                verify_host_key(HostKeyPolicy::StrictPinned, &known, Some(&key("SHA256:bbb"))),
                HostKeyVerdict::Mismatch
            );
            assert_eq!(
                verify_host_key(HostKeyPolicy::StrictPinned, &[], Some(&key("SHA256:bbb"))),
                HostKeyVerdict::Mismatch
            );
        }

        #[test]
        fn test_tofu_trusts_first_key_only() {
            assert_eq!(
                verify_host_key(HostKeyPolicy::Tofu, &[], Some(&key("SHA256:aaa"))),
                HostKeyVerdict::TrustOnFirstUse
            );
            let known = vec!["SHA256:aaa".to_string()];
            assert_eq!(
                verify_host_key(HostKeyPolicy::Tofu, &known, Some(&key("SHA256:aaa"))),
                HostKeyVerdict::Matched
            );
            assert_eq!(
                verify_host_key(HostKeyPolicy::Tofu, &known, Some(&key("SHA256:ccc"))),
                HostKeyVerdict::Mismatch
            );
        }

        #[test]
        fn test_disabled_skips() {
            assert_eq!(
                verify_host_key(HostKeyPolicy::Disabled, &[], None),
                HostKeyVerdict::Skipped
            );
        }

        #[test]
        fn test_missing_key() {
            let verdict = verify_host_key(HostKeyPolicy::Tofu, &[], None);
            assert_eq!(verdict, HostKeyVerdict::Missing);
            assert!(!verdict.allows_auth());
        }
    }

    mod establishing {
        use super::*;

        #[tokio::test]
        async fn test_mismatch_never_authenticates() {
            let dialer = FakeDialer::new();
            let mut config = connection_config("web-1");
            config.host_key.policy = HostKeyPolicy::StrictPinned;
            config.host_key.known_fingerprints = vec!["SHA256:pinned".to_string()];

            let result = establish(&dialer, &config).await;
            assert!(matches!(result, Err(FleetError::HostKeyMismatch { .. })));
            assert_eq!(dialer.auth_attempts(), 0);
        }

        #[tokio::test]
        async fn test_tofu_first_use_connects() {
            let dialer = FakeDialer::new();
            let config = connection_config("web-1");

            let established = establish(&dialer, &config).await.unwrap();
            assert_eq!(established.verdict, HostKeyVerdict::TrustOnFirstUse);
            assert_eq!(dialer.auth_attempts(), 1);
            assert!(!established.connection.is_closed());
        }

        #[tokio::test]
        async fn test_handshake_failure_propagates() {
            let dialer = FakeDialer::new().fail_handshake("Connection refused (os error 111)");
            let config = connection_config("web-1");

            let result = establish(&dialer, &config).await;
            assert!(matches!(result, Err(FleetError::Network { .. })));
        }

        #[tokio::test]
        async fn test_auth_failure_propagates() {
            let dialer = FakeDialer::new().fail_auth();
            let config = connection_config("web-1");

            let result = establish(&dialer, &config).await;
            assert!(matches!(result, Err(FleetError::Auth(_))));
        }
    }
}
