//! Connection configuration and its short-lived cache.
//!
//! A [`ConnectionConfig`] carries decrypted credentials, so it never
//! implements a revealing `Debug` and is only cached for a short TTL. The
//! cache entry is dropped explicitly when credentials rotate or a host key is
//! trusted.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::fleet::credentials::CredentialDecryptor;
use crate::fleet::error::FleetError;
use crate::fleet::repository::TargetRepository;
use crate::fleet::types::{AuthKind, HostKeyPolicy, PrivilegeMode, TargetRecord};

/// Authentication material for one target.
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    Key {
        pem: String,
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn kind(&self) -> AuthKind {
        match self {
            AuthMethod::Password(_) => AuthKind::Password,
            AuthMethod::Key {
                passphrase: None, ..
            } => AuthKind::Key,
            AuthMethod::Key {
                passphrase: Some(_),
                ..
            } => AuthKind::KeyWithPassphrase,
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthMethod::{}(<redacted>)", self.kind())
    }
}

/// Expected host identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyExpectation {
    pub policy: HostKeyPolicy,
    pub known_fingerprints: Vec<String>,
}

/// Privilege escalation available on the target.
#[derive(Clone, PartialEq, Eq)]
pub enum SudoConfig {
    Disabled,
    Passwordless,
    WithPassword(String),
}

impl SudoConfig {
    pub fn mode(&self) -> PrivilegeMode {
        match self {
            SudoConfig::Disabled => PrivilegeMode::None,
            SudoConfig::Passwordless => PrivilegeMode::SudoPasswordless,
            SudoConfig::WithPassword(_) => PrivilegeMode::SudoPassword,
        }
    }
}

impl fmt::Debug for SudoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SudoConfig::Disabled => write!(f, "SudoConfig::Disabled"),
            SudoConfig::Passwordless => write!(f, "SudoConfig::Passwordless"),
            SudoConfig::WithPassword(_) => write!(f, "SudoConfig::WithPassword(<redacted>)"),
        }
    }
}

/// Everything needed to open an authenticated session to one target.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub target_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// TCP connect + handshake timeout, also applied to authentication.
    pub timeout: Duration,
    pub host_key: HostKeyExpectation,
    pub sudo: SudoConfig,
}

impl ConnectionConfig {
    /// Build a config from a target record, decrypting its secrets.
    pub fn from_record(
        record: &TargetRecord,
        decryptor: &dyn CredentialDecryptor,
        timeout: Duration,
    ) -> Result<Self, FleetError> {
        let secret = decryptor.decrypt(&record.encrypted_secret)?;

        let auth = match record.auth_kind {
            AuthKind::Password => AuthMethod::Password(secret),
            AuthKind::Key => AuthMethod::Key {
                pem: secret,
                passphrase: None,
            },
            AuthKind::KeyWithPassphrase => {
                let encrypted = record.encrypted_passphrase.as_deref().ok_or_else(|| {
                    FleetError::Credential(format!(
                        "target {} uses a passphrase-protected key but has no passphrase",
                        record.id
                    ))
                })?;
                AuthMethod::Key {
                    pem: secret,
                    passphrase: Some(decryptor.decrypt(encrypted)?),
                }
            }
        };

        let sudo = match record.privilege_mode {
            PrivilegeMode::None => SudoConfig::Disabled,
            PrivilegeMode::SudoPasswordless => SudoConfig::Passwordless,
            PrivilegeMode::SudoPassword => match (&record.encrypted_sudo_password, &auth) {
                (Some(encrypted), _) => SudoConfig::WithPassword(decryptor.decrypt(encrypted)?),
                // Password logins reuse the login password for sudo
                (None, AuthMethod::Password(password)) => {
                    SudoConfig::WithPassword(password.clone())
                }
                (None, AuthMethod::Key { .. }) => {
                    warn!(
                        "Target {} requests sudo with a password but none is stored; privilege escalation disabled",
                        record.id
                    );
                    SudoConfig::Disabled
                }
            },
        };

        Ok(Self {
            target_id: record.id.clone(),
            host: record.host.clone(),
            port: record.port,
            username: record.username.clone(),
            auth,
            timeout,
            host_key: HostKeyExpectation {
                policy: record.host_key_policy,
                known_fingerprints: record.known_fingerprints.clone(),
            },
            sudo,
        })
    }

    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

struct CachedConfig {
    config: Arc<ConnectionConfig>,
    expires_at: Instant,
}

/// Resolves target ids to connection configs, caching them for a short TTL.
pub struct ConnectionConfigResolver {
    repo: Arc<dyn TargetRepository>,
    decryptor: Arc<dyn CredentialDecryptor>,
    cache: DashMap<String, CachedConfig>,
    ttl: Duration,
    connect_timeout: Duration,
}

impl ConnectionConfigResolver {
    pub fn new(
        repo: Arc<dyn TargetRepository>,
        decryptor: Arc<dyn CredentialDecryptor>,
        ttl: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            decryptor,
            cache: DashMap::new(),
            ttl,
            connect_timeout,
        }
    }

    /// Return the cached config for `target_id`, or load and decrypt it.
    pub async fn resolve(&self, target_id: &str) -> Result<Arc<ConnectionConfig>, FleetError> {
        if let Some(entry) = self.cache.get(target_id)
            && entry.expires_at > Instant::now()
        {
            return Ok(entry.config.clone());
        }

        let record = self
            .repo
            .get_target(target_id)
            .await?
            .ok_or_else(|| FleetError::TargetNotFound(target_id.to_string()))?;

        let config = Arc::new(ConnectionConfig::from_record(
            &record,
            self.decryptor.as_ref(),
            self.connect_timeout,
        )?);

        self.cache.insert(
            target_id.to_string(),
            CachedConfig {
                config: config.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!("Resolved connection config for {}", config.address());
        Ok(config)
    }

    /// Drop the cached config so the next resolve reloads credentials.
    pub fn invalidate(&self, target_id: &str) {
        if self.cache.remove(target_id).is_some() {
            debug!("Invalidated connection config for {}", target_id);
        }
    }

    /// Persist a host key accepted on first use and drop the stale config.
    pub async fn trust_host_key(&self, target_id: &str, fingerprint: &str) -> Result<(), FleetError> {
        self.repo.trust_host_key(target_id, fingerprint).await?;
        self.invalidate(target_id);
        info!("Trusted host key {} for target {}", fingerprint, target_id);
        Ok(())
    }

    pub(crate) fn repository(&self) -> &Arc<dyn TargetRepository> {
        &self.repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::credentials::PassthroughDecryptor;
    use crate::fleet::repository::InMemoryRepository;
    use crate::fleet::testing::target;

    fn resolver(repo: Arc<InMemoryRepository>, ttl: Duration) -> ConnectionConfigResolver {
        ConnectionConfigResolver::new(
            repo,
            Arc::new(PassthroughDecryptor),
            ttl,
            Duration::from_secs(10),
        )
    }

    mod from_record {
        use super::*;

        #[test]
        fn test_password_target() {
            let record = target("web-1");
            let config =
                ConnectionConfig::from_record(&record, &PassthroughDecryptor, Duration::from_secs(5))
                    .unwrap();
            assert_eq!(config.auth.kind(), AuthKind::Password);
            assert_eq!(config.sudo, SudoConfig::Disabled);
            assert_eq!(config.address(), "ops@10.0.0.1:22");
        }

        #[test]
        fn test_passphrase_key_requires_passphrase() {
            let mut record = target("web-1");
            record.auth_kind = AuthKind::KeyWithPassphrase;
            let result =
                ConnectionConfig::from_record(&record, &PassthroughDecryptor, Duration::from_secs(5));
            assert!(matches!(result, Err(FleetError::Credential(_))));

            record.encrypted_passphrase = Some("phrase".into());
            let config =
                ConnectionConfig::from_record(&record, &PassthroughDecryptor, Duration::from_secs(5))
                    .unwrap();
            assert_eq!(config.auth.kind(), AuthKind::KeyWithPassphrase);
        }

        #[test]
        fn test_sudo_password_reuses_login_password() {
            let mut record = target("web-1");
            record.privilege_mode = PrivilegeMode::SudoPassword;
            let config =
                ConnectionConfig::from_record(&record, &PassthroughDecryptor, Duration::from_secs(5))
                    .unwrap();
            assert_eq!(config.sudo, SudoConfig::WithPassword("secret".into()));
        }

        #[test]
        fn test_debug_redacts_secrets() {
            let mut record = target("web-1");
            record.privilege_mode = PrivilegeMode::SudoPassword;
            let config =
                ConnectionConfig::from_record(&record, &PassthroughDecryptor, Duration::from_secs(5))
                    .unwrap();
            let debug = format!("{:?}", config);
            assert!(!debug.contains("secret"));
            assert!(debug.contains("<redacted>"));
        }
    }

    mod cache {
        use super::*;

        #[tokio::test]
        async fn test_cached_until_invalidated() {
            let repo = Arc::new(InMemoryRepository::with_targets([target("web-1")]));
            let resolver = resolver(repo.clone(), Duration::from_secs(60));

            let first = resolver.resolve("web-1").await.unwrap();

            let mut rotated = target("web-1");
            rotated.encrypted_secret = "rotated".into();
            repo.upsert_target(rotated);

            let second = resolver.resolve("web-1").await.unwrap();
            assert!(Arc::ptr_eq(&first, &second));

            resolver.invalidate("web-1");
            let third = resolver.resolve("web-1").await.unwrap();
            assert!(matches!(&third.auth, AuthMethod::Password(p) if p == "rotated"));
        }

        #[tokio::test]
        async fn test_expired_entry_reloads() {
            let repo = Arc::new(InMemoryRepository::with_targets([target("web-1")]));
            let resolver = resolver(repo, Duration::ZERO);

            let first = resolver.resolve("web-1").await.unwrap();
            let second = resolver.resolve("web-1").await.unwrap();
            assert!(!Arc::ptr_eq(&first, &second));
        }

        #[tokio::test]
        async fn test_unknown_target() {
            let repo = Arc::new(InMemoryRepository::new());
            let resolver = resolver(repo, Duration::from_secs(60));
            assert!(matches!(
                resolver.resolve("ghost").await,
                Err(FleetError::TargetNotFound(_))
            ));
        }

        #[tokio::test]
        async fn test_trust_host_key_invalidates() {
            let repo = Arc::new(InMemoryRepository::with_targets([target("web-1")]));
            let resolver = resolver(repo, Duration::from_secs(60));

            let before = resolver.resolve("web-1").await.unwrap();
            assert!(before.host_key.known_fingerprints.is_empty());

            resolver.trust_host_key("web-1", "SHA256:abc").await.unwrap();
            let after = resolver.resolve("web-1").await.unwrap();
            assert_eq!(after.host_key.known_fingerprints, vec!["SHA256:abc".to_string()]);
        }
    }
}
