//! Scripted transport fakes and fixtures shared by the unit tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::fleet::connection::{AuthMethod, ConnectionConfig, HostKeyExpectation, SudoConfig};
use crate::fleet::error::FleetError;
use crate::fleet::transport::{
    Dialer, HostKeyInfo, PendingConnection, RawOutput, RemoteConnection,
};
use crate::fleet::types::{AuthKind, HostKeyPolicy, PlatformType, PrivilegeMode, TargetRecord};

pub(crate) const FAKE_FINGERPRINT: &str = "SHA256:fakeHostKeyFingerprint";

/// Password-authenticated Linux target at 10.0.0.1 with default settings.
pub(crate) fn target(id: &str) -> TargetRecord {
    TargetRecord {
        id: id.to_string(),
        name: Some(format!("{} server", id)),
        host: "10.0.0.1".to_string(),
        port: 22,
        username: "ops".to_string(),
        auth_kind: AuthKind::Password,
        encrypted_secret: "secret".to_string(),
        encrypted_passphrase: None,
        platform: PlatformType::Linux,
        metrics_enabled: false,
        metrics_interval_secs: None,
        alert_cpu_threshold: 90.0,
        alert_ram_threshold: 90.0,
        alert_disk_threshold: 90.0,
        host_key_policy: HostKeyPolicy::Tofu,
        known_fingerprints: Vec::new(),
        privilege_mode: PrivilegeMode::None,
        encrypted_sudo_password: None,
        metrics_disabled_reason: None,
    }
}

pub(crate) fn metrics_target(id: &str) -> TargetRecord {
    let mut record = target(id);
    record.metrics_enabled = true;
    record.known_fingerprints = vec![FAKE_FINGERPRINT.to_string()];
    record
}

pub(crate) fn connection_config(id: &str) -> ConnectionConfig {
    ConnectionConfig {
        target_id: id.to_string(),
        host: "10.0.0.1".to_string(),
        port: 22,
        username: "ops".to_string(),
        auth: AuthMethod::Password("secret".to_string()),
        timeout: Duration::from_secs(5),
        host_key: HostKeyExpectation {
            policy: HostKeyPolicy::Tofu,
            known_fingerprints: Vec::new(),
        },
        sudo: SudoConfig::Disabled,
    }
}

/// Metrics script output for a healthy host.
pub(crate) const HEALTHY_METRICS_OUTPUT: &str =
    "5.0\n4\n0.1 0.2 0.3\n8000 4000 4000 3500\n0 0\n100 50 50 50.0\n3600\n120\nUbuntu\n5.4.0\n1000 2000\n";

#[derive(Clone)]
enum Scripted {
    Output(RawOutput),
    Error(String),
}

struct FakeState {
    host_key: Mutex<Option<HostKeyInfo>>,
    dns_error: Mutex<Option<String>>,
    handshake_error: Mutex<Option<String>>,
    auth_ok: AtomicBool,
    exec_delay: Mutex<Option<Duration>>,
    /// Checked newest first; the first entry whose key the command contains wins.
    responses: Mutex<Vec<(String, Scripted)>>,
    executed: Mutex<Vec<(String, Option<Vec<u8>>)>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    handshakes: AtomicUsize,
    auth_attempts: AtomicUsize,
}

/// Dialer whose connections answer from a response script.
#[derive(Clone)]
pub(crate) struct FakeDialer {
    state: Arc<FakeState>,
}

impl FakeDialer {
    pub(crate) fn new() -> Self {
        let dialer = Self {
            state: Arc::new(FakeState {
                host_key: Mutex::new(Some(HostKeyInfo {
                    fingerprint: FAKE_FINGERPRINT.to_string(),
                    algorithm: "ssh-ed25519".to_string(),
                })),
                dns_error: Mutex::new(None),
                handshake_error: Mutex::new(None),
                auth_ok: AtomicBool::new(true),
                exec_delay: Mutex::new(None),
                responses: Mutex::new(Vec::new()),
                executed: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                handshakes: AtomicUsize::new(0),
                auth_attempts: AtomicUsize::new(0),
            }),
        };
        dialer
            .respond("whoami", "ops\n", 0)
            .respond("uname -a", "Linux web-1 5.15.0-91-generic x86_64 GNU/Linux\n", 0)
            .respond("sudo", "root\n", 0)
            .respond("vmstat", HEALTHY_METRICS_OUTPUT, 0)
    }

    pub(crate) fn with_host_key(self, fingerprint: &str) -> Self {
        *self.state.host_key.lock().unwrap() = Some(HostKeyInfo {
            fingerprint: fingerprint.to_string(),
            algorithm: "ssh-ed25519".to_string(),
        });
        self
    }

    pub(crate) fn fail_dns(self, message: &str) -> Self {
        *self.state.dns_error.lock().unwrap() = Some(message.to_string());
        self
    }

    pub(crate) fn fail_handshake(self, message: &str) -> Self {
        self.set_handshake_error(Some(message));
        self
    }

    pub(crate) fn fail_auth(self) -> Self {
        self.state.auth_ok.store(false, Ordering::SeqCst);
        self
    }

    pub(crate) fn exec_delay(self, delay: Duration) -> Self {
        *self.state.exec_delay.lock().unwrap() = Some(delay);
        self
    }

    pub(crate) fn respond(self, key: &str, stdout: &str, exit_code: u32) -> Self {
        self.script(
            key,
            Scripted::Output(RawOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(exit_code),
                timed_out: false,
            }),
        );
        self
    }

    pub(crate) fn respond_with_stderr(self, key: &str, stderr: &str, exit_code: u32) -> Self {
        self.script(
            key,
            Scripted::Output(RawOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code: Some(exit_code),
                timed_out: false,
            }),
        );
        self
    }

    pub(crate) fn respond_error(self, key: &str, message: &str) -> Self {
        self.set_error(key, message);
        self
    }

    /// Make commands containing `key` fail with a transport error from now on.
    pub(crate) fn set_error(&self, key: &str, message: &str) {
        self.script(key, Scripted::Error(message.to_string()));
    }

    pub(crate) fn set_response(&self, key: &str, stdout: &str) {
        self.script(
            key,
            Scripted::Output(RawOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(0),
                timed_out: false,
            }),
        );
    }

    pub(crate) fn set_handshake_error(&self, message: Option<&str>) {
        *self.state.handshake_error.lock().unwrap() = message.map(str::to_string);
    }

    fn script(&self, key: &str, response: Scripted) {
        self.state
            .responses
            .lock()
            .unwrap()
            .push((key.to_string(), response));
    }

    pub(crate) fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub(crate) fn auth_attempts(&self) -> usize {
        self.state.auth_attempts.load(Ordering::SeqCst)
    }

    /// Commands executed so far, in order.
    pub(crate) fn executed(&self) -> Vec<String> {
        self.state
            .executed
            .lock()
            .unwrap()
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }

    pub(crate) fn stdin_for(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .executed
            .lock()
            .unwrap()
            .iter()
            .find(|(command, _)| command.contains(key))
            .and_then(|(_, stdin)| stdin.clone())
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.state
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Simulate every live transport dropping.
    pub(crate) fn drop_all_connections(&self) {
        for connection in self.state.connections.lock().unwrap().iter() {
            connection.closed.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn resolve(&self, _host: &str, port: u16) -> Result<Vec<SocketAddr>, FleetError> {
        if let Some(message) = self.state.dns_error.lock().unwrap().clone() {
            return Err(FleetError::from_transport(message));
        }
        Ok(vec![SocketAddr::from(([10, 0, 0, 1], port))])
    }

    async fn handshake(
        &self,
        _addr: SocketAddr,
        _timeout: Duration,
    ) -> Result<Box<dyn PendingConnection>, FleetError> {
        self.state.handshakes.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.state.handshake_error.lock().unwrap().clone() {
            return Err(FleetError::from_transport(message));
        }
        let host_key = self.state.host_key.lock().unwrap().clone();
        Ok(Box::new(FakePending {
            state: self.state.clone(),
            host_key,
        }))
    }
}

struct FakePending {
    state: Arc<FakeState>,
    host_key: Option<HostKeyInfo>,
}

#[async_trait]
impl PendingConnection for FakePending {
    fn host_key(&self) -> Option<HostKeyInfo> {
        self.host_key.clone()
    }

    async fn authenticate(
        self: Box<Self>,
        username: &str,
        _auth: &AuthMethod,
    ) -> Result<Arc<dyn RemoteConnection>, FleetError> {
        self.state.auth_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.state.auth_ok.load(Ordering::SeqCst) {
            return Err(FleetError::Auth(format!(
                "password authentication failed for {}",
                username
            )));
        }
        let connection = Arc::new(FakeConnection {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        });
        self.state
            .connections
            .lock()
            .unwrap()
            .push(connection.clone());
        Ok(connection)
    }

    async fn abort(self: Box<Self>) {}
}

pub(crate) struct FakeConnection {
    state: Arc<FakeState>,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RawOutput, FleetError> {
        if self.is_closed() {
            return Err(FleetError::from_transport("channel closed"));
        }
        self.state
            .executed
            .lock()
            .unwrap()
            .push((command.to_string(), stdin.map(<[u8]>::to_vec)));

        let delay = *self.state.exec_delay.lock().unwrap();
        if let Some(delay) = delay
            && tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .is_err()
        {
            return Ok(RawOutput {
                timed_out: true,
                ..Default::default()
            });
        }

        let scripted = self
            .state
            .responses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(key, _)| command.contains(key.as_str()))
            .map(|(_, response)| response.clone());

        match scripted {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::Error(message)) => Err(FleetError::from_transport(message)),
            None => Ok(RawOutput {
                exit_code: Some(0),
                ..Default::default()
            }),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
