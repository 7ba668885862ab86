//! russh implementation of the transport seams.
//!
//! ## Connection Lifecycle
//!
//! 1. **Resolution**: `tokio::net::lookup_host` turns the target host into
//!    socket addresses.
//! 2. **TCP + Handshake**: a `TcpStream` is opened with the connect timeout and
//!    handed to `client::connect_stream`, so TCP failures and SSH protocol
//!    failures surface separately.
//! 3. **Authentication**: the strategy matching the target's
//!    [`AuthMethod`] runs against the handle.
//! 4. **Command Execution**: each command opens its own session channel;
//!    stdout, stderr and the exit status are collected until the channel
//!    closes or the timeout fires.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::fleet::auth::strategy_for;
use crate::fleet::connection::AuthMethod;
use crate::fleet::error::{FleetError, TransportErrorKind};
use crate::fleet::session::{FleetClientHandler, HostKeySlot};
use crate::fleet::transport::{
    Dialer, HostKeyInfo, PendingConnection, RawOutput, RemoteConnection,
};

/// Build russh client configuration with the specified settings.
///
/// Creates an `Arc<client::Config>` with:
/// - Inactivity timeout set to the provided `timeout` (or `None` if `persistent` is true)
/// - Keepalive interval of 30 seconds with max 3 keepalives
/// - Compression preference based on `compress` flag (ZLIB if enabled, NONE if disabled)
///
/// Pooled sessions are persistent: they sit idle between commands and are
/// reaped by the pool sweeper, while keepalives detect dead peers.
pub(crate) fn build_client_config(
    timeout: Duration,
    compress: bool,
    persistent: bool,
) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    let inactivity_timeout = if persistent { None } else { Some(timeout) };

    Arc::new(client::Config {
        inactivity_timeout,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Dialer opening real SSH connections.
#[derive(Debug, Clone)]
pub struct SshDialer {
    compress: bool,
    persistent: bool,
}

impl SshDialer {
    pub fn new(compress: bool) -> Self {
        Self {
            compress,
            persistent: true,
        }
    }

    /// Dialer for one-shot connections that should not outlive inactivity.
    pub fn one_shot(compress: bool) -> Self {
        Self {
            compress,
            persistent: false,
        }
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, FleetError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                FleetError::from_transport(format!("failed to lookup address {}: {}", host, e))
            })?
            .collect();

        if addrs.is_empty() {
            return Err(FleetError::from_transport(format!("no addresses for {}", host)));
        }
        Ok(addrs)
    }

    async fn handshake(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Box<dyn PendingConnection>, FleetError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FleetError::Network {
                kind: TransportErrorKind::TimedOut,
                message: format!("TCP connect to {} timed out after {:?}", addr, timeout),
            })?
            .map_err(|e| {
                FleetError::from_transport(format!("Failed to connect to {}: {}", addr, e))
            })?;

        let slot: HostKeySlot = Arc::new(Mutex::new(None));
        let handler = FleetClientHandler::new(slot.clone());
        let config = build_client_config(timeout, self.compress, self.persistent);

        let handle = tokio::time::timeout(timeout, client::connect_stream(config, stream, handler))
            .await
            .map_err(|_| FleetError::Network {
                kind: TransportErrorKind::TimedOut,
                message: format!("SSH handshake with {} timed out after {:?}", addr, timeout),
            })?
            .map_err(|e| FleetError::from_transport(format!("SSH handshake failed: {}", e)))?;

        let host_key = slot.lock().ok().and_then(|key| key.clone());
        debug!("Handshake with {} complete", addr);

        Ok(Box::new(SshPending { handle, host_key }))
    }
}

struct SshPending {
    handle: client::Handle<FleetClientHandler>,
    host_key: Option<HostKeyInfo>,
}

#[async_trait]
impl PendingConnection for SshPending {
    fn host_key(&self) -> Option<HostKeyInfo> {
        self.host_key.clone()
    }

    async fn authenticate(
        self: Box<Self>,
        username: &str,
        auth: &AuthMethod,
    ) -> Result<Arc<dyn RemoteConnection>, FleetError> {
        let mut handle = self.handle;
        let strategy = strategy_for(auth);

        if !strategy.authenticate(&mut handle, username).await? {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(FleetError::Auth(format!(
                "{} authentication failed for {}",
                strategy.name(),
                username
            )));
        }

        Ok(Arc::new(SshConnection {
            handle,
            closed: AtomicBool::new(false),
        }))
    }

    async fn abort(self: Box<Self>) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "Host key rejected", "en")
            .await;
    }
}

/// Authenticated russh connection.
pub struct SshConnection {
    handle: client::Handle<FleetClientHandler>,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteConnection for SshConnection {
    /// Execute a command on its own channel.
    ///
    /// On timeout, partial output is returned with `timed_out: true` and the
    /// channel is closed; the remote process may keep running.
    async fn exec(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RawOutput, FleetError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| FleetError::from_transport(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| FleetError::Protocol(format!("Failed to execute command: {}", e)))?;

        if let Some(input) = stdin {
            channel
                .data(input)
                .await
                .map_err(|e| FleetError::Protocol(format!("Failed to write stdin: {}", e)))?;
            channel
                .eof()
                .await
                .map_err(|e| FleetError::Protocol(format!("Failed to close stdin: {}", e)))?;
        }

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;

        let result = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        stdout.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext == 1 is stderr in SSH protocol
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) => {
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;

        let timed_out = result.is_err();
        if timed_out {
            warn!(
                "Command timed out after {:?}, returning partial output ({} bytes stdout, {} bytes stderr)",
                timeout,
                stdout.len(),
                stderr.len()
            );
        }

        let _ = channel.close().await;

        Ok(RawOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            timed_out,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed", "en")
            .await;
    }
}
