//! russh client handler.
//!
//! # Host Key Capture
//!
//! `FleetClientHandler` does not decide trust itself: it records the key the
//! server presents and accepts the handshake. The policy check runs on the
//! captured key right after the handshake (see
//! [`crate::fleet::transport::verify_host_key`]), before any credential is
//! sent. This lets the connection tester report the fingerprint even when
//! verification fails.

use std::sync::{Arc, Mutex};

use russh::{client, keys};
use tracing::debug;

use crate::fleet::transport::HostKeyInfo;

/// Slot the handler writes the presented host key into.
pub(crate) type HostKeySlot = Arc<Mutex<Option<HostKeyInfo>>>;

pub struct FleetClientHandler {
    host_key: HostKeySlot,
}

impl FleetClientHandler {
    pub(crate) fn new(host_key: HostKeySlot) -> Self {
        Self { host_key }
    }
}

impl client::Handler for FleetClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let info = HostKeyInfo {
            fingerprint: server_public_key
                .fingerprint(keys::HashAlg::Sha256)
                .to_string(),
            algorithm: server_public_key.algorithm().to_string(),
        };
        debug!("Server presented {} key {}", info.algorithm, info.fingerprint);
        if let Ok(mut slot) = self.host_key.lock() {
            *slot = Some(info);
        }
        Ok(true)
    }
}
