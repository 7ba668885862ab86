//! Bounded per-target pool of authenticated SSH sessions.
//!
//! # Architecture
//!
//! - One [`TargetPool`] per target id, created lazily. Its semaphore holds
//!   one permit per session that may be borrowed at the same time; idle
//!   sessions hold no permit.
//! - [`SessionPool::acquire`] waits for a permit (bounded by the acquire
//!   timeout), then reuses an idle session or opens a new one. Sessions whose
//!   transport has closed are discarded instead of reused.
//! - [`PooledSession`] is the borrow guard. Releasing it, or simply dropping
//!   it, returns the session to the idle list before the permit is freed, so
//!   a target never has more live sessions than permits.
//! - The idle sweeper is an owned background task started with
//!   [`SessionPool::start_sweeper`] and stopped through a
//!   `CancellationToken`.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fleet::config::FleetConfig;
use crate::fleet::connection::ConnectionConfigResolver;
use crate::fleet::error::FleetError;
use crate::fleet::transport::{Dialer, HostKeyVerdict, RemoteConnection, establish};
use crate::fleet::types::{PoolStats, TargetPoolStats};

/// One live, authenticated connection owned by the pool.
pub struct Session {
    id: Uuid,
    target_id: String,
    connection: Arc<dyn RemoteConnection>,
    created_at: Instant,
    last_used_at: Instant,
    command_count: AtomicU64,
    target_commands: Arc<AtomicU64>,
}

impl Session {
    fn new(
        target_id: &str,
        connection: Arc<dyn RemoteConnection>,
        target_commands: Arc<AtomicU64>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            target_id: target_id.to_string(),
            connection,
            created_at: now,
            last_used_at: now,
            command_count: AtomicU64::new(0),
            target_commands,
        }
    }

    /// Session around a connection the pool does not own, such as a
    /// diagnostic connection.
    pub(crate) fn standalone(target_id: &str, connection: Arc<dyn RemoteConnection>) -> Self {
        Self::new(target_id, connection, Arc::new(AtomicU64::new(0)))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn connection(&self) -> &Arc<dyn RemoteConnection> {
        &self.connection
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn command_count(&self) -> u64 {
        self.command_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_command(&self) {
        self.command_count.fetch_add(1, Ordering::Relaxed);
        self.target_commands.fetch_add(1, Ordering::Relaxed);
    }

    fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }
}

/// Sessions of one target.
struct TargetPool {
    target_id: String,
    permits: Arc<Semaphore>,
    max: usize,
    idle: Mutex<Vec<Session>>,
    /// Every live connection, borrowed or idle, so they can be force-closed.
    live: Mutex<HashMap<Uuid, Arc<dyn RemoteConnection>>>,
    in_use: AtomicUsize,
    commands_executed: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl TargetPool {
    fn new(target_id: &str, max: usize) -> Self {
        Self {
            target_id: target_id.to_string(),
            permits: Arc::new(Semaphore::new(max)),
            max,
            idle: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
            in_use: AtomicUsize::new(0),
            commands_executed: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    fn pop_idle(&self) -> Option<Session> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    fn register(&self, session: &Session) {
        if let Ok(mut live) = self.live.lock() {
            live.insert(session.id, session.connection.clone());
        }
    }

    fn forget(&self, session: &Session) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&session.id);
        }
    }

    /// Remove every idle session, returning them for closing.
    fn drain_idle(&self) -> Vec<Session> {
        self.idle
            .lock()
            .map(|mut idle| idle.drain(..).collect())
            .unwrap_or_default()
    }

    fn live_connections(&self) -> Vec<Arc<dyn RemoteConnection>> {
        self.live
            .lock()
            .map(|live| live.values().cloned().collect())
            .unwrap_or_default()
    }

    fn stats(&self) -> TargetPoolStats {
        let idle = self.idle.lock().map(|idle| idle.len()).unwrap_or(0);
        let total = self.live.lock().map(|live| live.len()).unwrap_or(0);
        TargetPoolStats {
            target_id: self.target_id.clone(),
            total,
            in_use: self.in_use.load(Ordering::SeqCst),
            idle,
            max: self.max,
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
        }
    }

    /// Take a session back from a guard.
    fn give_back(&self, mut session: Session) {
        session.last_used_at = Instant::now();
        self.in_use.fetch_sub(1, Ordering::SeqCst);

        if self.closed.load(Ordering::SeqCst) || session.is_closed() {
            debug!(
                "Discarding session {} for {} on return",
                session.id, self.target_id
            );
            self.forget(&session);
            spawn_close(session.connection);
            return;
        }

        if let Ok(mut idle) = self.idle.lock() {
            idle.push(session);
        }
    }
}

/// Close a connection from a synchronous context.
fn spawn_close(connection: Arc<dyn RemoteConnection>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move { connection.close().await });
    }
}

/// Exclusive borrow of a pooled session.
///
/// Dropping the guard returns the session to its pool; call
/// [`PooledSession::discard`] instead when the session must not be reused.
pub struct PooledSession {
    session: Option<Session>,
    pool: Arc<TargetPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledSession {
    /// Return the session to the pool for reuse.
    pub fn release(self) {
        drop(self);
    }

    /// Close the session instead of returning it.
    pub async fn discard(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
            self.pool.forget(&session);
            session.connection.close().await;
            debug!("Discarded session {} for {}", session.id, session.target_id);
        }
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        // Only `discard` and `drop` take the session, and both consume the guard
        self.session
            .as_ref()
            .expect("pooled session is present until the guard is consumed")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session);
        }
        // Free the permit only after the session is back in the idle list
        self.permit.take();
    }
}

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Bounded session pools for every target.
pub struct SessionPool {
    targets: DashMap<String, Arc<TargetPool>>,
    resolver: Arc<ConnectionConfigResolver>,
    dialer: Arc<dyn Dialer>,
    max_sessions: usize,
    acquire_timeout: Duration,
    idle_timeout: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
    closed: AtomicBool,
}

impl SessionPool {
    pub fn new(
        resolver: Arc<ConnectionConfigResolver>,
        dialer: Arc<dyn Dialer>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            targets: DashMap::new(),
            resolver,
            dialer,
            max_sessions: config.pool_max_sessions.max(1),
            acquire_timeout: config.pool_acquire_timeout,
            idle_timeout: config.pool_idle_timeout,
            sweep_interval: config.pool_sweep_interval,
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn target_pool(&self, target_id: &str) -> Arc<TargetPool> {
        self.targets
            .entry(target_id.to_string())
            .or_insert_with(|| Arc::new(TargetPool::new(target_id, self.max_sessions)))
            .value()
            .clone()
    }

    /// Borrow a session for `target_id`, opening one if no idle session is
    /// available.
    ///
    /// Waits at most the acquire timeout for a free slot and then fails with
    /// [`FleetError::PoolExhausted`].
    pub async fn acquire(&self, target_id: &str) -> Result<PooledSession, FleetError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FleetError::Protocol("session pool is shut down".to_string()));
        }

        let pool = self.target_pool(target_id);
        let acquire = pool.permits.clone().acquire_owned();
        let permit = tokio::time::timeout(self.acquire_timeout, acquire)
            .await
            .map_err(|_| {
                warn!(
                    "Session pool for {} exhausted ({} sessions busy)",
                    target_id, pool.max
                );
                FleetError::PoolExhausted {
                    target_id: target_id.to_string(),
                    waited_secs: self.acquire_timeout.as_secs(),
                }
            })?
            .map_err(|_| FleetError::Protocol("session pool is shut down".to_string()))?;

        while let Some(session) = pool.pop_idle() {
            if session.is_closed() {
                debug!("Dropping dead idle session {} for {}", session.id, target_id);
                pool.forget(&session);
                session.connection.close().await;
                continue;
            }
            pool.in_use.fetch_add(1, Ordering::SeqCst);
            return Ok(PooledSession {
                session: Some(session),
                pool,
                permit: Some(permit),
            });
        }

        let session = self.open(target_id, &pool).await?;
        pool.register(&session);
        pool.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledSession {
            session: Some(session),
            pool,
            permit: Some(permit),
        })
    }

    async fn open(&self, target_id: &str, pool: &TargetPool) -> Result<Session, FleetError> {
        let config = self.resolver.resolve(target_id).await?;
        let established = establish(self.dialer.as_ref(), &config).await?;

        if established.verdict == HostKeyVerdict::TrustOnFirstUse
            && let Some(key) = &established.host_key
            && let Err(e) = self
                .resolver
                .trust_host_key(target_id, &key.fingerprint)
                .await
        {
            warn!("Failed to persist host key for {}: {}", target_id, e);
        }

        let session = Session::new(
            target_id,
            established.connection,
            pool.commands_executed.clone(),
        );
        info!(
            "Opened session {} to {} ({} max)",
            session.id,
            config.address(),
            pool.max
        );
        Ok(session)
    }

    /// Drop the cached connection config of a target.
    pub fn invalidate_config(&self, target_id: &str) {
        self.resolver.invalidate(target_id);
    }

    /// Force-close every session of one target, borrowed ones included.
    ///
    /// Borrowed sessions are discarded when their guard returns them.
    pub async fn close_target(&self, target_id: &str) -> usize {
        let Some(pool) = self.targets.get(target_id).map(|p| p.value().clone()) else {
            return 0;
        };

        let idle = pool.drain_idle();
        for session in &idle {
            pool.forget(session);
        }
        let borrowed = pool.live_connections();
        let closed = idle.len() + borrowed.len();

        for session in idle {
            session.connection.close().await;
        }
        for connection in borrowed {
            connection.close().await;
        }

        info!("Closed {} session(s) for {}", closed, target_id);
        closed
    }

    /// Close sessions idle for longer than the idle timeout.
    pub async fn evict_idle(&self) -> usize {
        let pools: Vec<Arc<TargetPool>> =
            self.targets.iter().map(|p| p.value().clone()).collect();
        let mut evicted = 0;

        for pool in pools {
            let stale: Vec<Session> = match pool.idle.lock() {
                Ok(mut idle) => {
                    let (stale, fresh): (Vec<Session>, Vec<Session>) =
                        idle.drain(..).partition(|s| {
                            s.is_closed() || s.last_used_at.elapsed() > self.idle_timeout
                        });
                    *idle = fresh;
                    stale
                }
                Err(_) => continue,
            };

            for session in stale {
                pool.forget(&session);
                debug!(
                    "Evicting idle session {} for {} (idle {:?})",
                    session.id,
                    session.target_id,
                    session.last_used_at.elapsed()
                );
                session.connection.close().await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {} idle session(s)", evicted);
        }
        evicted
    }

    /// Start the periodic idle sweep. Calling it again restarts the task.
    pub fn start_sweeper(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = weak.upgrade() else { break };
                        pool.evict_idle().await;
                    }
                }
            }
            debug!("Session sweeper stopped");
        });

        if let Ok(mut sweeper) = self.sweeper.lock()
            && let Some(previous) = sweeper.replace(Sweeper { token, handle })
        {
            previous.token.cancel();
        }
        info!("Session sweeper started (every {:?})", interval);
    }

    /// Stop the idle sweep and wait for the task to finish.
    pub async fn stop_sweeper(&self) {
        let sweeper = self.sweeper.lock().ok().and_then(|mut s| s.take());
        if let Some(sweeper) = sweeper {
            sweeper.token.cancel();
            let _ = sweeper.handle.await;
        }
    }

    /// Stop the sweeper and close every session. Pending and future acquires
    /// fail.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_sweeper().await;

        let pools: Vec<Arc<TargetPool>> =
            self.targets.iter().map(|p| p.value().clone()).collect();
        let mut closed = 0;
        for pool in pools {
            pool.closed.store(true, Ordering::SeqCst);
            pool.permits.close();
            for session in pool.drain_idle() {
                pool.forget(&session);
                session.connection.close().await;
                closed += 1;
            }
            for connection in pool.live_connections() {
                connection.close().await;
                closed += 1;
            }
        }
        info!("Session pool shut down, closed {} session(s)", closed);
    }

    pub fn stats(&self) -> PoolStats {
        let mut targets: Vec<TargetPoolStats> =
            self.targets.iter().map(|p| p.value().stats()).collect();
        targets.sort_by(|a, b| a.target_id.cmp(&b.target_id));

        PoolStats {
            total_sessions: targets.iter().map(|t| t.total).sum(),
            in_use: targets.iter().map(|t| t.in_use).sum(),
            idle: targets.iter().map(|t| t.idle).sum(),
            targets,
        }
    }
}
