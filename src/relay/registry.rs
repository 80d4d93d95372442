//! Process-wide table of live client sessions.
//!
//! # Admission
//!
//! Admission is a single atomic reservation on a slot counter, so the ceiling
//! holds under concurrent upgrades: with `max_clients = 100` exactly 100
//! sessions can be admitted and the 101st is rejected with
//! [`RelayError::AdmissionRejected`]. Once [`SessionRegistry::shutdown_all`]
//! has started, every admission fails with [`RelayError::ShuttingDown`].
//!
//! # Handles
//!
//! Each entry is an `Arc<SessionHandle>` shared with the connection task that
//! owns the session. The handle carries what other tasks need to reach the
//! session without touching its SSH state:
//!
//! | Field | Used by |
//! |-------|---------|
//! | outbound queue | broadcast of `server_shutdown`, background command output |
//! | close token | idle eviction, shutdown |
//! | last activity | idle sweeper |
//! | authenticated flag | logging, background command completion |
//!
//! # Idle Eviction
//!
//! [`SessionRegistry::spawn_idle_sweeper`] runs [`SessionRegistry::evict_idle`]
//! on a fixed interval. Evicted sessions are removed and their close token is
//! cancelled; the connection task then disconnects SSH and closes the socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::RelayError;
use super::protocol::ServerFrame;

/// Shared view of one live session.
pub struct SessionHandle {
    id: String,
    remote_addr: Option<String>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    authenticated: AtomicBool,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    close: CancellationToken,
}

impl SessionHandle {
    fn new(
        id: String,
        remote_addr: Option<String>,
        outbound: mpsc::UnboundedSender<ServerFrame>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            authenticated: AtomicBool::new(false),
            outbound,
            close: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record activity now. Never moves the timestamp backwards.
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last = self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        if now > *last {
            *last = now;
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Queue a frame for the client. Returns `false` once the socket is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Ask the connection task to close the session.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

/// Snapshot for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub clients: usize,
    pub max_clients: usize,
    pub uptime: Duration,
    pub accepting: bool,
}

/// Registry of live sessions keyed by client id.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
    slots: AtomicUsize,
    max_clients: usize,
    accepting: AtomicBool,
    started_at: Instant,
}

impl SessionRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            slots: AtomicUsize::new(0),
            max_clients,
            accepting: AtomicBool::new(true),
            started_at: Instant::now(),
        }
    }

    /// Admit a new session, returning its handle and the receiving end of its
    /// outbound queue.
    pub fn admit(
        &self,
        remote_addr: Option<String>,
    ) -> Result<(Arc<SessionHandle>, mpsc::UnboundedReceiver<ServerFrame>), RelayError> {
        if !self.is_accepting() {
            return Err(RelayError::ShuttingDown);
        }

        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |taken| {
                (taken < self.max_clients).then_some(taken + 1)
            })
            .map_err(|_| RelayError::AdmissionRejected)?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle::new(id.clone(), remote_addr, tx));
        self.sessions.insert(id.clone(), handle.clone());

        // Shutdown may have started between the check and the insert
        if !self.is_accepting() {
            self.remove(&id);
            return Err(RelayError::ShuttingDown);
        }

        info!(
            "Session {} admitted from {} ({}/{})",
            id,
            handle.remote_addr().unwrap_or("unknown"),
            self.len(),
            self.max_clients
        );
        Ok((handle, rx))
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a session. Idempotent; the slot is released only once.
    pub fn remove(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let (_, handle) = self.sessions.remove(id)?;
        self.slots.fetch_sub(1, Ordering::SeqCst);
        debug!("Session {} removed", id);
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            clients: self.len(),
            max_clients: self.max_clients,
            uptime: self.started_at.elapsed(),
            accepting: self.is_accepting(),
        }
    }

    /// Evict every session idle for longer than `threshold`.
    ///
    /// Returns the evicted ids.
    pub fn evict_idle(&self, threshold: Duration) -> Vec<String> {
        // Snapshot first; removing while iterating would deadlock the shard
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > threshold)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(idle.len());
        for id in idle {
            if let Some(handle) = self.remove(&id) {
                info!(
                    "Evicting session {} after {:?} idle",
                    id,
                    handle.idle_for()
                );
                handle.close();
                evicted.push(id);
            }
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until `stop` is cancelled.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        threshold: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle(threshold);
                        if !evicted.is_empty() {
                            info!("Idle sweep evicted {} session(s)", evicted.len());
                        }
                    }
                }
            }
            debug!("Idle sweeper stopped");
        })
    }

    /// Stop admitting, tell every client the server is going away, and close
    /// all sessions. Returns the number of sessions notified.
    pub fn shutdown_all(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);

        let ids: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut notified = 0;
        for id in ids {
            if let Some(handle) = self.remove(&id) {
                if !handle.send(ServerFrame::server_shutdown()) {
                    warn!("Session {} already gone during shutdown", id);
                }
                handle.close();
                notified += 1;
            }
        }

        info!("Shutdown notified {} session(s)", notified);
        notified
    }
}
