use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use relay_core::ids::SessionId;
use relay_telemetry::{names, MetricsRecorder};

use crate::error::StoreError;
use crate::session::{Session, SessionGuard, SessionInfo};

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// TTL for sessions created without an explicit one.
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl StoreConfig {
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// In-memory registry of live sessions with TTL expiry.
///
/// Sessions are handed out as `Arc<Session>`; their mutable state is only
/// reachable through [`SessionStore::lock`], which never waits.
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Session>>,
    config: StoreConfig,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SessionStore {
    pub fn new(config: StoreConfig) -> Self {
        info!(default_ttl_secs = config.default_ttl.as_secs(), "session store initialized");
        Self {
            sessions: DashMap::new(),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create a session. `None` uses the store's default TTL.
    #[instrument(skip(self))]
    pub fn create(&self, ttl: Option<Duration>) -> SessionId {
        let id = SessionId::new();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.sessions
            .insert(id.clone(), Arc::new(Session::new(id.clone(), ttl)));
        debug!(session_id = %id, ttl_secs = ttl.as_secs(), "session created");
        self.update_gauge();
        id
    }

    /// Return the live session under `id`, creating it on first use. An
    /// expired session is replaced by a fresh one under the same id.
    pub fn get_or_create(&self, id: &SessionId, ttl: Option<Duration>) -> Arc<Session> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut created = false;
        let session = {
            let mut entry = self.sessions.entry(id.clone()).or_insert_with(|| {
                created = true;
                Arc::new(Session::new(id.clone(), ttl))
            });
            if !created && entry.is_expired(Instant::now()) {
                *entry = Arc::new(Session::new(id.clone(), ttl));
                created = true;
            }
            entry.value().clone()
        };

        if created {
            debug!(session_id = %id, ttl_secs = ttl.as_secs(), "session created on first use");
            self.update_gauge();
        } else {
            session.touch();
        }
        session
    }

    /// Look up a live session and refresh its activity time.
    ///
    /// An expired session is evicted here and reported as `Expired`; after
    /// eviction (here or by the sweeper) the id is `NotFound`.
    pub fn get(&self, id: &SessionId) -> Result<Arc<Session>, StoreError> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if session.is_expired(Instant::now()) {
            self.sessions
                .remove_if(id, |_, s| s.is_expired(Instant::now()));
            debug!(session_id = %id, "session expired on access");
            self.update_gauge();
            return Err(StoreError::Expired(id.clone()));
        }

        session.touch();
        Ok(session)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.get(id).is_ok()
    }

    pub fn delete(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!(session_id = %id, "session deleted");
            self.update_gauge();
        }
        removed
    }

    /// Take the session's lock without waiting; `Busy` if another caller holds it.
    pub fn lock(&self, id: &SessionId) -> Result<SessionGuard, StoreError> {
        self.get(id)?
            .try_lock()
            .ok_or_else(|| StoreError::Busy(id.clone()))
    }

    /// Run `f` while holding the session lock. The lock is released when `f`'s
    /// future completes or is dropped.
    pub async fn with_lock<F, Fut, T>(&self, id: &SessionId, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(SessionGuard) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(id)?;
        Ok(f(guard).await)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn info(&self, id: &SessionId) -> Result<SessionInfo, StoreError> {
        Ok(self.get(id)?.info())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.iter().map(|e| e.value().info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Remove every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!(removed, remaining = self.sessions.len(), "swept expired sessions");
            self.update_gauge();
        }
        removed
    }

    /// Sweep on `sweep_interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        store.sweep_expired();
                    }
                }
            }
        })
    }

    fn update_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.gauge_set(names::SESSIONS_ACTIVE, &[], self.sessions.len() as f64);
        }
    }
}
