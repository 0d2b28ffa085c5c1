use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use relay_core::ids::{ContinuationToken, SessionId};
use relay_core::tokens::TokenUsage;

/// Per-(session, agent type) conversation state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentState {
    /// `None` means the next call starts a fresh conversation.
    pub continuation_token: Option<ContinuationToken>,
    pub turns: u64,
    pub iterations: u64,
    pub usage: TokenUsage,
    /// Name of the structured-output schema last used by this agent.
    pub schema_name: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl AgentState {
    /// Record a completed orchestration. Only called after success.
    pub fn record_success(
        &mut self,
        token: ContinuationToken,
        iterations: u32,
        usage: &TokenUsage,
        schema_name: Option<&str>,
    ) {
        self.continuation_token = Some(token);
        self.turns += 1;
        self.iterations += u64::from(iterations);
        self.usage.accumulate(usage);
        self.schema_name = schema_name.map(str::to_string);
        self.last_run_at = Some(Utc::now());
    }
}

/// Output one agent left behind for others in the same session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentResult {
    pub result: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Mutable session contents, reachable only through a [`SessionGuard`].
#[derive(Debug, Default)]
pub struct SessionState {
    agents: HashMap<String, AgentState>,
    results: HashMap<String, AgentResult>,
}

impl SessionState {
    pub fn agent(&self, agent_type: &str) -> Option<&AgentState> {
        self.agents.get(agent_type)
    }

    pub fn agent_mut(&mut self, agent_type: &str) -> &mut AgentState {
        self.agents.entry(agent_type.to_string()).or_default()
    }

    pub fn continuation_token(&self, agent_type: &str) -> Option<&ContinuationToken> {
        self.agents.get(agent_type)?.continuation_token.as_ref()
    }

    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.agents.keys().cloned().collect();
        types.sort();
        types
    }

    /// Forget one agent's conversation; the next call starts fresh.
    pub fn reset_agent(&mut self, agent_type: &str) -> bool {
        self.agents.remove(agent_type).is_some()
    }

    /// Drop every agent's state and all stored results.
    pub fn clear_conversation(&mut self) {
        self.agents.clear();
        self.results.clear();
    }

    pub fn store_result(
        &mut self,
        agent_type: &str,
        result: serde_json::Value,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) {
        self.results.insert(
            agent_type.to_string(),
            AgentResult {
                result,
                recorded_at: Utc::now(),
                metadata,
            },
        );
    }

    pub fn result(&self, agent_type: &str) -> Option<&AgentResult> {
        self.results.get(agent_type)
    }

    /// Clear one agent's result, or all of them with `None`.
    pub fn clear_results(&mut self, agent_type: Option<&str>) {
        match agent_type {
            Some(t) => {
                self.results.remove(t);
            }
            None => self.results.clear(),
        }
    }
}

/// Snapshot of session metadata for listings and diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub ttl_secs: u64,
    pub busy: bool,
    /// Agent types as of the last lock release.
    pub agent_types: Vec<String>,
}

struct Activity {
    at: Instant,
    wall: DateTime<Utc>,
    agent_types: Vec<String>,
}

pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    ttl: Duration,
    activity: parking_lot::Mutex<Activity>,
    /// Set while a [`SessionGuard`] exists. Introspection reads this flag and
    /// never touches `state`, so lookups cannot make a lock attempt fail.
    busy: AtomicBool,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            ttl,
            activity: parking_lot::Mutex::new(Activity {
                at: Instant::now(),
                wall: now,
                agent_types: Vec::new(),
            }),
            busy: AtomicBool::new(false),
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active(&self) -> Instant {
        self.activity.lock().at
    }

    pub(crate) fn touch(&self) {
        let mut activity = self.activity.lock();
        activity.at = Instant::now();
        activity.wall = Utc::now();
    }

    fn release(&self, agent_types: Vec<String>) {
        let mut activity = self.activity.lock();
        activity.at = Instant::now();
        activity.wall = Utc::now();
        activity.agent_types = agent_types;
    }

    /// True while an orchestration holds the session lock.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// The single expiry rule, shared by lazy lookups and the sweeper.
    /// A busy session never expires.
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.is_busy() && now.saturating_duration_since(self.last_active()) > self.ttl
    }

    pub fn info(&self) -> SessionInfo {
        let activity = self.activity.lock();
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            last_active: activity.wall,
            ttl_secs: self.ttl.as_secs(),
            busy: self.is_busy(),
            agent_types: activity.agent_types.clone(),
        }
    }

    /// Take the session lock without waiting.
    ///
    /// The busy flag is the gate. The state mutex is released before the flag
    /// is cleared, so a caller that wins the flag always finds it free.
    pub(crate) fn try_lock(self: &Arc<Self>) -> Option<SessionGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let mark = BusyMark(self.clone());
        let guard = self.state.clone().try_lock_owned().ok()?;
        Some(SessionGuard {
            guard,
            session: self.clone(),
            _mark: mark,
        })
    }
}

/// Clears the busy flag on drop.
struct BusyMark(Arc<Session>);

impl Drop for BusyMark {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Exclusive access to a session's state. Refreshes the session's activity
/// time when released.
pub struct SessionGuard {
    // Field order matters: the mutex guard drops before the busy mark.
    guard: OwnedMutexGuard<SessionState>,
    session: Arc<Session>,
    _mark: BusyMark,
}

impl SessionGuard {
    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }
}

impl Deref for SessionGuard {
    type Target = SessionState;

    fn deref(&self) -> &SessionState {
        &self.guard
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut SessionState {
        &mut self.guard
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.release(self.guard.agent_types());
    }
}
