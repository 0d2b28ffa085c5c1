use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, instrument, warn};

use relay_core::backend::{Backend, BackendRequest, BackendResponse};
use relay_core::errors::BackendError;
use relay_telemetry::{names, MetricsRecorder};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Upper bound on one `call`, covering the slot wait and every retry.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    /// Consecutive failed attempts after which a slot is benched.
    pub slot_failure_threshold: u32,
    pub slot_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            slot_failure_threshold: 3,
            slot_cooldown: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_slot_health(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.slot_failure_threshold = failure_threshold.max(1);
        self.slot_cooldown = cooldown;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend unavailable after {attempts} attempts: {last}")]
    BackendUnavailable { attempts: u32, last: BackendError },
    #[error("circuit open for {endpoint}, retry in {retry_in:?}")]
    CircuitOpen { endpoint: String, retry_in: Duration },
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("pool has no backends")]
    Empty,
    #[error("pool closed")]
    Closed,
}

impl PoolError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::Backend(e) => e.error_kind(),
            Self::Empty => "empty",
            Self::Closed => "closed",
        }
    }
}

#[derive(Default)]
struct SlotHealth {
    consecutive_failures: u32,
    benched_until: Option<Instant>,
}

struct Slot {
    backend: Arc<dyn Backend>,
    health: Mutex<SlotHealth>,
}

impl Slot {
    fn is_healthy(&self, now: Instant) -> bool {
        self.health.lock().benched_until.map_or(true, |until| now >= until)
    }
}

struct PoolInner {
    slots: Vec<Slot>,
    in_use: Mutex<Vec<bool>>,
    cursor: AtomicUsize,
    permits: Arc<Semaphore>,
}

impl PoolInner {
    /// Mark a free slot as leased: round-robin from the cursor, healthy slots first.
    fn take_slot(&self) -> Option<usize> {
        let mut in_use = self.in_use.lock();
        let n = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let now = Instant::now();

        let mut fallback = None;
        for offset in 0..n {
            let i = (start + offset) % n;
            if in_use[i] {
                continue;
            }
            if self.slots[i].is_healthy(now) {
                in_use[i] = true;
                return Some(i);
            }
            fallback.get_or_insert(i);
        }
        if let Some(i) = fallback {
            in_use[i] = true;
        }
        fallback
    }
}

/// Exclusive use of one pool slot. Released on drop, whatever the call's outcome.
pub struct SlotLease {
    inner: Arc<PoolInner>,
    index: usize,
    _permit: OwnedSemaphorePermit,
}

impl SlotLease {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.slots[self.index].backend
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so a woken waiter always finds a free slot.
        self.inner.in_use.lock()[self.index] = false;
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakerStat {
    pub endpoint: String,
    pub state: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub total_calls: u64,
    pub total_retries: u64,
    pub benched_slots: usize,
    pub breakers: Vec<BreakerStat>,
}

/// Bounded set of backend slots. Every backend call in the process goes through here.
pub struct ClientPool {
    inner: Arc<PoolInner>,
    config: PoolConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    total_calls: AtomicU64,
    total_retries: AtomicU64,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ClientPool {
    /// One slot per backend handle. Pass the same backend several times to get
    /// several slots over one client.
    pub fn new(backends: Vec<Arc<dyn Backend>>, config: PoolConfig) -> Result<Self, PoolError> {
        if backends.is_empty() {
            return Err(PoolError::Empty);
        }
        let capacity = backends.len();
        let slots = backends
            .into_iter()
            .map(|backend| Slot {
                backend,
                health: Mutex::new(SlotHealth::default()),
            })
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                slots,
                in_use: Mutex::new(vec![false; capacity]),
                cursor: AtomicUsize::new(0),
                permits: Arc::new(Semaphore::new(capacity)),
            }),
            config,
            breakers: DashMap::new(),
            total_calls: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            metrics: None,
        })
    }

    /// `size` slots sharing one backend client.
    pub fn uniform(
        backend: Arc<dyn Backend>,
        size: usize,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        Self::new(vec![backend; size], config)
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Reject new leases. Calls already holding a slot finish normally.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    /// Lease a slot, waiting while the pool is saturated.
    pub async fn acquire(&self) -> Result<SlotLease, PoolError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        let index = self.inner.take_slot().ok_or(PoolError::Closed)?;
        Ok(SlotLease {
            inner: self.inner.clone(),
            index,
            _permit: permit,
        })
    }

    pub fn breaker_state(&self, endpoint: &str) -> Option<&'static str> {
        self.breakers.get(endpoint).map(|b| b.state_name())
    }

    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let mut breakers: Vec<BreakerStat> = self
            .breakers
            .iter()
            .map(|entry| BreakerStat {
                endpoint: entry.key().clone(),
                state: entry.value().state_name(),
            })
            .collect();
        breakers.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        PoolStats {
            capacity: self.capacity(),
            available: self.available(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_retries: self.total_retries(),
            benched_slots: self
                .inner
                .slots
                .iter()
                .filter(|s| !s.is_healthy(now))
                .count(),
            breakers,
        }
    }

    /// Some endpoint and its cooldown when every slot's endpoint is rejecting.
    fn open_circuit(&self) -> Option<(String, Duration)> {
        let mut blocked = None;
        for slot in &self.inner.slots {
            let endpoint = slot.backend.endpoint();
            let retry_in = self.breakers.get(endpoint).and_then(|b| b.rejecting())?;
            blocked.get_or_insert_with(|| (endpoint.to_string(), retry_in));
        }
        blocked
    }

    fn breaker_for(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config.breaker.clone())))
            .clone()
    }

    /// Issue one backend round under timeout, retry and circuit-breaking.
    #[instrument(skip_all, fields(capacity = self.capacity()))]
    pub async fn call(&self, request: &BackendRequest) -> Result<BackendResponse, PoolError> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if let Some((endpoint, retry_in)) = self.open_circuit() {
            debug!(endpoint = %endpoint, ?retry_in, "circuit open, rejecting before slot wait");
            self.record_outcome("circuit_open");
            return Err(PoolError::CircuitOpen { endpoint, retry_in });
        }
        let timeout = self.config.call_timeout;
        let deadline = Instant::now() + timeout;

        let lease = match timeout_at(deadline, self.acquire()).await {
            Ok(lease) => lease?,
            Err(_) => {
                self.record_outcome("timeout");
                return Err(PoolError::Timeout(timeout));
            }
        };
        let backend = lease.backend().clone();
        let endpoint = backend.endpoint().to_string();

        let ticket = match self.breaker_for(&endpoint).admit() {
            Ok(ticket) => ticket,
            Err(retry_in) => {
                debug!(endpoint = %endpoint, ?retry_in, "circuit open, rejecting call");
                self.record_outcome("circuit_open");
                return Err(PoolError::CircuitOpen { endpoint, retry_in });
            }
        };

        let max_retries = self.config.retry.max_retries;
        let mut attempt: u32 = 0;
        loop {
            let outcome = timeout_at(deadline, backend.call(request)).await;
            match outcome {
                Ok(Ok(response)) => {
                    self.slot_succeeded(lease.index());
                    ticket.success();
                    self.record_outcome("ok");
                    return Ok(response);
                }
                Ok(Err(e)) if e.is_retryable() => {
                    self.slot_failed(lease.index());
                    if attempt >= max_retries {
                        warn!(
                            backend = backend.name(),
                            attempts = attempt + 1,
                            error = %e,
                            "backend unavailable, retries exhausted"
                        );
                        if ticket.failure() {
                            self.record_circuit_open(&endpoint);
                        }
                        self.record_outcome("unavailable");
                        return Err(PoolError::BackendUnavailable {
                            attempts: attempt + 1,
                            last: e,
                        });
                    }

                    let delay = self.config.retry.delay_for(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    if let Some(m) = &self.metrics {
                        m.counter_inc(names::POOL_RETRIES_TOTAL, &[("backend", backend.name())], 1);
                    }
                    warn!(
                        backend = backend.name(),
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying backend call"
                    );

                    let wake = Instant::now() + delay;
                    if wake >= deadline {
                        sleep_until(deadline).await;
                        if ticket.failure() {
                            self.record_circuit_open(&endpoint);
                        }
                        self.record_outcome("timeout");
                        return Err(PoolError::Timeout(timeout));
                    }
                    sleep_until(wake).await;
                    attempt += 1;
                }
                Ok(Err(e)) => {
                    // The endpoint answered; a rejected request says nothing about its health.
                    if e.is_fatal() {
                        ticket.success();
                    } else if ticket.failure() {
                        self.record_circuit_open(&endpoint);
                    }
                    self.record_outcome(e.error_kind());
                    return Err(PoolError::Backend(e));
                }
                Err(_) => {
                    self.slot_failed(lease.index());
                    if ticket.failure() {
                        self.record_circuit_open(&endpoint);
                    }
                    self.record_outcome("timeout");
                    return Err(PoolError::Timeout(timeout));
                }
            }
        }
    }

    fn slot_succeeded(&self, index: usize) {
        *self.inner.slots[index].health.lock() = SlotHealth::default();
    }

    fn slot_failed(&self, index: usize) {
        let mut health = self.inner.slots[index].health.lock();
        health.consecutive_failures += 1;
        if health.consecutive_failures >= self.config.slot_failure_threshold {
            warn!(
                slot = index,
                cooldown_secs = self.config.slot_cooldown.as_secs(),
                "slot benched after consecutive failures"
            );
            health.consecutive_failures = 0;
            health.benched_until = Some(Instant::now() + self.config.slot_cooldown);
        }
    }

    fn record_outcome(&self, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc(names::POOL_CALLS_TOTAL, &[("outcome", outcome)], 1);
        }
    }

    fn record_circuit_open(&self, endpoint: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc(names::CIRCUIT_OPEN_TOTAL, &[("endpoint", endpoint)], 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockResponse};
    use relay_core::messages::ConversationTurn;

    fn request() -> BackendRequest {
        BackendRequest::new("test", vec![ConversationTurn::user_text("hi")])
    }

    fn fast_config(max_retries: u32) -> PoolConfig {
        PoolConfig::default()
            .with_call_timeout(Duration::from_secs(60))
            .with_retry(
                RetryPolicy::default()
                    .with_max_retries(max_retries)
                    .with_base_delay(Duration::from_millis(10))
                    .with_max_delay(Duration::from_millis(50)),
            )
    }

    fn pool_of(mock: Arc<MockBackend>, size: usize, config: PoolConfig) -> ClientPool {
        ClientPool::uniform(mock, size, config).unwrap()
    }

    #[test]
    fn empty_pool_rejected() {
        assert!(matches!(
            ClientPool::new(vec![], PoolConfig::default()),
            Err(PoolError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let mock = Arc::new(MockBackend::new(vec![
            MockResponse::server_error(),
            MockResponse::server_error(),
            MockResponse::text("recovered"),
        ]));
        let pool = pool_of(mock.clone(), 1, fast_config(2));

        let response = pool.call(&request()).await.unwrap();
        assert_eq!(response.continuation_token.as_str(), "resp_mock_2");
        assert_eq!(pool.total_retries(), 2);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_unavailable() {
        let mock = Arc::new(MockBackend::always(MockResponse::server_error()));
        let pool = pool_of(mock.clone(), 1, fast_config(2));

        let err = pool.call(&request()).await.unwrap_err();
        match err {
            PoolError::BackendUnavailable { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, BackendError::ServerError { status: 500, .. }));
            }
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
        assert_eq!(pool.total_retries(), 2);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_surfaces_immediately() {
        let mock = Arc::new(MockBackend::new(vec![
            MockResponse::Error(BackendError::InvalidRequest("bad schema".into())),
            MockResponse::text("unreachable"),
        ]));
        let pool = pool_of(mock.clone(), 1, fast_config(3));

        let err = pool.call(&request()).await.unwrap_err();
        assert!(matches!(err, PoolError::Backend(BackendError::InvalidRequest(_))));
        assert_eq!(pool.total_retries(), 0);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_is_honoured() {
        let mock = Arc::new(MockBackend::new(vec![
            MockResponse::Error(BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
            }),
            MockResponse::text("ok"),
        ]));
        let pool = pool_of(mock, 1, fast_config(1));

        let start = Instant::now();
        pool.call(&request()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_counts_calls_not_attempts() {
        let mock = Arc::new(MockBackend::always(MockResponse::server_error()));
        let config = fast_config(2).with_breaker(
            BreakerConfig::default()
                .with_failure_threshold(2)
                .with_cooldown(Duration::from_secs(30)),
        );
        let pool = pool_of(mock.clone(), 1, config);

        assert!(pool.call(&request()).await.is_err());
        assert_eq!(pool.breaker_state("mock://backend"), Some("closed"));
        assert!(pool.call(&request()).await.is_err());
        assert_eq!(pool.breaker_state("mock://backend"), Some("open"));
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_rejects_then_recovers() {
        let mock = Arc::new(
            MockBackend::new(vec![MockResponse::server_error(), MockResponse::server_error()])
                .repeating(MockResponse::text("back")),
        );
        let config = fast_config(0).with_breaker(
            BreakerConfig::default()
                .with_failure_threshold(2)
                .with_cooldown(Duration::from_secs(30)),
        );
        let metrics = Arc::new(MetricsRecorder::new());
        let pool = pool_of(mock.clone(), 1, config).with_metrics(Some(metrics.clone()));

        for _ in 0..2 {
            assert!(pool.call(&request()).await.is_err());
        }
        let err = pool.call(&request()).await.unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen { .. }));
        assert_eq!(mock.call_count(), 2, "open circuit must not reach the backend");
        assert_eq!(
            metrics.counter_get(names::CIRCUIT_OPEN_TOTAL, &[("endpoint", "mock://backend")]),
            1
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        pool.call(&request()).await.unwrap();
        assert_eq!(pool.breaker_state("mock://backend"), Some("closed"));
        assert_eq!(metrics.counter_get(names::POOL_CALLS_TOTAL, &[("outcome", "ok")]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_rejects_without_waiting_for_a_slot() {
        let mock = Arc::new(MockBackend::always(MockResponse::server_error()));
        let config = fast_config(0)
            .with_call_timeout(Duration::from_secs(30))
            .with_breaker(
                BreakerConfig::default()
                    .with_failure_threshold(1)
                    .with_cooldown(Duration::from_secs(60)),
            );
        let pool = pool_of(mock.clone(), 1, config);
        assert!(pool.call(&request()).await.is_err());
        assert_eq!(pool.breaker_state("mock://backend"), Some("open"));

        // Saturate the pool, then call again.
        let _lease = pool.acquire().await.unwrap();
        let start = Instant::now();
        let err = pool.call(&request()).await.unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen { .. }), "got {err:?}");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_slot() {
        let mock = Arc::new(MockBackend::new(vec![MockResponse::Hang]));
        let pool = Arc::new(pool_of(mock.clone(), 1, fast_config(0)));

        let task = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.call(&request()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.available(), 0);
        assert_eq!(mock.call_count(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.breaker_state("mock://backend"), Some("closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_covers_hang() {
        let mock = Arc::new(MockBackend::new(vec![MockResponse::Hang]));
        let pool = pool_of(mock, 1, fast_config(0).with_call_timeout(Duration::from_secs(2)));

        let err = pool.call(&request()).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout(d) if d == Duration::from_secs(2)));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_waits_for_slot() {
        let mock = Arc::new(MockBackend::always(MockResponse::delayed(
            Duration::from_millis(100),
            MockResponse::text("ok"),
        )));
        let pool = pool_of(mock.clone(), 1, fast_config(0));

        let start = Instant::now();
        let (req_a, req_b) = (request(), request());
        let (a, b) = tokio::join!(pool.call(&req_a), pool.call(&req_b));
        assert!(a.is_ok() && b.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_wait_is_bounded_by_timeout() {
        let mock = Arc::new(MockBackend::always(MockResponse::Hang));
        let pool = Arc::new(pool_of(
            mock,
            1,
            fast_config(0).with_call_timeout(Duration::from_secs(5)),
        ));
        let _holder = pool.acquire().await.unwrap();

        let err = pool.call(&request()).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_leases_never_exceed_capacity() {
        let pool = Arc::new(pool_of(
            Arc::new(MockBackend::always(MockResponse::text("ok"))),
            3,
            fast_config(0),
        ));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let pool = pool.clone();
                let in_flight = in_flight.clone();
                let high_water = high_water.clone();
                tokio::spawn(async move {
                    let _lease = pool.acquire().await.unwrap();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(high_water.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_slot_is_benched() {
        let bad = Arc::new(
            MockBackend::always(MockResponse::Error(BackendError::NetworkError("reset".into())))
                .with_endpoint("mock://bad"),
        );
        let good = Arc::new(MockBackend::always(MockResponse::text("ok")).with_endpoint("mock://good"));
        let config = fast_config(0).with_slot_health(1, Duration::from_secs(10));
        let backends: Vec<Arc<dyn Backend>> = vec![bad.clone(), good.clone()];
        let pool = ClientPool::new(backends, config).unwrap();

        // Cursor starts at slot 0, the bad one.
        assert!(pool.call(&request()).await.is_err());
        assert_eq!(pool.stats().benched_slots, 1);

        for _ in 0..4 {
            pool.call(&request()).await.unwrap();
        }
        assert_eq!(bad.call_count(), 1);
        assert_eq!(good.call_count(), 4);

        let stats = pool.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.total_calls, 5);
        assert_eq!(stats.breakers.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_pool_rejects() {
        let pool = pool_of(Arc::new(MockBackend::always(MockResponse::text("ok"))), 1, fast_config(0));
        pool.close();
        assert!(matches!(pool.call(&request()).await, Err(PoolError::Closed)));
    }
}
