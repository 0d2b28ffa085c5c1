//! Progress delivery: sink implementations and the bounded emitter that sits
//! between an orchestration and its sink.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use relay_core::events::{ProgressEvent, ProgressKind, ProgressStage};

/// Destination for progress events. One sink per orchestration call.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, event: ProgressEvent);
}

// --- Sinks ---

/// Writes one line per event for an interactive terminal.
pub struct ConsoleSink<W: Write + Send> {
    out: Mutex<W>,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn render(event: &ProgressEvent) -> String {
        let message = event.message.as_deref().unwrap_or("");
        match event.kind {
            ProgressKind::Progress if event.stage == Some(ProgressStage::Reasoning) => {
                format!("💭 {message}")
            }
            ProgressKind::Progress => format!("⏳ {message}"),
            ProgressKind::Result => format!("✅ {message}"),
            ProgressKind::Error => format!("❌ {message}"),
        }
    }
}

#[async_trait]
impl<W: Write + Send> ProgressSink for ConsoleSink<W> {
    async fn report(&self, event: ProgressEvent) {
        let line = Self::render(&event);
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            debug!(error = %e, "console sink write failed");
        }
    }
}

/// Pushes events into a bounded channel, for SSE-style streaming.
#[derive(Clone)]
pub struct QueueSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl QueueSink {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for QueueSink {
    async fn report(&self, event: ProgressEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("progress receiver gone, event discarded");
        }
    }
}

/// Notification handed to a host protocol's progress callback.
#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolProgress {
    /// Running count of events reported through this sink, starting at 1.
    pub progress: f64,
    pub total: f64,
    pub message: String,
}

pub type ProgressCallback = Arc<dyn Fn(ProtocolProgress) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapts events to a host tool-calling protocol's progress notifications.
pub struct CallbackSink {
    callback: ProgressCallback,
    count: AtomicU64,
    total: f64,
}

impl CallbackSink {
    pub fn new(callback: ProgressCallback) -> Self {
        Self {
            callback,
            count: AtomicU64::new(0),
            total: 100.0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn format_message(event: &ProgressEvent) -> String {
        let message = event.message.as_deref().unwrap_or("");
        let text = match event.stage {
            Some(stage) => format!("{}: {message}", stage.as_str()),
            None => message.to_string(),
        };
        // Escaped the way a JSON string body is, minus the quotes.
        serde_json::to_string(&text)
            .map(|quoted| quoted[1..quoted.len() - 1].to_string())
            .unwrap_or(text)
    }
}

#[async_trait]
impl ProgressSink for CallbackSink {
    async fn report(&self, event: ProgressEvent) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        let notification = ProtocolProgress {
            progress: n as f64,
            total: self.total,
            message: Self::format_message(&event),
        };
        (self.callback)(notification).await;
    }
}

pub struct NoopSink;

#[async_trait]
impl ProgressSink for NoopSink {
    async fn report(&self, _event: ProgressEvent) {}
}

// --- Emitter ---

/// What happens when the emitter's buffer is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered event.
    DropOldest,
    /// Wait up to `max_wait` for room, then drop the new event.
    Backpressure { max_wait: Duration },
}

#[derive(Clone, Debug)]
pub struct EmitterConfig {
    pub capacity: usize,
    pub policy: OverflowPolicy,
    /// Upper bound on waiting for the sink to drain at the end of a call.
    pub flush_timeout: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            policy: OverflowPolicy::Backpressure {
                max_wait: Duration::from_secs(1),
            },
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl EmitterConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
}

#[derive(Default)]
struct Buffer {
    events: VecDeque<ProgressEvent>,
    closed: bool,
}

struct Shared {
    buffer: Mutex<Buffer>,
    item_ready: Notify,
    space_ready: Notify,
}

/// Bounded buffer between an orchestration and its sink, drained by a
/// forwarding task. Events reach the sink in emission order; exactly one
/// terminal event is delivered, and it is never dropped. Dropping the emitter
/// before a terminal event was emitted delivers a synthetic `cancelled` error.
pub struct ProgressEmitter {
    shared: Arc<Shared>,
    config: EmitterConfig,
    terminal_sent: AtomicBool,
    dropped: AtomicU64,
    forwarder: Option<JoinHandle<()>>,
}

impl ProgressEmitter {
    pub fn spawn(sink: Arc<dyn ProgressSink>, mut config: EmitterConfig) -> Self {
        config.capacity = config.capacity.max(1);
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer::default()),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        });
        let forwarder = tokio::spawn(forward(Arc::clone(&shared), sink));
        Self {
            shared,
            config,
            terminal_sent: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            forwarder: Some(forwarder),
        }
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if event.is_terminal() {
            if self.terminal_sent.swap(true, Ordering::SeqCst) {
                debug!("second terminal event ignored");
                return;
            }
            // Terminal events bypass the capacity check.
            self.push(event);
            return;
        }
        if self.terminal_sent.load(Ordering::SeqCst) {
            debug!("progress event after terminal event ignored");
            return;
        }

        match self.config.policy {
            OverflowPolicy::DropOldest => {
                let mut buffer = self.shared.buffer.lock();
                if buffer.events.len() >= self.config.capacity {
                    buffer.events.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                buffer.events.push_back(event);
                drop(buffer);
                self.shared.item_ready.notify_one();
            }
            OverflowPolicy::Backpressure { max_wait } => {
                let deadline = Instant::now() + max_wait;
                loop {
                    {
                        let mut buffer = self.shared.buffer.lock();
                        if buffer.events.len() < self.config.capacity {
                            buffer.events.push_back(event);
                            drop(buffer);
                            self.shared.item_ready.notify_one();
                            return;
                        }
                    }
                    let notified = self.shared.space_ready.notified();
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(?max_wait, "progress sink too slow, event dropped");
                        return;
                    }
                }
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    /// Close the buffer and wait (bounded by `flush_timeout`) for the sink to
    /// receive everything. Returns the number of events dropped on overflow.
    pub async fn finish(mut self) -> u64 {
        self.close();
        if let Some(handle) = self.forwarder.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.flush_timeout, handle).await.is_err() {
                warn!(
                    timeout = ?self.config.flush_timeout,
                    "progress sink did not drain in time"
                );
                abort.abort();
            }
        }
        self.dropped()
    }

    fn push(&self, event: ProgressEvent) {
        self.shared.buffer.lock().events.push_back(event);
        self.shared.item_ready.notify_one();
    }

    fn close(&self) {
        if !self.terminal_sent.swap(true, Ordering::SeqCst) {
            self.push(ProgressEvent::error("cancelled"));
        }
        self.shared.buffer.lock().closed = true;
        self.shared.item_ready.notify_one();
    }
}

impl Drop for ProgressEmitter {
    fn drop(&mut self) {
        // Already closed by `finish`; otherwise the forwarder keeps draining
        // in the background after we let go of its handle.
        if self.forwarder.is_some() {
            self.close();
        }
    }
}

async fn forward(shared: Arc<Shared>, sink: Arc<dyn ProgressSink>) {
    loop {
        let next = {
            let mut buffer = shared.buffer.lock();
            match buffer.events.pop_front() {
                Some(event) => Some(event),
                None if buffer.closed => break,
                None => None,
            }
        };
        match next {
            Some(event) => {
                shared.space_ready.notify_one();
                sink.report(event).await;
            }
            None => shared.item_ready.notified().await,
        }
    }
}
