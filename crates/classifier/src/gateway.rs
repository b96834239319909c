//! Shared call gateway in front of the model transport.
//!
//! One FIFO queue feeds a bounded set of in-flight calls. A single worker
//! task paces dispatch (global minimum inter-dispatch interval), honors the
//! circuit breaker, and hands each dequeued item to its own task holding a
//! semaphore permit. Retryable failures re-enter the queue (front by
//! default) after exponential backoff, taken outside any concurrency slot.
//!
//! The gateway is an explicitly constructed instance shared via `Arc`;
//! nothing here is process-global, so tests build isolated gateways.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify, Semaphore};

use crate::error::{GatewayError, TransportError};
use crate::transport::ModelTransport;
use theme_protocol::{GatewayConfig, RequestPriority};

/// Poll cadence while stalled on the breaker or an empty pacing window.
const STALL_POLL: Duration = Duration::from_millis(10);

struct QueueItem {
    prompt: String,
    /// Transport attempts already made (0 for fresh work).
    attempt: u32,
    enqueued_ms: u64,
    tx: oneshot::Sender<Result<String, GatewayError>>,
}

#[derive(Default)]
struct GatewayState {
    queue: VecDeque<QueueItem>,
    /// Fresh submissions currently queued; retries are exempt from the
    /// queue bound and do not count here.
    fresh_queued: usize,
    consecutive_failures: u32,
    open_until_ms: Option<u64>,
    last_dispatch_ms: Option<u64>,
}

/// Point-in-time gateway statistics; reading mutates nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewaySnapshot {
    pub queue_depth: usize,
    pub active: usize,
    pub processed: u64,
    pub failed: u64,
    pub avg_wait_ms: f64,
    pub breaker_open: bool,
    pub consecutive_failures: u32,
}

/// Rate-limited, circuit-breaking request queue shared by all callers.
pub struct CallGateway {
    cfg: GatewayConfig,
    transport: Arc<dyn ModelTransport>,
    state: Mutex<GatewayState>,
    work: Notify,
    permits: Arc<Semaphore>,
    start: Instant,
    clock_offset_ms: AtomicU64,
    active: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    dispatched: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl CallGateway {
    /// Build a gateway and spawn its worker loop on the current runtime.
    pub fn new(cfg: GatewayConfig, transport: Arc<dyn ModelTransport>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
        let gateway = Arc::new(Self {
            cfg,
            transport,
            state: Mutex::new(GatewayState::default()),
            work: Notify::new(),
            permits,
            start: Instant::now(),
            clock_offset_ms: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&gateway);
        tokio::spawn(Self::worker_loop(weak));
        gateway
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64 + self.clock_offset_ms.load(Ordering::Relaxed)
    }

    /// Advance the gateway clock; lets tests fast-forward breaker cool-down
    /// and pacing windows without waiting wall-clock time.
    pub fn advance(&self, by: Duration) {
        self.clock_offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::Relaxed);
        self.work.notify_one();
    }

    /// Submit prompt text and await the transport's answer.
    ///
    /// Safe to call from arbitrarily many tasks. Backpressure is blocking:
    /// callers await their turn rather than being rejected, except when the
    /// fresh-work queue bound is hit, which fails fast with `QueueFull`.
    pub async fn submit(
        &self,
        prompt: String,
        priority: RequestPriority,
    ) -> Result<String, GatewayError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().expect("gateway mutex");
            if state.fresh_queued >= self.cfg.max_queue_depth {
                return Err(GatewayError::QueueFull {
                    depth: state.queue.len(),
                });
            }
            let item = QueueItem {
                prompt,
                attempt: 0,
                enqueued_ms: self.now_ms(),
                tx,
            };
            match priority {
                RequestPriority::High => state.queue.push_front(item),
                RequestPriority::Normal | RequestPriority::Low => {
                    state.queue.push_back(item)
                }
            }
            state.fresh_queued += 1;
        }
        self.work.notify_one();
        rx.await.map_err(|_| GatewayError::Closed)?
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        let state = self.state.lock().expect("gateway mutex");
        let dispatched = self.dispatched.load(Ordering::Relaxed);
        let avg_wait_ms = if dispatched == 0 {
            0.0
        } else {
            self.total_wait_ms.load(Ordering::Relaxed) as f64 / dispatched as f64
        };
        GatewaySnapshot {
            queue_depth: state.queue.len(),
            active: self.active.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_wait_ms,
            breaker_open: state
                .open_until_ms
                .map(|until| self.now_ms() < until)
                .unwrap_or(false),
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// True while the breaker blocks new dispatch.
    pub fn breaker_open(&self) -> bool {
        self.snapshot().breaker_open
    }

    async fn worker_loop(weak: Weak<CallGateway>) {
        loop {
            let Some(gw) = weak.upgrade() else {
                // Every strong handle is gone; pending senders drop and
                // callers observe `Closed`.
                return;
            };
            gw.worker_step().await;
            let idle = gw.state.lock().expect("gateway mutex").queue.is_empty();
            if idle {
                tokio::select! {
                    _ = gw.work.notified() => {}
                    _ = tokio::time::sleep(STALL_POLL) => {}
                }
            }
            // Release the strong ref between iterations so dropping the
            // last caller handle terminates the loop.
            drop(gw);
            tokio::task::yield_now().await;
        }
    }

    /// One scheduling step: dispatch the queue head if pacing, breaker and
    /// concurrency allow; otherwise stall briefly.
    async fn worker_step(self: &Arc<Self>) {
        if self.state.lock().expect("gateway mutex").queue.is_empty() {
            return;
        }
        // Breaker: existing in-flight calls complete, new dispatch stalls.
        loop {
            let open_remaining = {
                let state = self.state.lock().expect("gateway mutex");
                state
                    .open_until_ms
                    .and_then(|until| until.checked_sub(self.now_ms()))
                    .filter(|rem| *rem > 0)
            };
            match open_remaining {
                Some(_) => tokio::time::sleep(STALL_POLL).await,
                None => break,
            }
        }

        // Global pacing: one dispatch per min interval, across all callers.
        loop {
            let wait = {
                let state = self.state.lock().expect("gateway mutex");
                match state.last_dispatch_ms {
                    Some(last) => {
                        let elapsed = self.now_ms().saturating_sub(last);
                        self.cfg.min_dispatch_interval_ms.checked_sub(elapsed)
                    }
                    None => None,
                }
            };
            match wait.filter(|w| *w > 0) {
                Some(w) => tokio::time::sleep(Duration::from_millis(w.min(50))).await,
                _ => break,
            }
        }

        // Concurrency cap, acquired before the item leaves the queue so the
        // head is never dispatched beyond the cap.
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("gateway semaphore closed");

        let item = {
            let mut state = self.state.lock().expect("gateway mutex");
            let item = state.queue.pop_front();
            if let Some(ref it) = item {
                if it.attempt == 0 {
                    state.fresh_queued = state.fresh_queued.saturating_sub(1);
                }
                state.last_dispatch_ms = Some(self.now_ms());
            }
            item
        };

        let Some(item) = item else {
            drop(permit);
            return;
        };

        let waited = self.now_ms().saturating_sub(item.enqueued_ms);
        self.total_wait_ms.fetch_add(waited, Ordering::Relaxed);
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let gw = Arc::clone(self);
        tokio::spawn(async move {
            gw.execute(item).await;
            drop(permit);
        });
    }

    /// Run one transport call and resolve or re-enqueue the item.
    ///
    /// Never panics out of the queue path: every outcome resolves the
    /// caller's channel or schedules a retry.
    async fn execute(self: Arc<Self>, item: QueueItem) {
        self.active.fetch_add(1, Ordering::Relaxed);
        let timeout = Duration::from_millis(self.cfg.request_timeout_ms);
        let outcome = match tokio::time::timeout(
            timeout,
            self.transport.complete(&item.prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        self.active.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(text) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                let mut state = self.state.lock().expect("gateway mutex");
                state.consecutive_failures = 0;
                drop(state);
                let _ = item.tx.send(Ok(text));
            }
            Err(err) if err.is_retryable() => {
                self.note_retryable_failure();
                let attempt = item.attempt + 1;
                if attempt > self.cfg.max_retries {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    let _ = item.tx.send(Err(GatewayError::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    }));
                    return;
                }
                log::debug!(
                    "retryable transport failure (attempt {attempt}/{}): {err}",
                    self.cfg.max_retries
                );
                let backoff = self.cfg.backoff_for_attempt(attempt);
                let gw = Arc::clone(&self);
                // Backoff happens here, outside any concurrency slot.
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    gw.requeue_retry(QueueItem {
                        prompt: item.prompt,
                        attempt,
                        enqueued_ms: gw.now_ms(),
                        tx: item.tx,
                    });
                });
            }
            Err(err) => {
                // Permanent: exhausts immediately, no breaker contribution.
                self.failed.fetch_add(1, Ordering::Relaxed);
                let _ = item.tx.send(Err(GatewayError::Permanent(err)));
            }
        }
    }

    fn note_retryable_failure(&self) {
        let mut state = self.state.lock().expect("gateway mutex");
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.cfg.failure_threshold {
            let until = self.now_ms() + self.cfg.cooldown_ms;
            if state.open_until_ms.map(|u| until > u).unwrap_or(true) {
                state.open_until_ms = Some(until);
                log::warn!(
                    "circuit breaker opened after {} consecutive failures; cool-down {}ms",
                    state.consecutive_failures,
                    self.cfg.cooldown_ms
                );
            }
        }
    }

    /// Re-insert a retry, front of the queue by default so it outranks
    /// fresh work. Retries bypass the fresh-work queue bound.
    fn requeue_retry(&self, item: QueueItem) {
        {
            let mut state = self.state.lock().expect("gateway mutex");
            if self.cfg.retry_at_front {
                state.queue.push_front(item);
            } else {
                state.queue.push_back(item);
            }
        }
        self.work.notify_one();
    }
}
