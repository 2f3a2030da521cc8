//! Client-side batching of analytics events.
//!
//! Producers call [`AnalyticsBatcher::track_session`],
//! [`AnalyticsBatcher::track_page_view`] and [`AnalyticsBatcher::track_click`].
//! Those calls only append to an in-memory queue. The queue is delivered to an
//! [`IngestTransport`] in ordered batches when:
//!
//! - the queue reaches `max_batch_size` (threshold flush),
//! - the periodic timer fires and the queue is non-empty (timer flush),
//! - the host reports the page as hidden or unloading (keepalive flush),
//! - the batcher is disposed (final flush).
//!
//! At most one awaited flush runs at a time. The keepalive path ignores that
//! guard: it must never be blocked by a background flush. Both paths take the
//! whole queue under one lock, so their batches are always disjoint, but the
//! order in which the backend receives them is not defined.
//!
//! Delivery is at most once. A batch that fails is logged and dropped; nothing
//! is re-queued and no error reaches the producers.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use models::analytics_event::{AnalyticsEvent, BatchedEvent, VisitScope};
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::{
    config::{BatcherConfig, ConfigError},
    host::{ClientEnvironment, Clock, PageLifecycle},
    ingest_client::{IngestError, IngestTransport},
};

/// Why a flush did not send anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    InFlight,
}

/// Result of one awaited flush attempt
#[derive(Debug, Clone)]
pub enum FlushOutcome {
    Skipped(SkipReason),
    Delivered { events: usize },
    Failed { events: usize, error: IngestError },
}

/// Counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub handed_off: u64,
    pub flushes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    handed_off: AtomicU64,
    flushes: AtomicU64,
}

struct Worker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: BatcherConfig,
    transport: Arc<dyn IngestTransport>,
    clock: Arc<dyn Clock>,
    client: Arc<dyn ClientEnvironment>,
    queue: Mutex<Vec<BatchedEvent>>,
    flushing: AtomicBool,
    flush_tasks: TaskTracker,
    worker: Mutex<Option<Worker>>,
    counters: Counters,
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, Vec<BatchedEvent>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap the live queue for an empty one
    fn take_queue(&self) -> Vec<BatchedEvent> {
        std::mem::take(&mut *self.lock_queue())
    }
}

/// Marks an awaited flush as in flight until dropped
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Buffers analytics events and delivers them in batches
#[derive(Clone)]
pub struct AnalyticsBatcher {
    inner: Arc<Inner>,
}

impl AnalyticsBatcher {
    pub fn new(
        config: BatcherConfig,
        transport: Arc<dyn IngestTransport>,
        clock: Arc<dyn Clock>,
        client: Arc<dyn ClientEnvironment>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                clock,
                client,
                queue: Mutex::new(Vec::new()),
                flushing: AtomicBool::new(false),
                flush_tasks: TaskTracker::new(),
                worker: Mutex::new(None),
                counters: Counters::default(),
            }),
        })
    }

    /// Record the start of a visit
    pub fn track_session(&self, scope: &VisitScope, visitor_id: Option<&str>) {
        let event = AnalyticsEvent::session(
            scope,
            visitor_id,
            self.inner.clock.now(),
            self.inner.client.user_agent(),
            self.inner.client.referrer(),
        );
        self.enqueue(event);
    }

    pub fn track_page_view(&self, scope: &VisitScope, page_type: &str) {
        let event = AnalyticsEvent::page_view(scope, page_type, self.inner.clock.now());
        self.enqueue(event);
    }

    pub fn track_click(&self, scope: &VisitScope, click_target: &str) {
        let event = AnalyticsEvent::click(scope, click_target, self.inner.clock.now());
        self.enqueue(event);
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock_queue().len()
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BatcherStats {
        let c = &self.inner.counters;
        BatcherStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            handed_off: c.handed_off.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
        }
    }

    fn enqueue(&self, event: AnalyticsEvent) {
        let kind = event.kind();
        let queued = {
            let mut queue = self.inner.lock_queue();
            queue.push(BatchedEvent::new(event, self.inner.clock.now()));
            queue.len()
        };
        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        trace!(kind = %kind, queued, "Analytics event queued");

        if queued >= self.inner.config.max_batch_size {
            debug!(queued, "Analytics queue reached batch size");
            self.spawn_flush();
        }
    }

    /// Start an awaited flush in the background unless one is already running
    fn spawn_flush(&self) {
        if self.is_flushing() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("No async runtime available for analytics flush, leaving events queued");
            return;
        };

        let batcher = self.clone();
        self.inner.flush_tasks.spawn_on(
            async move {
                batcher.flush().await;
            },
            &handle,
        );
    }

    /// Deliver everything queued so far and wait for the backend's answer.
    ///
    /// Events are removed from the queue before the request is sent and are
    /// not put back on failure.
    pub async fn flush(&self) -> FlushOutcome {
        let Some(_guard) = FlushGuard::acquire(&self.inner.flushing) else {
            debug!("Analytics flush already in flight, skipping");
            return FlushOutcome::Skipped(SkipReason::InFlight);
        };

        let batch = self.inner.take_queue();
        if batch.is_empty() {
            return FlushOutcome::Skipped(SkipReason::Empty);
        }

        let events = batch.len();
        let counters = &self.inner.counters;
        counters.flushes.fetch_add(1, Ordering::Relaxed);

        let oldest_age_ms = batch
            .first()
            .and_then(|event| event.enqueued_at)
            .map(|at| (self.inner.clock.now() - at).num_milliseconds());
        debug!(events, oldest_age_ms = ?oldest_age_ms, "Flushing analytics batch");

        let result = match self.inner.transport.ingest_batch(&batch).await {
            Ok(response) if response.is_rejected() => {
                Err(IngestError::Rejected(response.failure_message()))
            }
            Ok(response) => Ok(response),
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                counters
                    .delivered
                    .fetch_add(events as u64, Ordering::Relaxed);
                debug!(
                    events,
                    processed = ?response.processed,
                    "Analytics batch delivered"
                );
                FlushOutcome::Delivered { events }
            }
            Err(e) => {
                counters.failed.fetch_add(events as u64, Ordering::Relaxed);
                error!(events, error = %e, "Failed to flush analytics batch");
                FlushOutcome::Failed { events, error: e }
            }
        }
    }

    /// Hand the queue to the keepalive transport without waiting.
    ///
    /// Runs even while an awaited flush is in flight. Returns the number of
    /// events handed off.
    pub fn flush_on_unload(&self) -> usize {
        let batch = self.inner.take_queue();
        if batch.is_empty() {
            return 0;
        }

        let events = batch.len();
        self.inner
            .counters
            .handed_off
            .fetch_add(events as u64, Ordering::Relaxed);
        debug!(events, "Handing analytics batch to keepalive transport");
        self.inner.transport.send_keepalive(batch);
        events
    }

    /// Start the flush timer and listen for page lifecycle signals.
    ///
    /// A worker that already stopped on `Unload` is replaced, so a page that
    /// comes back gets its timer again.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self, lifecycle: mpsc::UnboundedReceiver<PageLifecycle>) {
        let mut worker = self.inner.lock_worker();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            warn!("Analytics batcher already started");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.clone().run(lifecycle, shutdown_rx));
        *worker = Some(Worker {
            shutdown_tx,
            handle,
        });
    }

    async fn run(
        self,
        mut lifecycle: mpsc::UnboundedReceiver<PageLifecycle>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.inner.config.flush_interval;
        info!(
            "Starting analytics batcher with interval {:?}, max batch size {}",
            period, self.inner.config.max_batch_size
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signals_open = true;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if self.queued_len() > 0 {
                        self.spawn_flush();
                    }
                }
                signal = lifecycle.recv(), if signals_open => match signal {
                    Some(PageLifecycle::Hidden) => {
                        self.flush_on_unload();
                    }
                    Some(PageLifecycle::Unload) => {
                        self.flush_on_unload();
                        info!("Page unloading, stopping analytics timer");
                        break;
                    }
                    Some(PageLifecycle::Visible) => {}
                    None => {
                        debug!("Page lifecycle source closed");
                        signals_open = false;
                    }
                },
            }
        }

        info!("Analytics batcher stopped");
    }

    /// Stop the timer, let background flushes settle, then flush once more
    pub async fn dispose(&self) -> FlushOutcome {
        let worker = self.inner.lock_worker().take();
        if let Some(Worker {
            shutdown_tx,
            handle,
        }) = worker
        {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Analytics batcher worker ended abnormally");
            }
        }

        self.inner.flush_tasks.close();
        self.inner.flush_tasks.wait().await;
        self.inner.flush_tasks.reopen();

        self.flush().await
    }
}
