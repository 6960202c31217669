//! Priority-queued embedding batcher.
//!
//! Requests enqueue as `(text, priority, oneshot)` triples; a dispatch pass
//! drains the queue in priority order (FIFO within a priority), calls the
//! wrapped [`EmbeddingService`] once per batch, and fans results back out
//! through the oneshot handles.
//!
//! Flush triggers:
//! - size: queue length reaches `batch_size`
//! - time: the oldest waiting item hits `flush_interval_ms`
//!
//! A `dispatching` latch coalesces concurrent triggers, and a semaphore caps
//! in-flight service calls at `max_parallel_batches`; a completing batch
//! immediately pulls more work up to the cap. Failed batches retry with
//! linear-growth backoff (`retry_delay_ms * (attempt + 1)`) before rejecting
//! every request in the batch with the terminal error.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{oneshot, Semaphore};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::EmbedError;
use sift_core::EmbeddingService;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// When false, `embed` passes straight through to the service.
    pub enabled: bool,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_parallel_batches: usize,
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 16,
            flush_interval_ms: 50,
            max_parallel_batches: 2,
            retry_attempts: 3,
            retry_delay_ms: 100,
        }
    }
}

/// Running counters; averages are computed on read and are zero when the
/// denominator is zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatcherStats {
    pub total_requests: u64,
    pub batches_processed: u64,
    pub avg_batch_size: f64,
    pub avg_latency_ms: f64,
    pub errors: u64,
    pub retries: u64,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: AtomicU64,
    batches_processed: AtomicU64,
    sum_batch_size: AtomicU64,
    sum_latency_ms: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
}

struct Pending {
    text: String,
    priority: i32,
    /// Enqueue sequence; lower drains first among equal priorities.
    seq: u64,
    resp: oneshot::Sender<Result<Vec<f32>, EmbedError>>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier enqueue.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    service: Arc<dyn EmbeddingService>,
    cfg: BatcherConfig,
    queue: Mutex<BinaryHeap<Pending>>,
    /// Coalesces flush triggers: only one dispatch pass runs at a time.
    dispatching: AtomicBool,
    timer_armed: AtomicBool,
    slots: Arc<Semaphore>,
    counters: Counters,
    next_seq: AtomicU64,
}

/// The batcher handle. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct EmbeddingBatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EmbeddingBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingBatcher")
            .field("cfg", &self.inner.cfg)
            .finish()
    }
}

impl EmbeddingBatcher {
    pub fn new(service: Arc<dyn EmbeddingService>, cfg: BatcherConfig) -> Self {
        let slots = Arc::new(Semaphore::new(cfg.max_parallel_batches.max(1)));
        Self {
            inner: Arc::new(Inner {
                service,
                cfg,
                queue: Mutex::new(BinaryHeap::new()),
                dispatching: AtomicBool::new(false),
                timer_armed: AtomicBool::new(false),
                slots,
                counters: Counters::default(),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_default_config(service: Arc<dyn EmbeddingService>) -> Self {
        Self::new(service, BatcherConfig::default())
    }

    /// Embed a single text at the given priority. Higher priorities drain
    /// first. Resolution order across separate `embed` calls is unspecified;
    /// use [`embed_batch`](Self::embed_batch) when order matters.
    pub async fn embed(&self, text: &str, priority: i32) -> Result<Vec<f32>, EmbedError> {
        if !self.inner.cfg.enabled {
            return self.inner.service.embed(text).await.map_err(EmbedError::from);
        }
        let rx = self.enqueue(text.to_string(), priority);
        match rx.await {
            Ok(result) => result,
            // The sender side only disappears if the dispatch task died.
            Err(_) => Err(EmbedError::Cancelled),
        }
    }

    /// Embed many texts, resolving to vectors in input order.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        priority: i32,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if !self.inner.cfg.enabled {
            return self
                .inner
                .service
                .embed_batch(texts)
                .await
                .map_err(EmbedError::from);
        }

        let receivers: Vec<_> = texts
            .iter()
            .map(|t| self.enqueue(t.clone(), priority))
            .collect();
        let mut out = Vec::with_capacity(receivers.len());
        for rx in receivers {
            match rx.await {
                Ok(Ok(vector)) => out.push(vector),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(EmbedError::Cancelled),
            }
        }
        Ok(out)
    }

    /// Reject every pending request with [`EmbedError::Cancelled`]; in-flight
    /// batches run to completion. Returns the number of rejected requests.
    pub fn clear_queue(&self) -> usize {
        let drained: Vec<Pending> = {
            let mut queue = self.inner.queue.lock().expect("queue poisoned");
            queue.drain().collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.resp.send(Err(EmbedError::Cancelled));
        }
        if count > 0 {
            debug!(cancelled = count, "embedding queue cleared");
        }
        count
    }

    pub fn stats(&self) -> BatcherStats {
        let c = &self.inner.counters;
        let batches = c.batches_processed.load(AtomicOrdering::Relaxed);
        let sum_size = c.sum_batch_size.load(AtomicOrdering::Relaxed);
        let sum_latency = c.sum_latency_ms.load(AtomicOrdering::Relaxed);
        BatcherStats {
            total_requests: c.total_requests.load(AtomicOrdering::Relaxed),
            batches_processed: batches,
            avg_batch_size: if batches == 0 {
                0.0
            } else {
                sum_size as f64 / batches as f64
            },
            avg_latency_ms: if batches == 0 {
                0.0
            } else {
                sum_latency as f64 / batches as f64
            },
            errors: c.errors.load(AtomicOrdering::Relaxed),
            retries: c.retries.load(AtomicOrdering::Relaxed),
            pending: self.inner.queue.lock().expect("queue poisoned").len(),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().expect("queue poisoned").len()
    }

    fn enqueue(&self, text: String, priority: i32) -> oneshot::Receiver<Result<Vec<f32>, EmbedError>> {
        let (tx, rx) = oneshot::channel();
        let seq = self.inner.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner
            .counters
            .total_requests
            .fetch_add(1, AtomicOrdering::Relaxed);

        let len = {
            let mut queue = self.inner.queue.lock().expect("queue poisoned");
            queue.push(Pending {
                text,
                priority,
                seq,
                resp: tx,
            });
            queue.len()
        };

        if len >= self.inner.cfg.batch_size {
            Inner::dispatch(Arc::clone(&self.inner));
        } else {
            Inner::arm_timer(Arc::clone(&self.inner));
        }
        rx
    }
}

impl Inner {
    /// Arm the time trigger once; the flag resets when the timer fires.
    fn arm_timer(inner: Arc<Inner>) {
        if inner.timer_armed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let interval = inner.cfg.flush_interval_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(interval)).await;
            inner.timer_armed.store(false, AtomicOrdering::SeqCst);
            Inner::dispatch(inner);
        });
    }

    /// One dispatch pass: slice batches off the queue while parallel slots
    /// are free. Re-entered on batch completion; concurrent triggers coalesce
    /// through the `dispatching` latch.
    fn dispatch(inner: Arc<Inner>) {
        if inner.dispatching.swap(true, AtomicOrdering::SeqCst) {
            return;
        }

        loop {
            let Ok(permit) = Arc::clone(&inner.slots).try_acquire_owned() else {
                // All slots busy; make sure remaining work has a wake-up.
                inner.dispatching.store(false, AtomicOrdering::SeqCst);
                if !inner.queue.lock().expect("queue poisoned").is_empty() {
                    Inner::arm_timer(Arc::clone(&inner));
                }
                return;
            };

            let batch: Vec<Pending> = {
                let mut queue = inner.queue.lock().expect("queue poisoned");
                let take = inner.cfg.batch_size.min(queue.len());
                (0..take).filter_map(|_| queue.pop()).collect()
            };
            if batch.is_empty() {
                drop(permit);
                inner.dispatching.store(false, AtomicOrdering::SeqCst);
                // A size trigger may have raced with the latch; re-check so
                // nothing waits for a timer that was never armed.
                let backlog = inner.queue.lock().expect("queue poisoned").len();
                if backlog >= inner.cfg.batch_size {
                    return Inner::dispatch(inner);
                }
                if backlog > 0 {
                    Inner::arm_timer(Arc::clone(&inner));
                }
                return;
            }

            let task_inner = Arc::clone(&inner);
            tokio::spawn(async move {
                task_inner.run_batch(batch).await;
                drop(permit);
                Inner::dispatch(task_inner);
            });
        }
    }

    async fn run_batch(&self, batch: Vec<Pending>) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        let started = Instant::now();

        let mut last_err: Option<EmbedError> = None;
        let mut result: Option<Vec<Vec<f32>>> = None;
        for attempt in 0..=self.cfg.retry_attempts {
            if attempt > 0 {
                self.counters.retries.fetch_add(1, AtomicOrdering::Relaxed);
                let backoff = self.cfg.retry_delay_ms.saturating_mul(attempt as u64);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            match self.service.embed_batch(&texts).await {
                Ok(vectors) if vectors.len() == texts.len() => {
                    result = Some(vectors);
                    break;
                }
                Ok(vectors) => {
                    last_err = Some(EmbedError::Permanent(format!(
                        "embedding service returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    )));
                    break;
                }
                Err(e) => {
                    let mapped = EmbedError::from(e);
                    debug!(attempt, error = %mapped, "embedding batch attempt failed");
                    let retryable = matches!(mapped, EmbedError::Transient(_));
                    last_err = Some(mapped);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.counters
            .batches_processed
            .fetch_add(1, AtomicOrdering::Relaxed);
        self.counters
            .sum_batch_size
            .fetch_add(batch.len() as u64, AtomicOrdering::Relaxed);
        self.counters
            .sum_latency_ms
            .fetch_add(elapsed_ms, AtomicOrdering::Relaxed);

        match result {
            Some(vectors) => {
                for (pending, vector) in batch.into_iter().zip(vectors) {
                    let _ = pending.resp.send(Ok(vector));
                }
            }
            None => {
                self.counters.errors.fetch_add(1, AtomicOrdering::Relaxed);
                let last = last_err.unwrap_or(EmbedError::Cancelled);
                warn!(batch = batch.len(), error = %last, "embedding batch exhausted retries");
                let terminal = EmbedError::Exhausted {
                    attempts: self.cfg.retry_attempts + 1,
                    last: last.to_string(),
                };
                for pending in batch {
                    let _ = pending.resp.send(Err(terminal.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Embeds each text as [len, call_index] and records the text order of
    /// every call so tests can observe batching and drain order.
    #[derive(Debug)]
    struct CountingService {
        calls: AtomicUsize,
        fail_first: AtomicUsize,
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl CountingService {
        fn new() -> Self {
            Self::failing(0)
        }

        fn failing(times: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(times),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingService for CountingService {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, sift_error::Error> {
            Ok(vec![text.len() as f32, 1.0])
        }

        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, sift_error::Error> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.seen.lock().unwrap().push(texts.to_vec());
            if self.fail_first.load(AtomicOrdering::SeqCst) > call {
                return Err(sift_error::Error::Embed("simulated outage".to_string()));
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, call as f32])
                .collect())
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn batcher(cfg: BatcherConfig) -> (EmbeddingBatcher, Arc<CountingService>) {
        let service = Arc::new(CountingService::new());
        (EmbeddingBatcher::new(service.clone(), cfg), service)
    }

    #[tokio::test]
    async fn batch_results_arrive_in_input_order() {
        let (b, _svc) = batcher(BatcherConfig {
            batch_size: 4,
            flush_interval_ms: 5,
            ..Default::default()
        });
        let texts: Vec<String> = ["a", "bb", "ccc", "dddd"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let vectors = b.embed_batch(&texts, 0).await.unwrap();
        assert_eq!(vectors.len(), 4);
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector[0], text.len() as f32);
        }
    }

    #[tokio::test]
    async fn size_trigger_flushes_full_batches() {
        let (b, svc) = batcher(BatcherConfig {
            batch_size: 2,
            flush_interval_ms: 10_000,
            ..Default::default()
        });
        let texts: Vec<String> = ["a", "bb"].iter().map(|s| s.to_string()).collect();
        let vectors = b.embed_batch(&texts, 0).await.unwrap();
        assert_eq!(vectors.len(), 2);
        // One service call, not two: the size trigger fired a single batch.
        assert_eq!(svc.calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn time_trigger_flushes_partial_batches() {
        let (b, _svc) = batcher(BatcherConfig {
            batch_size: 64,
            flush_interval_ms: 10,
            ..Default::default()
        });
        let v = b.embed("hello", 0).await.unwrap();
        assert_eq!(v[0], 5.0);
    }

    #[tokio::test]
    async fn priorities_drain_high_first_with_fifo_ties() {
        let (b, svc) = batcher(BatcherConfig {
            batch_size: 3,
            flush_interval_ms: 10_000,
            ..Default::default()
        });
        // The third enqueue hits the size trigger; the batch must drain as
        // [high, low-one, low-two]: priority first, then enqueue order.
        let low1 = b.enqueue("low-one".to_string(), 0);
        let low2 = b.enqueue("low-two".to_string(), 0);
        let high = b.enqueue("high".to_string(), 5);

        high.await.unwrap().unwrap();
        low1.await.unwrap().unwrap();
        low2.await.unwrap().unwrap();

        let seen = svc.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec!["high", "low-one", "low-two"]);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let service = Arc::new(CountingService::failing(2));
        let b = EmbeddingBatcher::new(
            service.clone(),
            BatcherConfig {
                batch_size: 1,
                flush_interval_ms: 5,
                retry_attempts: 3,
                retry_delay_ms: 1,
                ..Default::default()
            },
        );
        let v = b.embed("abc", 0).await.unwrap();
        assert_eq!(v[0], 3.0);
        let stats = b.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_reject_whole_batch() {
        let service = Arc::new(CountingService::failing(100));
        let b = EmbeddingBatcher::new(
            service,
            BatcherConfig {
                batch_size: 2,
                flush_interval_ms: 5,
                retry_attempts: 1,
                retry_delay_ms: 1,
                ..Default::default()
            },
        );
        let texts: Vec<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        let err = b.embed_batch(&texts, 0).await.unwrap_err();
        assert!(matches!(err, EmbedError::Exhausted { .. }));
        assert_eq!(b.stats().errors, 1);
    }

    #[tokio::test]
    async fn clear_queue_rejects_pending_with_cancelled() {
        let (b, _svc) = batcher(BatcherConfig {
            batch_size: 64,
            flush_interval_ms: 60_000,
            ..Default::default()
        });
        let rx = b.enqueue("waiting".to_string(), 0);
        let cleared = b.clear_queue();
        assert_eq!(cleared, 1);
        assert!(matches!(rx.await.unwrap(), Err(EmbedError::Cancelled)));
    }

    #[tokio::test]
    async fn empty_batch_resolves_immediately() {
        let (b, svc) = batcher(BatcherConfig::default());
        let vectors = b.embed_batch(&[], 0).await.unwrap();
        assert!(vectors.is_empty());
        assert_eq!(svc.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bypass_mode_calls_service_directly() {
        let (b, _svc) = batcher(BatcherConfig {
            enabled: false,
            ..Default::default()
        });
        let v = b.embed("hello", 0).await.unwrap();
        assert_eq!(v, vec![5.0, 1.0]);
        assert_eq!(b.stats().total_requests, 0);
    }

    #[tokio::test]
    async fn stats_averages_zero_when_idle() {
        let (b, _svc) = batcher(BatcherConfig::default());
        let stats = b.stats();
        assert_eq!(stats.avg_batch_size, 0.0);
        assert_eq!(stats.avg_latency_ms, 0.0);
    }
}
