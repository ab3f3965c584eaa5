//! Bounded handoff between frame production and the encoder.
//!
//! Producers suspend in [`EncodeQueue::enqueue`] while the queue is full and
//! consumers suspend in [`EncodeQueue::dequeue`] while it is empty. Waiting
//! is event-driven through [`Notify`]; nothing polls. Cancelling the queue
//! releases every waiter with [`RecastError::Cancelled`] and drops whatever
//! is still buffered.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use recast_common::error::{RecastError, RecastResult};
use recast_decode_engine::DecodedFrame;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A composited frame on its way to the encoder.
#[derive(Debug)]
pub struct QueueEntry {
    /// Output frame number, starting at 0.
    pub index: u64,
    /// Presentation timestamp on the effective timeline.
    pub timestamp_us: i64,
    pub frame: DecodedFrame,
}

impl QueueEntry {
    pub fn new(index: u64, frame: DecodedFrame) -> Self {
        Self {
            index,
            timestamp_us: frame.timestamp_us(),
            frame,
        }
    }
}

/// Which side of the queue spent longer waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bottleneck {
    /// Producers waited on a full queue: the encoder is the slow side.
    EncoderBound,
    /// The encoder waited on an empty queue: decoding is the slow side.
    DecoderBound,
    Balanced,
}

/// Queue telemetry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub occupancy: usize,
    pub peak_occupancy: usize,
    pub frames_enqueued: u64,
    /// Entries handed to the consumer.
    pub frames_processed: u64,
    pub producer_blocked: Duration,
    pub consumer_blocked: Duration,
}

/// Waiting times within this fraction of each other count as balanced.
const BALANCE_TOLERANCE: f64 = 0.1;

impl QueueStats {
    pub fn total_blocked(&self) -> Duration {
        self.producer_blocked + self.consumer_blocked
    }

    pub fn bottleneck(&self) -> Bottleneck {
        let producer = self.producer_blocked.as_secs_f64();
        let consumer = self.consumer_blocked.as_secs_f64();
        let larger = producer.max(consumer);
        if larger == 0.0 || (producer - consumer).abs() <= larger * BALANCE_TOLERANCE {
            Bottleneck::Balanced
        } else if producer > consumer {
            Bottleneck::EncoderBound
        } else {
            Bottleneck::DecoderBound
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    peak: usize,
    enqueued: u64,
    processed: u64,
    producer_blocked: Duration,
    consumer_blocked: Duration,
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    not_full: Notify,
    not_empty: Notify,
    capacity: usize,
    cancel: CancellationToken,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop buffered items once cancelled.
    fn release_on_cancel(&self) {
        let dropped = std::mem::take(&mut self.lock().items);
        drop(dropped);
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }
}

/// Bounded multi-producer, multi-consumer queue.
pub struct EncodeQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EncodeQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> EncodeQueue<T> {
    /// Queue holding at most `capacity` entries, cancelled along with `cancel`.
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(capacity),
                    closed: false,
                    peak: 0,
                    enqueued: 0,
                    processed: 0,
                    producer_blocked: Duration::ZERO,
                    consumer_blocked: Duration::ZERO,
                }),
                not_full: Notify::new(),
                not_empty: Notify::new(),
                capacity,
                cancel,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Append `item`, suspending while the queue is full.
    ///
    /// Fails with `Cancelled` once the queue is cancelled and with a render
    /// error after [`close`](Self::close). The item is dropped on failure.
    pub async fn enqueue(&self, item: T) -> RecastResult<()> {
        let mut blocked_since: Option<Instant> = None;
        loop {
            let notified = self.inner.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if self.inner.cancel.is_cancelled() {
                    drop(state);
                    self.inner.release_on_cancel();
                    return Err(RecastError::Cancelled);
                }
                if state.closed {
                    return Err(RecastError::render("encode queue is closed"));
                }
                if state.items.len() < self.inner.capacity {
                    if let Some(since) = blocked_since {
                        state.producer_blocked += since.elapsed();
                    }
                    state.items.push_back(item);
                    state.enqueued += 1;
                    state.peak = state.peak.max(state.items.len());
                    debug_assert!(state.items.len() <= self.inner.capacity);
                    drop(state);
                    self.inner.not_empty.notify_waiters();
                    return Ok(());
                }
            }

            blocked_since.get_or_insert_with(Instant::now);
            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.cancel.cancelled() => {}
            }
        }
    }

    /// Take the oldest entry, suspending while the queue is empty.
    ///
    /// Returns `Ok(None)` once the queue is closed and drained.
    pub async fn dequeue(&self) -> RecastResult<Option<T>> {
        let mut blocked_since: Option<Instant> = None;
        loop {
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if self.inner.cancel.is_cancelled() {
                    drop(state);
                    self.inner.release_on_cancel();
                    return Err(RecastError::Cancelled);
                }
                if !state.items.is_empty() || state.closed {
                    if let Some(since) = blocked_since {
                        state.consumer_blocked += since.elapsed();
                    }
                }
                if let Some(item) = state.items.pop_front() {
                    state.processed += 1;
                    drop(state);
                    self.inner.not_full.notify_waiters();
                    return Ok(Some(item));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            blocked_since.get_or_insert_with(Instant::now);
            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.cancel.cancelled() => {}
            }
        }
    }

    /// Stop accepting entries; consumers drain what is left. Idempotent.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.not_full.notify_waiters();
        self.inner.not_empty.notify_waiters();
    }

    /// Release every waiter with `Cancelled` and drop buffered entries.
    /// Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        self.inner.release_on_cancel();
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            capacity: self.inner.capacity,
            occupancy: state.items.len(),
            peak_occupancy: state.peak,
            frames_enqueued: state.enqueued,
            frames_processed: state.processed,
            producer_blocked: state.producer_blocked,
            consumer_blocked: state.consumer_blocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;

    fn queue(capacity: usize) -> EncodeQueue<u32> {
        EncodeQueue::new(capacity, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = queue(4);
        for i in 0..4 {
            q.enqueue(i).await.unwrap();
        }
        q.close();
        let mut out = Vec::new();
        while let Some(item) = q.dequeue().await.unwrap() {
            out.push(item);
        }
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(q.stats().frames_processed, 4);
    }

    #[tokio::test]
    async fn test_full_queue_suspends_producer_until_dequeue() {
        let q = queue(2);
        q.enqueue(1).await.unwrap();
        q.enqueue(2).await.unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.enqueue(3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(q.len(), 2);

        assert_eq!(q.dequeue().await.unwrap(), Some(1));
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should resume after one dequeue")
            .unwrap()
            .unwrap();
        assert_eq!(q.len(), 2);
        assert!(q.stats().producer_blocked > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let q = queue(2);
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(7).await.unwrap();
        let item = consumer.await.unwrap().unwrap();
        assert_eq!(item, Some(7));
        assert!(q.stats().consumer_blocked > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancel_releases_all_waiters() {
        let q = queue(1);
        q.enqueue(0).await.unwrap();

        let producers: Vec<_> = (0..3)
            .map(|i| {
                let q = q.clone();
                tokio::spawn(async move { q.enqueue(i).await })
            })
            .collect();
        let empty = queue(1);
        let consumer = {
            let q = empty.clone();
            tokio::spawn(async move { q.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.cancel();
        empty.cancel();
        for producer in producers {
            let result = tokio::time::timeout(Duration::from_secs(1), producer)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(RecastError::Cancelled)));
        }
        let result = consumer.await.unwrap();
        assert!(matches!(result, Err(RecastError::Cancelled)));
        assert!(q.is_empty());
        assert!(matches!(q.dequeue().await, Err(RecastError::Cancelled)));
    }

    #[tokio::test]
    async fn test_token_cancellation_drops_buffered_items() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let q = EncodeQueue::new(3, token.clone());
        q.enqueue(Tracked(dropped.clone())).await.unwrap();
        q.enqueue(Tracked(dropped.clone())).await.unwrap();

        token.cancel();
        assert!(q.dequeue().await.is_err());
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let q = queue(2);
        q.close();
        q.close();
        assert!(matches!(q.enqueue(1).await, Err(RecastError::Render { .. })));
        assert_eq!(q.dequeue().await.unwrap(), None);
    }

    #[test]
    fn test_bottleneck_classification() {
        let mut stats = QueueStats {
            capacity: 6,
            occupancy: 0,
            peak_occupancy: 6,
            frames_enqueued: 10,
            frames_processed: 10,
            producer_blocked: Duration::from_millis(900),
            consumer_blocked: Duration::from_millis(100),
        };
        assert_eq!(stats.bottleneck(), Bottleneck::EncoderBound);
        stats.producer_blocked = Duration::from_millis(50);
        assert_eq!(stats.bottleneck(), Bottleneck::DecoderBound);
        stats.producer_blocked = Duration::from_millis(95);
        assert_eq!(stats.bottleneck(), Bottleneck::Balanced);
        stats.producer_blocked = Duration::ZERO;
        stats.consumer_blocked = Duration::ZERO;
        assert_eq!(stats.bottleneck(), Bottleneck::Balanced);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_occupancy_never_exceeds_capacity(capacity in 1usize..6, items in 1u32..40, consumer_delay in 0u64..3) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let (peak, received) = runtime.block_on(async move {
                let q = EncodeQueue::new(capacity, CancellationToken::new());
                let producer = {
                    let q = q.clone();
                    tokio::spawn(async move {
                        for i in 0..items {
                            q.enqueue(i).await.unwrap();
                        }
                        q.close();
                    })
                };
                let mut received = Vec::new();
                while let Some(item) = q.dequeue().await.unwrap() {
                    received.push(item);
                    if consumer_delay > 0 {
                        tokio::time::sleep(Duration::from_millis(consumer_delay)).await;
                    }
                }
                producer.await.unwrap();
                (q.stats().peak_occupancy, received)
            });
            prop_assert!(peak <= capacity);
            prop_assert_eq!(received, (0..items).collect::<Vec<_>>());
        }
    }
}
