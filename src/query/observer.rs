// Merge lifecycle observer. Callbacks are host-provided and may be
// invoked concurrently from producer tasks and the consumer; a panicking
// observer must never take the data plane down with it, so every call is
// routed through a panic-isolating handle.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::ShardId;

/// Why a producer stopped. Exactly one of these is reported per shard
/// per enumeration, after at most one `shard_completed` (success only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Canceled,
    Faulted,
}

pub trait MergeObserver: Send + Sync {
    /// The consumer yielded an item that originated on `shard_id`.
    fn item_yielded(&self, _shard_id: &ShardId) {}

    /// A producer drained its source successfully.
    fn shard_completed(&self, _shard_id: &ShardId) {}

    /// Terminal producer event; fires exactly once per shard.
    fn shard_stopped(&self, _shard_id: &ShardId, _reason: StopReason) {}

    /// A producer started waiting on a full buffer.
    fn backpressure_wait_start(&self) {}

    /// The matching end of a `backpressure_wait_start`.
    fn backpressure_wait_stop(&self) {}

    /// Current heap size, sampled by the ordered merge.
    fn heap_size_sample(&self, _size: usize) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl MergeObserver for NoopObserver {}

static NOOP_OBSERVER: Lazy<Arc<NoopObserver>> = Lazy::new(|| Arc::new(NoopObserver));

pub fn noop_observer() -> Arc<dyn MergeObserver> {
    NOOP_OBSERVER.clone()
}

/// Recording observer for tests: counts events and remembers per-shard
/// stop reasons and heap samples.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    inner: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    yielded: Vec<ShardId>,
    completed: Vec<ShardId>,
    stopped: Vec<(ShardId, StopReason)>,
    wait_starts: usize,
    wait_stops: usize,
    heap_samples: Vec<usize>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn yielded(&self) -> Vec<ShardId> {
        self.inner.lock().yielded.clone()
    }

    pub fn completed(&self) -> Vec<ShardId> {
        self.inner.lock().completed.clone()
    }

    pub fn stopped(&self) -> Vec<(ShardId, StopReason)> {
        self.inner.lock().stopped.clone()
    }

    pub fn wait_pairs(&self) -> (usize, usize) {
        let state = self.inner.lock();
        (state.wait_starts, state.wait_stops)
    }

    pub fn heap_samples(&self) -> Vec<usize> {
        self.inner.lock().heap_samples.clone()
    }
}

impl MergeObserver for RecordingObserver {
    fn item_yielded(&self, shard_id: &ShardId) {
        self.inner.lock().yielded.push(shard_id.clone());
    }

    fn shard_completed(&self, shard_id: &ShardId) {
        self.inner.lock().completed.push(shard_id.clone());
    }

    fn shard_stopped(&self, shard_id: &ShardId, reason: StopReason) {
        self.inner.lock().stopped.push((shard_id.clone(), reason));
    }

    fn backpressure_wait_start(&self) {
        self.inner.lock().wait_starts += 1;
    }

    fn backpressure_wait_stop(&self) {
        self.inner.lock().wait_stops += 1;
    }

    fn heap_size_sample(&self, size: usize) {
        self.inner.lock().heap_samples.push(size);
    }
}

/// Panic-isolated dispatch handle used by the broadcaster and the ordered
/// merge for every observer call.
#[derive(Clone)]
pub(crate) struct ObserverHandle {
    observer: Arc<dyn MergeObserver>,
}

impl ObserverHandle {
    pub(crate) fn new(observer: Arc<dyn MergeObserver>) -> Self {
        Self { observer }
    }

    pub(crate) fn item_yielded(&self, shard_id: &ShardId) {
        let obs = &self.observer;
        let _ = catch_unwind(AssertUnwindSafe(|| obs.item_yielded(shard_id)));
    }

    pub(crate) fn shard_completed(&self, shard_id: &ShardId) {
        let obs = &self.observer;
        let _ = catch_unwind(AssertUnwindSafe(|| obs.shard_completed(shard_id)));
    }

    pub(crate) fn shard_stopped(&self, shard_id: &ShardId, reason: StopReason) {
        let obs = &self.observer;
        let _ = catch_unwind(AssertUnwindSafe(|| obs.shard_stopped(shard_id, reason)));
    }

    pub(crate) fn backpressure_wait_start(&self) {
        let obs = &self.observer;
        let _ = catch_unwind(AssertUnwindSafe(|| obs.backpressure_wait_start()));
    }

    pub(crate) fn backpressure_wait_stop(&self) {
        let obs = &self.observer;
        let _ = catch_unwind(AssertUnwindSafe(|| obs.backpressure_wait_stop()));
    }

    pub(crate) fn heap_size_sample(&self, size: usize) {
        let obs = &self.observer;
        let _ = catch_unwind(AssertUnwindSafe(|| obs.heap_size_sample(size)));
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle").finish()
    }
}
