// Ordered k-way merge: per-shard producers with a small prefetch buffer
// feed a min-heap of per-shard heads. Memory stays bounded by
// shard_count × prefetch; first-item latency is bounded by the slowest
// first item, not by total materialization.
//
// Precondition: each shard's stream must already be sorted by the key
// selector (standard merge-join contract). Ties across shards break by
// shard insertion order, which keeps the output deterministic.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{Shard, ShardId};
use crate::error::{diag, ShardError, ShardErrorKind, ShardResult};
use crate::health::{HealthFilter, HealthTracker};
use crate::query::observer::{noop_observer, MergeObserver, ObserverHandle, StopReason};

/// Largest supported per-shard prefetch.
pub const MAX_PREFETCH_PER_SHARD: usize = 4;

#[derive(Debug, Clone)]
pub struct OrderedMergeOptions {
    /// Items buffered per shard ahead of the heap. 1..=4.
    pub prefetch_per_shard: usize,
    /// Emit a heap size sample every N pops.
    pub heap_sample_every: usize,
    pub health_filter: HealthFilter,
}

impl Default for OrderedMergeOptions {
    fn default() -> Self {
        Self {
            prefetch_per_shard: 1,
            heap_sample_every: 1,
            health_filter: HealthFilter::Include,
        }
    }
}

struct HeadEntry<T, Key> {
    key: Key,
    shard_index: usize,
    item: T,
}

impl<T, Key: Ord> PartialEq for HeadEntry<T, Key> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, Key: Ord> Eq for HeadEntry<T, Key> {}

impl<T, Key: Ord> PartialOrd for HeadEntry<T, Key> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, Key: Ord> Ord for HeadEntry<T, Key> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.shard_index.cmp(&other.shard_index))
    }
}

struct ShardSlot<T> {
    shard_id: ShardId,
    rx: Option<mpsc::Receiver<T>>,
}

enum StopCause {
    Fault(ShardError),
    Cancelled,
}

/// Performs globally ordered merges across shards.
pub struct OrderedMerger<S> {
    shards: Vec<Shard<S>>,
    health: Option<Arc<HealthTracker>>,
    observer: Arc<dyn MergeObserver>,
}

impl<S> OrderedMerger<S> {
    pub fn new(shards: Vec<Shard<S>>) -> Self {
        Self {
            shards,
            health: None,
            observer: noop_observer(),
        }
    }

    pub fn with_health_tracker(mut self, tracker: Arc<HealthTracker>) -> Self {
        self.health = Some(tracker);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MergeObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn participants(&self, filter: &HealthFilter) -> ShardResult<Vec<Shard<S>>> {
        match &self.health {
            Some(tracker) => filter.apply(&self.shards, tracker),
            None => Ok(self.shards.clone()),
        }
    }

    /// Streaming merge: yields `(shard_id, item)` globally non-decreasing
    /// by `key_fn`, pulling lazily from every shard.
    pub fn merge<T, Key, Q, F>(
        &self,
        query: Q,
        key_fn: F,
        opts: OrderedMergeOptions,
        cancel: CancellationToken,
    ) -> ShardResult<OrderedMergeStream<T, Key>>
    where
        T: Send + 'static,
        Key: Ord,
        Q: Fn(&Shard<S>) -> BoxStream<'static, ShardResult<T>>,
        F: Fn(&T) -> Key + Send + Sync + 'static,
    {
        if opts.prefetch_per_shard == 0 || opts.prefetch_per_shard > MAX_PREFETCH_PER_SHARD {
            return Err(ShardError::new(
                ShardErrorKind::Query,
                "prefetch per shard out of range",
            )
            .with_diagnostic("prefetch_per_shard", opts.prefetch_per_shard)
            .with_diagnostic("max", MAX_PREFETCH_PER_SHARD));
        }
        if cancel.is_cancelled() {
            return Err(ShardError::cancelled("ordered merge cancelled before start"));
        }
        let participants = self.participants(&opts.health_filter)?;
        let observer = ObserverHandle::new(Arc::clone(&self.observer));
        let (fault_tx, fault_rx) = mpsc::channel(participants.len().max(1));

        debug!(
            shard_count = participants.len(),
            prefetch = opts.prefetch_per_shard,
            "starting ordered merge"
        );

        let targeted = participants.len();
        let mut slots = Vec::with_capacity(targeted);
        let mut producers = Vec::with_capacity(targeted);
        for shard in &participants {
            let stream = query(shard);
            let (tx, rx) = mpsc::channel(opts.prefetch_per_shard);
            producers.push(spawn_ordered_producer(
                shard.id().clone(),
                stream,
                tx,
                fault_tx.clone(),
                cancel.clone(),
                observer.clone(),
                targeted,
            ));
            slots.push(ShardSlot {
                shard_id: shard.id().clone(),
                rx: Some(rx),
            });
        }
        drop(fault_tx);

        Ok(OrderedMergeStream {
            slots,
            heap: BinaryHeap::new(),
            key_fn: Box::new(key_fn),
            fault_rx,
            cancel,
            producers,
            observer,
            primed: false,
            finished: false,
            pending_refill: None,
            pops: 0,
            sample_every: opts.heap_sample_every.max(1) as u64,
        })
    }

    /// Eager variant: materialize everything, then sort. Only sensible
    /// for small result sets; it holds every item resident and the first
    /// item waits for total materialization.
    pub async fn merge_eager<T, Key, Q, F>(
        &self,
        query: Q,
        key_fn: F,
        health_filter: HealthFilter,
        cancel: CancellationToken,
    ) -> ShardResult<Vec<(ShardId, T)>>
    where
        T: Send + 'static,
        Key: Ord,
        Q: Fn(&Shard<S>) -> BoxStream<'static, ShardResult<T>>,
        F: Fn(&T) -> Key,
    {
        let participants = self.participants(&health_filter)?;
        let mut collected: Vec<(usize, ShardId, T)> = Vec::new();
        for (index, shard) in participants.iter().enumerate() {
            let mut stream = query(shard);
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ShardError::cancelled("eager merge cancelled"));
                    }
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(value)) => collected.push((index, shard.id().clone(), value)),
                    Some(Err(err)) => {
                        return Err(ShardError::new(
                            ShardErrorKind::Query,
                            "shard query failed during eager merge",
                        )
                        .with_diagnostic(diag::PHASE, "merge_eager")
                        .with_diagnostic(diag::SHARD_ID, shard.id())
                        .with_diagnostic(diag::TARGETED_SHARD_COUNT, participants.len())
                        .with_source(anyhow::Error::new(err)));
                    }
                    None => break,
                }
            }
        }
        // Stable sort keeps per-shard insertion order for equal keys.
        collected.sort_by(|a, b| key_fn(&a.2).cmp(&key_fn(&b.2)).then(a.0.cmp(&b.0)));
        Ok(collected.into_iter().map(|(_, id, item)| (id, item)).collect())
    }
}

impl<S> std::fmt::Debug for OrderedMerger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMerger")
            .field("shards", &self.shards.len())
            .finish()
    }
}

fn spawn_ordered_producer<T: Send + 'static>(
    shard_id: ShardId,
    mut stream: BoxStream<'static, ShardResult<T>>,
    tx: mpsc::Sender<T>,
    fault_tx: mpsc::Sender<ShardError>,
    cancel: CancellationToken,
    observer: ObserverHandle,
    targeted: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    observer.shard_stopped(&shard_id, StopReason::Canceled);
                    return;
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(value)) => {
                    // Suspends when the prefetch buffer is full.
                    if tx.send(value).await.is_err() {
                        observer.shard_stopped(&shard_id, StopReason::Canceled);
                        return;
                    }
                }
                Some(Err(err)) => {
                    let wrapped = ShardError::new(
                        ShardErrorKind::Query,
                        "shard query producer failed",
                    )
                    .with_diagnostic(diag::PHASE, "ordered_merge")
                    .with_diagnostic(diag::SHARD_ID, &shard_id)
                    .with_diagnostic(diag::TARGETED_SHARD_COUNT, targeted)
                    .with_source(anyhow::Error::new(err));
                    let _ = fault_tx.send(wrapped).await;
                    observer.shard_stopped(&shard_id, StopReason::Faulted);
                    cancel.cancel();
                    return;
                }
                None => {
                    observer.shard_completed(&shard_id);
                    observer.shard_stopped(&shard_id, StopReason::Completed);
                    return;
                }
            }
        }
    })
}

/// Lazy, non-restartable ordered merge cursor.
pub struct OrderedMergeStream<T, Key: Ord> {
    slots: Vec<ShardSlot<T>>,
    heap: BinaryHeap<Reverse<HeadEntry<T, Key>>>,
    key_fn: Box<dyn Fn(&T) -> Key + Send + Sync>,
    fault_rx: mpsc::Receiver<ShardError>,
    cancel: CancellationToken,
    producers: Vec<JoinHandle<()>>,
    observer: ObserverHandle,
    primed: bool,
    finished: bool,
    pending_refill: Option<usize>,
    pops: u64,
    sample_every: u64,
}

impl<T, Key> OrderedMergeStream<T, Key>
where
    T: Send + 'static,
    Key: Ord,
{
    /// Next globally ordered item. Faults surface immediately, ahead of
    /// buffered items from other shards, and cancel the remaining
    /// producers best-effort.
    pub async fn next(&mut self) -> Option<ShardResult<(ShardId, T)>> {
        if self.finished {
            return None;
        }

        if !self.primed {
            // Fill one head per shard; latency here is the slowest first
            // item among shards, not the full result set.
            for index in 0..self.slots.len() {
                if let Err(cause) = self.fill_slot(index).await {
                    return Some(Err(self.finish(cause)));
                }
            }
            self.primed = true;
        }

        if let Some(index) = self.pending_refill.take() {
            if let Err(cause) = self.fill_slot(index).await {
                return Some(Err(self.finish(cause)));
            }
        }

        let Reverse(entry) = match self.heap.pop() {
            Some(entry) => entry,
            None => {
                self.finished = true;
                return None;
            }
        };

        self.pops += 1;
        if self.pops % self.sample_every == 0 {
            self.observer.heap_size_sample(self.heap.len());
        }

        // Refill lazily on the next call so this yield does not wait for
        // the popped shard's next item.
        self.pending_refill = Some(entry.shard_index);
        let shard_id = self.slots[entry.shard_index].shard_id.clone();
        self.observer.item_yielded(&shard_id);
        Some(Ok((shard_id, entry.item)))
    }

    /// Adapt the cursor into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = ShardResult<(ShardId, T)>> + Send
    where
        Key: Send + 'static,
    {
        futures::stream::unfold(self, |mut merge| async move {
            merge.next().await.map(|item| (item, merge))
        })
    }

    /// Cancel and wait for every producer task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.producers.drain(..) {
            let _ = handle.await;
        }
    }

    /// Test hook: true once every producer task has exited.
    pub fn producers_finished(&self) -> bool {
        self.producers.iter().all(JoinHandle::is_finished)
    }

    async fn fill_slot(&mut self, index: usize) -> Result<(), StopCause> {
        let received = {
            let (slots, fault_rx, cancel) = (&mut self.slots, &mut self.fault_rx, &self.cancel);
            let Some(rx) = slots[index].rx.as_mut() else {
                return Ok(());
            };
            // Fault checks win over cancellation: a faulting producer
            // cancels the shared token itself, and the fault is the
            // error the consumer should see.
            tokio::select! {
                biased;
                Some(err) = fault_rx.recv() => return Err(StopCause::Fault(err)),
                _ = cancel.cancelled() => return Err(StopCause::Cancelled),
                item = rx.recv() => item,
            }
        };
        match received {
            Some(value) => {
                let key = (self.key_fn)(&value);
                self.heap.push(Reverse(HeadEntry {
                    key,
                    shard_index: index,
                    item: value,
                }));
            }
            None => {
                // Producer exhausted; it leaves the heap for good.
                self.slots[index].rx = None;
            }
        }
        Ok(())
    }

    fn finish(&mut self, cause: StopCause) -> ShardError {
        self.finished = true;
        self.cancel.cancel();
        match cause {
            StopCause::Fault(err) => err,
            StopCause::Cancelled => ShardError::cancelled("ordered merge cancelled"),
        }
    }
}

impl<T, Key: Ord> Drop for OrderedMergeStream<T, Key> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T, Key: Ord> std::fmt::Debug for OrderedMergeStream<T, Key> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMergeStream")
            .field("shards", &self.slots.len())
            .field("heap", &self.heap.len())
            .field("finished", &self.finished)
            .finish()
    }
}
