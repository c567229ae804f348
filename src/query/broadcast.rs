// Unordered fan-out: one producer task per participating shard feeding a
// shared bounded FIFO. Output is arrival order; the bounded buffer is the
// backpressure mechanism.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

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

/// Default shared-buffer capacity for unordered fan-out.
pub const DEFAULT_BACKPRESSURE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct FanOutOptions {
    /// Shared buffer capacity. 0 means unbounded (no backpressure).
    pub backpressure_capacity: usize,
    pub health_filter: HealthFilter,
}

impl Default for FanOutOptions {
    fn default() -> Self {
        Self {
            backpressure_capacity: DEFAULT_BACKPRESSURE_CAPACITY,
            health_filter: HealthFilter::Include,
        }
    }
}

type Item<T> = ShardResult<(ShardId, T)>;

enum ItemTx<T> {
    Bounded(mpsc::Sender<Item<T>>),
    Unbounded(mpsc::UnboundedSender<Item<T>>),
}

impl<T> Clone for ItemTx<T> {
    fn clone(&self) -> Self {
        match self {
            ItemTx::Bounded(tx) => ItemTx::Bounded(tx.clone()),
            ItemTx::Unbounded(tx) => ItemTx::Unbounded(tx.clone()),
        }
    }
}

impl<T> ItemTx<T> {
    /// Send one item, reporting the paired backpressure events when the
    /// bounded buffer forces a wait. Err means the consumer is gone.
    async fn send(&self, item: Item<T>, observer: &ObserverHandle) -> Result<(), ()> {
        match self {
            ItemTx::Bounded(tx) => match tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(item)) => {
                    observer.backpressure_wait_start();
                    let sent = tx.send(item).await;
                    observer.backpressure_wait_stop();
                    sent.map_err(|_| ())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(()),
            },
            ItemTx::Unbounded(tx) => tx.send(item).map_err(|_| ()),
        }
    }
}

enum ItemRx<T> {
    Bounded(mpsc::Receiver<Item<T>>),
    Unbounded(mpsc::UnboundedReceiver<Item<T>>),
}

impl<T> ItemRx<T> {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Item<T>>> {
        match self {
            ItemRx::Bounded(rx) => rx.poll_recv(cx),
            ItemRx::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

/// Fans a per-shard query out across shards and interleaves the results.
pub struct ShardBroadcaster<S> {
    shards: Vec<Shard<S>>,
    health: Option<Arc<HealthTracker>>,
    observer: Arc<dyn MergeObserver>,
}

impl<S> ShardBroadcaster<S> {
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
            // No tracker: every shard counts as healthy.
            None => Ok(self.shards.clone()),
        }
    }

    /// Spawn one producer per participating shard and return the merged
    /// stream. Items arrive in completion order; per-shard order is the
    /// producer's own order. The enumeration ends when every producer has
    /// finished and the buffer is drained.
    ///
    /// Cancelling `cancel` (or dropping the stream) stops all producers
    /// promptly. The first producer fault is surfaced through the stream
    /// and cancels the remaining producers.
    pub fn fan_out<T, Q>(
        &self,
        query: Q,
        opts: FanOutOptions,
        cancel: CancellationToken,
    ) -> ShardResult<FanOutStream<T>>
    where
        T: Send + 'static,
        Q: Fn(&Shard<S>) -> BoxStream<'static, ShardResult<T>>,
    {
        if cancel.is_cancelled() {
            return Err(ShardError::cancelled("fan-out cancelled before start"));
        }
        let participants = self.participants(&opts.health_filter)?;
        let observer = ObserverHandle::new(Arc::clone(&self.observer));

        let (tx, rx) = if opts.backpressure_capacity == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (ItemTx::Unbounded(tx), ItemRx::Unbounded(rx))
        } else {
            let (tx, rx) = mpsc::channel(opts.backpressure_capacity);
            (ItemTx::Bounded(tx), ItemRx::Bounded(rx))
        };

        debug!(
            shard_count = participants.len(),
            capacity = opts.backpressure_capacity,
            "starting unordered fan-out"
        );

        let targeted = participants.len();
        let mut producers = Vec::with_capacity(targeted);
        for shard in &participants {
            let stream = query(shard);
            producers.push(spawn_producer(
                shard.id().clone(),
                stream,
                tx.clone(),
                cancel.clone(),
                observer.clone(),
                targeted,
            ));
        }
        drop(tx);

        Ok(FanOutStream {
            rx,
            cancel,
            producers,
            observer,
            terminated: false,
        })
    }
}

impl<S> std::fmt::Debug for ShardBroadcaster<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardBroadcaster")
            .field("shards", &self.shards.len())
            .finish()
    }
}

fn spawn_producer<T: Send + 'static>(
    shard_id: ShardId,
    mut stream: BoxStream<'static, ShardResult<T>>,
    tx: ItemTx<T>,
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
                    if tx
                        .send(Ok((shard_id.clone(), value)), &observer)
                        .await
                        .is_err()
                    {
                        observer.shard_stopped(&shard_id, StopReason::Canceled);
                        return;
                    }
                }
                Some(Err(err)) => {
                    let wrapped = ShardError::new(
                        ShardErrorKind::Query,
                        "shard query producer failed",
                    )
                    .with_diagnostic(diag::PHASE, "fan_out")
                    .with_diagnostic(diag::SHARD_ID, &shard_id)
                    .with_diagnostic(diag::TARGETED_SHARD_COUNT, targeted)
                    .with_source(anyhow::Error::new(err));
                    let _ = tx.send(Err(wrapped), &observer).await;
                    observer.shard_stopped(&shard_id, StopReason::Faulted);
                    // Best-effort: stop the sibling producers too.
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

/// Lazily consumed, non-restartable fan-out result stream.
///
/// Dropping the stream cancels all producers; `shutdown` does the same
/// and waits for them to exit.
pub struct FanOutStream<T> {
    rx: ItemRx<T>,
    cancel: CancellationToken,
    producers: Vec<JoinHandle<()>>,
    observer: ObserverHandle,
    terminated: bool,
}

impl<T> FanOutStream<T> {
    /// Cooperative cancellation without consuming the stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for every producer task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.producers.drain(..) {
            let _ = handle.await;
        }
    }

    /// True once every producer task has exited. Test hook for the
    /// no-leaked-producers property.
    pub fn producers_finished(&self) -> bool {
        self.producers.iter().all(JoinHandle::is_finished)
    }
}

impl<T> Stream for FanOutStream<T> {
    type Item = ShardResult<(ShardId, T)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok((shard_id, value)))) => {
                this.observer.item_yielded(&shard_id);
                Poll::Ready(Some(Ok((shard_id, value))))
            }
            Poll::Ready(Some(Err(err))) => {
                // First fault ends the enumeration.
                this.terminated = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for FanOutStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> std::fmt::Debug for FanOutStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutStream")
            .field("producers", &self.producers.len())
            .field("terminated", &self.terminated)
            .finish()
    }
}
