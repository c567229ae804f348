// Migration executor: drives every key of a plan through
// Planned → Copying → Copied → Verifying → Verified → Swapping → Done,
// with Failed as the only alternative terminal state. Copy and verify
// run under separate concurrency limits (interleaved by default), the
// swapper batches verified keys, and the whole run checkpoints itself so
// an identical re-run converges without repeating work or counters.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{KeyMove, ShardKey};
use crate::error::{diag, ShardError, ShardResult};
use crate::metrics::{noop_metrics, Counter, Gauge, Histogram, MetricsHandle, MetricsSink};
use crate::migration::checkpoint::{Checkpoint, CheckpointStore, KeyMoveState};
use crate::migration::plan::MigrationPlan;
use crate::migration::traits::{DataMover, MapSwapper, MoveFault, VerificationStrategy, VerifyOutcome};

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Max simultaneous copies.
    pub copy_concurrency: usize,
    /// Max simultaneous verifications.
    pub verify_concurrency: usize,
    /// Keys swapped per batch. Atomicity stays per key.
    pub swap_batch_size: usize,
    /// Transient attempts per operation.
    pub max_retries: u32,
    /// Exponential backoff base (doubled per attempt).
    pub retry_base_delay: Duration,
    /// Start verifying a key as soon as it is Copied.
    pub interleave_copy_and_verify: bool,
    /// Unsafe emergency override: swap keys that failed verification.
    pub force_swap_on_verification_failure: bool,
    /// Time-based checkpoint flush cadence.
    pub checkpoint_flush_interval: Duration,
    /// Count-based checkpoint flush trigger.
    pub checkpoint_flush_every_transitions: usize,
    /// Minimum gap between progress events.
    pub progress_interval: Duration,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            copy_concurrency: 32,
            verify_concurrency: 32,
            swap_batch_size: 500,
            max_retries: 5,
            retry_base_delay: Duration::from_millis(100),
            interleave_copy_and_verify: true,
            force_swap_on_verification_failure: false,
            checkpoint_flush_interval: Duration::from_secs(2),
            checkpoint_flush_every_transitions: 1000,
            progress_interval: Duration::from_secs(1),
        }
    }
}

/// Periodic and final run progress. `finished` is true exactly once, on
/// the unconditional final event.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationProgress {
    pub plan_id: Uuid,
    pub total: usize,
    pub copied: usize,
    pub verified: usize,
    pub done: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub finished: bool,
}

/// Terminal accounting for one run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub plan_id: Uuid,
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub retries: u64,
    pub elapsed: Duration,
}

struct RunState<K> {
    states: HashMap<ShardKey<K>, KeyMoveState>,
    version: u64,
    last_processed_index: usize,
    transitions_since_flush: usize,
    last_flush: Instant,
}

struct ExecCtx<K> {
    plan_id: Uuid,
    options: MigrationOptions,
    state: Mutex<RunState<K>>,
    flush_lock: tokio::sync::Mutex<()>,
    checkpoints: Arc<dyn CheckpointStore<K>>,
    metrics: MetricsHandle,
    retries: AtomicU64,
    active_copy: AtomicI64,
    active_verify: AtomicI64,
}

impl<K> ExecCtx<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Advance one key. Returns false when the step is not legal from the
    /// key's current state (terminal keys, stale workers). Metric
    /// counters fire here, exactly once per reached state per run.
    fn transition(&self, key: &ShardKey<K>, next: KeyMoveState) -> bool {
        let mut state = self.state.lock();
        let current = state
            .states
            .get(key)
            .copied()
            .unwrap_or(KeyMoveState::Planned);
        if current == next {
            // Re-entry on retry: legal, but not a new transition.
            return true;
        }
        if !current.can_advance_to(next) {
            return false;
        }
        state.states.insert(key.clone(), next);
        state.transitions_since_flush += 1;
        drop(state);

        match next {
            KeyMoveState::Copied => self.metrics.incr(Counter::Copied, 1),
            KeyMoveState::Verified => self.metrics.incr(Counter::Verified, 1),
            KeyMoveState::Done => self.metrics.incr(Counter::Swapped, 1),
            KeyMoveState::Failed => self.metrics.incr(Counter::Failed, 1),
            _ => {}
        }
        true
    }

    /// Restore a key to Verified after an unrecoverable swap attempt.
    /// The one sanctioned backward move; earlier states are never
    /// rewound and no counters fire.
    fn restore_verified(&self, key: &ShardKey<K>) {
        let mut state = self.state.lock();
        if state.states.get(key) == Some(&KeyMoveState::Swapping) {
            state.states.insert(key.clone(), KeyMoveState::Verified);
        }
    }

    fn current_state(&self, key: &ShardKey<K>) -> KeyMoveState {
        self.state
            .lock()
            .states
            .get(key)
            .copied()
            .unwrap_or(KeyMoveState::Planned)
    }

    fn flush_due(&self) -> bool {
        let state = self.state.lock();
        state.transitions_since_flush >= self.options.checkpoint_flush_every_transitions
            || (state.transitions_since_flush > 0
                && state.last_flush.elapsed() >= self.options.checkpoint_flush_interval)
    }

    /// Persist a checkpoint. Serialized so versions reach the store in
    /// order; state is cloned out before the store call (defensive copy).
    async fn flush(&self) -> ShardResult<()> {
        let _guard = self.flush_lock.lock().await;
        let checkpoint = {
            let mut state = self.state.lock();
            state.version += 1;
            state.transitions_since_flush = 0;
            state.last_flush = Instant::now();
            Checkpoint {
                plan_id: self.plan_id,
                version: state.version,
                updated_at: Utc::now(),
                states: state.states.clone(),
                last_processed_index: state.last_processed_index,
            }
        };
        self.checkpoints.persist(&checkpoint).await
    }

    async fn flush_if_due(&self) {
        if self.flush_due() {
            if let Err(err) = self.flush().await {
                warn!(plan_id = %self.plan_id, error = %err, "periodic checkpoint flush failed");
            }
        }
    }

    fn progress(&self, total: usize, started: Instant, finished: bool) -> MigrationProgress {
        let state = self.state.lock();
        let mut copied = 0;
        let mut verified = 0;
        let mut done = 0;
        let mut failed = 0;
        for key_state in state.states.values() {
            match key_state {
                KeyMoveState::Failed => failed += 1,
                KeyMoveState::Done => {
                    done += 1;
                    copied += 1;
                    verified += 1;
                }
                KeyMoveState::Verified | KeyMoveState::Swapping => {
                    copied += 1;
                    verified += 1;
                }
                KeyMoveState::Copied | KeyMoveState::Verifying => copied += 1,
                KeyMoveState::Planned | KeyMoveState::Copying => {}
            }
        }
        MigrationProgress {
            plan_id: self.plan_id,
            total,
            copied,
            verified,
            done,
            failed,
            elapsed_ms: started.elapsed().as_millis() as u64,
            finished,
        }
    }
}

enum Attempted<T> {
    Ok(T),
    Failed(ShardError),
    Cancelled,
}

/// Retry transient faults with exponential backoff; permanent faults and
/// exhausted budgets fail. Every backed-off retry bumps the retries
/// counter.
async fn with_retries<K, T, Fut>(
    ctx: &ExecCtx<K>,
    cancel: &CancellationToken,
    phase: &'static str,
    mut op: impl FnMut() -> Fut,
) -> Attempted<T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    Fut: Future<Output = Result<T, MoveFault>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Attempted::Cancelled;
        }
        match op().await {
            Ok(value) => return Attempted::Ok(value),
            Err(MoveFault::Transient(err)) if attempt < ctx.options.max_retries => {
                ctx.metrics.incr(Counter::Retries, 1);
                ctx.retries.fetch_add(1, Ordering::Relaxed);
                let delay = ctx.options.retry_base_delay * 2_u32.saturating_pow(attempt);
                attempt += 1;
                debug!(phase, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient failure, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Attempted::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(MoveFault::Transient(err)) => {
                return Attempted::Failed(
                    err.with_diagnostic(diag::PHASE, phase)
                        .with_diagnostic(diag::ATTEMPT_COUNT, attempt + 1),
                );
            }
            Err(MoveFault::Permanent(err)) => {
                return Attempted::Failed(
                    err.with_diagnostic(diag::PHASE, phase)
                        .with_diagnostic(diag::ATTEMPT_COUNT, attempt + 1),
                );
            }
        }
    }
}

/// Drives migration plans. Collaborators are pluggable; the executor owns
/// only scheduling, retry classification handling, checkpointing and
/// accounting.
pub struct MigrationExecutor<K> {
    mover: Arc<dyn DataMover<K>>,
    verifier: Arc<dyn VerificationStrategy<K>>,
    swapper: Arc<dyn MapSwapper<K>>,
    checkpoints: Arc<dyn CheckpointStore<K>>,
    metrics: Arc<dyn MetricsSink>,
    options: MigrationOptions,
}

impl<K> MigrationExecutor<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(
        mover: Arc<dyn DataMover<K>>,
        verifier: Arc<dyn VerificationStrategy<K>>,
        swapper: Arc<dyn MapSwapper<K>>,
        checkpoints: Arc<dyn CheckpointStore<K>>,
    ) -> Self {
        Self {
            mover,
            verifier,
            swapper,
            checkpoints,
            metrics: noop_metrics(),
            options: MigrationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MigrationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Execute (or resume) a plan.
    ///
    /// Idempotent per plan id: keys already persisted in a terminal or
    /// advanced state are not re-copied, re-verified or re-counted. On
    /// cancellation a checkpoint is flushed and `Cancelled` surfaces;
    /// cancelled keys are never counted as failed.
    pub async fn execute(
        &self,
        plan: &MigrationPlan<K>,
        progress: Option<mpsc::Sender<MigrationProgress>>,
        cancel: CancellationToken,
    ) -> ShardResult<MigrationSummary> {
        let started = Instant::now();
        let metrics = MetricsHandle::new(Arc::clone(&self.metrics));

        // Load the checkpoint, or initialize every key to Planned.
        let existing = self.checkpoints.load(plan.plan_id).await?;
        let resumed = existing.is_some();
        let (mut states, start_version) = match existing {
            Some(cp) => (cp.states, cp.version),
            None => (HashMap::new(), 0),
        };
        let mut newly_planned: u64 = 0;
        for mv in &plan.moves {
            states.entry(mv.key.clone()).or_insert_with(|| {
                newly_planned += 1;
                KeyMoveState::Planned
            });
        }
        if newly_planned > 0 {
            metrics.incr(Counter::Planned, newly_planned);
        }
        info!(
            plan_id = %plan.plan_id,
            moves = plan.moves.len(),
            resumed,
            newly_planned,
            "migration run starting"
        );

        let ctx = Arc::new(ExecCtx {
            plan_id: plan.plan_id,
            options: self.options.clone(),
            state: Mutex::new(RunState {
                states,
                version: start_version,
                last_processed_index: 0,
                transitions_since_flush: 0,
                last_flush: Instant::now(),
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            checkpoints: Arc::clone(&self.checkpoints),
            metrics: metrics.clone(),
            retries: AtomicU64::new(0),
            active_copy: AtomicI64::new(0),
            active_verify: AtomicI64::new(0),
        });

        // Initial checkpoint so a crash before the first flush still
        // resumes with the planned key set.
        if !resumed {
            ctx.flush().await?;
        }

        // Throttled progress reporter; the final event is emitted
        // unconditionally below.
        let reporter_stop = CancellationToken::new();
        let reporter = progress.clone().map(|sink| {
            let ctx = Arc::clone(&ctx);
            let stop = reporter_stop.clone();
            let interval = self.options.progress_interval;
            let total = plan.moves.len();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if sink.send(ctx.progress(total, started, false)).await.is_err() {
                        return;
                    }
                }
            })
        });

        let (verify_tx, verify_rx) = mpsc::unbounded_channel::<KeyMove<K>>();
        let (swap_tx, swap_rx) = mpsc::unbounded_channel::<KeyMove<K>>();

        let verify_task = tokio::spawn(verify_stage(
            Arc::clone(&ctx),
            Arc::clone(&self.verifier),
            verify_rx,
            swap_tx.clone(),
            cancel.clone(),
        ));
        let swap_task = tokio::spawn(swap_stage(
            Arc::clone(&ctx),
            Arc::clone(&self.swapper),
            swap_rx,
            cancel.clone(),
        ));

        self.copy_stage(plan, &ctx, &verify_tx, &swap_tx, &cancel).await;

        drop(verify_tx);
        drop(swap_tx);
        if let Err(err) = verify_task.await {
            warn!(plan_id = %plan.plan_id, error = %err, "verify stage task aborted");
        }
        if let Err(err) = swap_task.await {
            warn!(plan_id = %plan.plan_id, error = %err, "swap stage task aborted");
        }

        reporter_stop.cancel();
        if let Some(handle) = reporter {
            let _ = handle.await;
        }

        // Terminal (or cancellation) flush, then the final progress
        // event, regardless of the throttle.
        ctx.flush().await?;
        let final_progress = ctx.progress(plan.moves.len(), started, true);
        if let Some(sink) = &progress {
            let _ = sink.send(final_progress.clone()).await;
        }
        metrics.observe(Histogram::TotalElapsed, started.elapsed());

        if cancel.is_cancelled() {
            info!(plan_id = %plan.plan_id, "migration run cancelled");
            return Err(ShardError::cancelled("migration run cancelled")
                .with_diagnostic(diag::PLAN_ID, plan.plan_id));
        }

        let summary = MigrationSummary {
            plan_id: plan.plan_id,
            total: plan.moves.len(),
            done: final_progress.done,
            failed: final_progress.failed,
            retries: ctx.retries.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };
        info!(
            plan_id = %plan.plan_id,
            done = summary.done,
            failed = summary.failed,
            retries = summary.retries,
            "migration run finished"
        );
        Ok(summary)
    }

    /// Dispatch copy workers in plan order under the copy semaphore and
    /// route resumed keys to the stage they reached.
    async fn copy_stage(
        &self,
        plan: &MigrationPlan<K>,
        ctx: &Arc<ExecCtx<K>>,
        verify_tx: &mpsc::UnboundedSender<KeyMove<K>>,
        swap_tx: &mpsc::UnboundedSender<KeyMove<K>>,
        cancel: &CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.options.copy_concurrency.max(1)));
        let mut workers: JoinSet<()> = JoinSet::new();
        let interleave = self.options.interleave_copy_and_verify;

        for (index, mv) in plan.moves.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            ctx.state.lock().last_processed_index = index;

            match ctx.current_state(&mv.key) {
                KeyMoveState::Done | KeyMoveState::Failed => continue,
                KeyMoveState::Verified | KeyMoveState::Swapping => {
                    let _ = swap_tx.send(mv.clone());
                    continue;
                }
                KeyMoveState::Copied | KeyMoveState::Verifying => {
                    if interleave {
                        let _ = verify_tx.send(mv.clone());
                    }
                    continue;
                }
                KeyMoveState::Planned | KeyMoveState::Copying => {}
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let ctx = Arc::clone(ctx);
            let mover = Arc::clone(&self.mover);
            let mv = mv.clone();
            let verify_tx = if interleave {
                Some(verify_tx.clone())
            } else {
                None
            };
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                copy_one(&ctx, mover.as_ref(), &mv, verify_tx, &cancel).await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "copy worker aborted");
            }
        }

        // Phase-gated mode: verification starts only after every copy is
        // finished, still in plan order.
        if !interleave && !cancel.is_cancelled() {
            for mv in &plan.moves {
                if matches!(
                    ctx.current_state(&mv.key),
                    KeyMoveState::Copied | KeyMoveState::Verifying
                ) {
                    let _ = verify_tx.send(mv.clone());
                }
            }
        }
    }
}

impl<K> std::fmt::Debug for MigrationExecutor<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationExecutor")
            .field("options", &self.options)
            .finish()
    }
}

async fn copy_one<K>(
    ctx: &ExecCtx<K>,
    mover: &dyn DataMover<K>,
    mv: &KeyMove<K>,
    verify_tx: Option<mpsc::UnboundedSender<KeyMove<K>>>,
    cancel: &CancellationToken,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    if !ctx.transition(&mv.key, KeyMoveState::Copying) {
        return;
    }
    let active = ctx.active_copy.fetch_add(1, Ordering::Relaxed) + 1;
    ctx.metrics.gauge(Gauge::ActiveCopy, active);

    let started = Instant::now();
    let outcome = with_retries(ctx, cancel, "copy", || mover.copy(mv)).await;

    let active = ctx.active_copy.fetch_sub(1, Ordering::Relaxed) - 1;
    ctx.metrics.gauge(Gauge::ActiveCopy, active);

    match outcome {
        Attempted::Ok(()) => {
            ctx.metrics.observe(Histogram::CopyDuration, started.elapsed());
            if ctx.transition(&mv.key, KeyMoveState::Copied) {
                if let Some(tx) = verify_tx {
                    let _ = tx.send(mv.clone());
                }
            }
        }
        Attempted::Failed(err) => {
            warn!(
                source = %mv.source,
                target = %mv.target,
                error = %err,
                "copy failed permanently"
            );
            ctx.transition(&mv.key, KeyMoveState::Failed);
        }
        Attempted::Cancelled => {}
    }
    ctx.flush_if_due().await;
}

async fn verify_stage<K>(
    ctx: Arc<ExecCtx<K>>,
    verifier: Arc<dyn VerificationStrategy<K>>,
    mut rx: mpsc::UnboundedReceiver<KeyMove<K>>,
    swap_tx: mpsc::UnboundedSender<KeyMove<K>>,
    cancel: CancellationToken,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(ctx.options.verify_concurrency.max(1)));
    let mut workers: JoinSet<()> = JoinSet::new();

    loop {
        let mv = tokio::select! {
            _ = cancel.cancelled() => break,
            mv = rx.recv() => match mv {
                Some(mv) => mv,
                None => break,
            },
        };
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let ctx = Arc::clone(&ctx);
        let verifier = Arc::clone(&verifier);
        let swap_tx = swap_tx.clone();
        let cancel = cancel.clone();
        workers.spawn(async move {
            let _permit = permit;
            verify_one(&ctx, verifier.as_ref(), &mv, &swap_tx, &cancel).await;
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "verify worker aborted");
        }
    }
}

async fn verify_one<K>(
    ctx: &ExecCtx<K>,
    verifier: &dyn VerificationStrategy<K>,
    mv: &KeyMove<K>,
    swap_tx: &mpsc::UnboundedSender<KeyMove<K>>,
    cancel: &CancellationToken,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    if !ctx.transition(&mv.key, KeyMoveState::Verifying) {
        return;
    }
    let active = ctx.active_verify.fetch_add(1, Ordering::Relaxed) + 1;
    ctx.metrics.gauge(Gauge::ActiveVerify, active);

    let started = Instant::now();
    let outcome = with_retries(ctx, cancel, "verify", || verifier.verify(mv)).await;

    let active = ctx.active_verify.fetch_sub(1, Ordering::Relaxed) - 1;
    ctx.metrics.gauge(Gauge::ActiveVerify, active);

    match outcome {
        Attempted::Ok(VerifyOutcome::Equal) => {
            ctx.metrics.observe(Histogram::VerifyDuration, started.elapsed());
            if ctx.transition(&mv.key, KeyMoveState::Verified) {
                let _ = swap_tx.send(mv.clone());
            }
        }
        Attempted::Ok(VerifyOutcome::Mismatch) => {
            if ctx.options.force_swap_on_verification_failure {
                warn!(
                    source = %mv.source,
                    target = %mv.target,
                    "verification mismatch overridden, forcing swap"
                );
                if ctx.transition(&mv.key, KeyMoveState::Verified) {
                    let _ = swap_tx.send(mv.clone());
                }
            } else {
                warn!(
                    source = %mv.source,
                    target = %mv.target,
                    "verification mismatch, key failed"
                );
                ctx.transition(&mv.key, KeyMoveState::Failed);
            }
        }
        Attempted::Failed(err) => {
            warn!(
                source = %mv.source,
                target = %mv.target,
                error = %err,
                "verification failed permanently"
            );
            ctx.transition(&mv.key, KeyMoveState::Failed);
        }
        Attempted::Cancelled => {}
    }
    ctx.flush_if_due().await;
}

async fn swap_stage<K>(
    ctx: Arc<ExecCtx<K>>,
    swapper: Arc<dyn MapSwapper<K>>,
    mut rx: mpsc::UnboundedReceiver<KeyMove<K>>,
    cancel: CancellationToken,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    let batch_size = ctx.options.swap_batch_size.max(1);
    let mut batch: Vec<KeyMove<K>> = Vec::with_capacity(batch_size);

    loop {
        let mv = tokio::select! {
            _ = cancel.cancelled() => return,
            mv = rx.recv() => match mv {
                Some(mv) => mv,
                None => break,
            },
        };
        batch.push(mv);
        if batch.len() >= batch_size {
            swap_batch(&ctx, swapper.as_ref(), &mut batch, &cancel).await;
        }
    }
    if !batch.is_empty() && !cancel.is_cancelled() {
        swap_batch(&ctx, swapper.as_ref(), &mut batch, &cancel).await;
    }
}

async fn swap_batch<K>(
    ctx: &ExecCtx<K>,
    swapper: &dyn MapSwapper<K>,
    batch: &mut Vec<KeyMove<K>>,
    cancel: &CancellationToken,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    for mv in batch.iter() {
        ctx.transition(&mv.key, KeyMoveState::Swapping);
    }

    let started = Instant::now();
    let outcome = with_retries(ctx, cancel, "swap", || swapper.swap(batch)).await;

    match outcome {
        Attempted::Ok(()) => {
            ctx.metrics
                .observe(Histogram::SwapBatchDuration, started.elapsed());
            for mv in batch.iter() {
                ctx.transition(&mv.key, KeyMoveState::Done);
            }
            debug!(keys = batch.len(), "swap batch applied");
        }
        Attempted::Failed(err) => {
            // Keys stay Verified so a later run retries the swap.
            warn!(keys = batch.len(), error = %err, "swap batch failed, keys remain verified");
            for mv in batch.iter() {
                ctx.restore_verified(&mv.key);
            }
        }
        Attempted::Cancelled => {
            for mv in batch.iter() {
                ctx.restore_verified(&mv.key);
            }
        }
    }
    batch.clear();
    ctx.flush_if_due().await;
}
