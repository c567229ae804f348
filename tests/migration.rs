use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shardmux::metrics::Counter;
use shardmux::migration::{
    Checkpoint, CheckpointStore, DataMover, FaultInjectingSwapper, FullEqualityVerifier,
    InMemoryCheckpointStore, InMemoryDataMover, InMemoryShardSet, KeyMoveState, MapSwapper,
    MigrationExecutor, MigrationOptions, MigrationPlan, MoveFault, ScriptedFault,
    StoreMapSwapper, VerificationStrategy, VerifyOutcome,
};
use shardmux::routing::ShardMapStore;
use shardmux::{InMemoryMetrics, InMemoryShardMapStore, KeyMove, ShardId, ShardKey};

fn key(s: &str) -> ShardKey<String> {
    ShardKey::new(s.to_string())
}

/// Opt-in log output: RUST_LOG=shardmux=debug cargo test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct Rig {
    data: Arc<InMemoryShardSet<String>>,
    map_store: Arc<InMemoryShardMapStore<String>>,
    mover: Arc<InMemoryDataMover<String>>,
    verifier: Arc<FullEqualityVerifier<String>>,
    swapper: Arc<StoreMapSwapper<String>>,
    checkpoints: Arc<InMemoryCheckpointStore<String>>,
    metrics: Arc<InMemoryMetrics>,
    plan: MigrationPlan<String>,
}

/// Seed `count` keys on s1 and build a plan moving all of them to s2.
fn rig(count: usize) -> Rig {
    let data = Arc::new(InMemoryShardSet::new());
    let map_store = Arc::new(InMemoryShardMapStore::new());
    let source = ShardId::new("s1");
    let target = ShardId::new("s2");

    let mut moves = Vec::with_capacity(count);
    for i in 0..count {
        let k = key(&format!("k{i}"));
        data.insert(&source, k.clone(), format!("value-{i}").into_bytes());
        map_store.try_assign(&k, &source);
        moves.push(KeyMove::new(k, source.clone(), target.clone()).unwrap());
    }

    Rig {
        mover: Arc::new(InMemoryDataMover::new(Arc::clone(&data))),
        verifier: Arc::new(FullEqualityVerifier::new(Arc::clone(&data))),
        swapper: Arc::new(StoreMapSwapper::new(
            Arc::clone(&map_store) as Arc<dyn ShardMapStore<String>>
        )),
        checkpoints: Arc::new(InMemoryCheckpointStore::new()),
        metrics: Arc::new(InMemoryMetrics::new()),
        data,
        map_store,
        plan: MigrationPlan::new(moves),
    }
}

fn executor(rig: &Rig, options: MigrationOptions) -> MigrationExecutor<String> {
    MigrationExecutor::new(
        rig.mover.clone(),
        rig.verifier.clone(),
        rig.swapper.clone(),
        rig.checkpoints.clone(),
    )
    .with_options(options)
    .with_metrics(rig.metrics.clone())
}

fn fast_options() -> MigrationOptions {
    MigrationOptions {
        retry_base_delay: Duration::from_millis(1),
        progress_interval: Duration::from_millis(10),
        ..MigrationOptions::default()
    }
}

// Seeded scenario: 1000 moves, CopyConcurrency=16, VerifyConcurrency=8,
// SwapBatchSize=64. Everything lands Done, and an immediate second run
// of the same plan reports the same summary with zero extra counters.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_migrates_everything_and_reruns_idempotently() {
    init_tracing();
    let rig = rig(1000);
    let exec = executor(
        &rig,
        MigrationOptions {
            copy_concurrency: 16,
            verify_concurrency: 8,
            swap_batch_size: 64,
            ..fast_options()
        },
    );

    let summary = exec
        .execute(&rig.plan, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.done, 1000);
    assert_eq!(summary.failed, 0);

    assert_eq!(rig.metrics.counter(Counter::Planned), 1000);
    assert_eq!(rig.metrics.counter(Counter::Copied), 1000);
    assert_eq!(rig.metrics.counter(Counter::Verified), 1000);
    assert_eq!(rig.metrics.counter(Counter::Swapped), 1000);
    assert_eq!(rig.metrics.counter(Counter::Failed), 0);

    // Authoritative map and data both moved.
    for i in 0..1000 {
        let k = key(&format!("k{i}"));
        assert_eq!(rig.map_store.try_get(&k), Some(ShardId::new("s2")));
        assert!(rig.data.get(&ShardId::new("s2"), &k).is_some());
    }

    // Second run: same terminal summary, no counter movement, no copies.
    let attempts_before = rig.mover.copy_attempts(&key("k0"));
    let second = exec
        .execute(&rig.plan, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.done, 1000);
    assert_eq!(second.failed, 0);
    assert_eq!(rig.metrics.counter(Counter::Planned), 1000);
    assert_eq!(rig.metrics.counter(Counter::Copied), 1000);
    assert_eq!(rig.metrics.counter(Counter::Verified), 1000);
    assert_eq!(rig.metrics.counter(Counter::Swapped), 1000);
    assert_eq!(rig.mover.copy_attempts(&key("k0")), attempts_before);
}

struct CountingVerifier {
    inner: Arc<dyn VerificationStrategy<String>>,
    calls: Mutex<HashMap<ShardKey<String>, u32>>,
}

impl CountingVerifier {
    fn new(inner: Arc<dyn VerificationStrategy<String>>) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls_for(&self, k: &ShardKey<String>) -> u32 {
        self.calls.lock().unwrap().get(k).copied().unwrap_or(0)
    }
}

#[async_trait]
impl VerificationStrategy<String> for CountingVerifier {
    async fn verify(&self, mv: &KeyMove<String>) -> Result<VerifyOutcome, MoveFault> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(mv.key.clone())
            .or_insert(0) += 1;
        self.inner.verify(mv).await
    }
}

// Seeded scenario: k0 has two transient copy failures then succeeds, k1
// fails permanently, k2 is clean. Done=2, Failed=1, at least two
// retries, and k1 never reaches verification.
#[tokio::test]
async fn mixed_faults_classify_and_isolate_failures() {
    let rig = rig(3);
    rig.mover.fail_transient(&key("k0"), 2);
    rig.mover.fail_permanent(&key("k1"));

    let verifier = Arc::new(CountingVerifier::new(rig.verifier.clone()));
    let exec = MigrationExecutor::new(
        rig.mover.clone(),
        verifier.clone(),
        rig.swapper.clone(),
        rig.checkpoints.clone(),
    )
    .with_options(MigrationOptions {
        max_retries: 5,
        ..fast_options()
    })
    .with_metrics(rig.metrics.clone());

    let summary = exec
        .execute(&rig.plan, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.done, 2);
    assert_eq!(summary.failed, 1);
    assert!(summary.retries >= 2, "retries: {}", summary.retries);
    assert!(rig.metrics.counter(Counter::Retries) >= 2);

    assert_eq!(verifier.calls_for(&key("k1")), 0);
    assert!(verifier.calls_for(&key("k0")) >= 1);

    let checkpoint = rig.checkpoints.load(rig.plan.plan_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.states.get(&key("k1")), Some(&KeyMoveState::Failed));
    assert_eq!(checkpoint.states.get(&key("k0")), Some(&KeyMoveState::Done));

    // The failed key's mapping was never swapped.
    assert_eq!(rig.map_store.try_get(&key("k1")), Some(ShardId::new("s1")));
}

// Resume: keys persisted as Copied are not copied again and `planned`
// is not re-incremented.
#[tokio::test]
async fn resume_skips_persisted_progress_without_recounting() {
    let rig = rig(50);
    let mut checkpoint = Checkpoint::new(rig.plan.plan_id);
    checkpoint.version = 4;
    for mv in &rig.plan.moves {
        checkpoint.states.insert(mv.key.clone(), KeyMoveState::Copied);
        // The data made it across before the previous run stopped.
        let value = rig.data.get(&mv.source, &mv.key).unwrap();
        rig.data.insert(&mv.target, mv.key.clone(), value);
    }
    rig.checkpoints.persist(&checkpoint).await.unwrap();

    let exec = executor(&rig, fast_options());
    let summary = exec
        .execute(&rig.plan, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.done, 50);
    assert_eq!(summary.failed, 0);
    assert_eq!(rig.metrics.counter(Counter::Planned), 0);
    assert_eq!(rig.metrics.counter(Counter::Copied), 0);
    assert_eq!(rig.metrics.counter(Counter::Verified), 50);
    assert_eq!(rig.metrics.counter(Counter::Swapped), 50);
    for mv in &rig.plan.moves {
        assert_eq!(rig.mover.copy_attempts(&mv.key), 0);
    }
}

/// Records every persisted checkpoint so tests can inspect the state
/// history.
struct RecordingCheckpointStore {
    inner: InMemoryCheckpointStore<String>,
    history: Mutex<Vec<HashMap<ShardKey<String>, KeyMoveState>>>,
}

impl RecordingCheckpointStore {
    fn new() -> Self {
        Self {
            inner: InMemoryCheckpointStore::new(),
            history: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CheckpointStore<String> for RecordingCheckpointStore {
    async fn load(&self, plan_id: uuid::Uuid) -> shardmux::ShardResult<Option<Checkpoint<String>>> {
        self.inner.load(plan_id).await
    }

    async fn persist(&self, checkpoint: &Checkpoint<String>) -> shardmux::ShardResult<()> {
        self.history.lock().unwrap().push(checkpoint.states.clone());
        self.inner.persist(checkpoint).await
    }
}

// Monotonicity: across every persisted checkpoint, a key's state only
// moves forward (or lands on Failed).
#[tokio::test]
async fn persisted_states_progress_monotonically() {
    let rig = rig(40);
    let recording = Arc::new(RecordingCheckpointStore::new());
    let exec = MigrationExecutor::new(
        rig.mover.clone(),
        rig.verifier.clone(),
        rig.swapper.clone(),
        recording.clone(),
    )
    .with_options(MigrationOptions {
        checkpoint_flush_every_transitions: 1,
        swap_batch_size: 8,
        ..fast_options()
    });

    exec.execute(&rig.plan, None, CancellationToken::new())
        .await
        .unwrap();

    let history = recording.history.lock().unwrap();
    assert!(history.len() > 2, "expected several flushes");
    for mv in &rig.plan.moves {
        let mut last_rank = 0_u8;
        for snapshot in history.iter() {
            if let Some(state) = snapshot.get(&mv.key) {
                let rank = state.rank();
                assert!(
                    rank >= last_rank,
                    "key {:?} went backwards: {last_rank} -> {rank}",
                    mv.key
                );
                last_rank = rank;
            }
        }
        assert_eq!(last_rank, KeyMoveState::Done.rank());
    }
}

// An unrecoverable swap leaves keys Verified; the next run completes
// them without redoing copy or verify.
#[tokio::test]
async fn failed_swap_keeps_keys_verified_for_the_next_run() {
    let rig = rig(10);
    let faulty = Arc::new(FaultInjectingSwapper::new(
        rig.swapper.clone() as Arc<dyn MapSwapper<String>>
    ));
    faulty.push_fault(ScriptedFault::Permanent);

    let exec = MigrationExecutor::new(
        rig.mover.clone(),
        rig.verifier.clone(),
        faulty.clone(),
        rig.checkpoints.clone(),
    )
    .with_options(MigrationOptions {
        swap_batch_size: 100,
        ..fast_options()
    })
    .with_metrics(rig.metrics.clone());

    let first = exec
        .execute(&rig.plan, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.done, 0);
    assert_eq!(first.failed, 0);

    let checkpoint = rig.checkpoints.load(rig.plan.plan_id).await.unwrap().unwrap();
    for mv in &rig.plan.moves {
        assert_eq!(
            checkpoint.states.get(&mv.key),
            Some(&KeyMoveState::Verified)
        );
    }

    let copies_before = rig.mover.copy_attempts(&key("k0"));
    let second = exec
        .execute(&rig.plan, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.done, 10);
    assert_eq!(rig.mover.copy_attempts(&key("k0")), copies_before);
}

struct SlowMover;

#[async_trait]
impl DataMover<String> for SlowMover {
    async fn copy(&self, _mv: &KeyMove<String>) -> Result<(), MoveFault> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(())
    }
}

// Cancellation flushes a checkpoint, surfaces as Cancelled, and counts
// nothing as failed.
#[tokio::test]
async fn cancellation_flushes_and_is_not_a_failure() {
    let rig = rig(40);
    let exec = MigrationExecutor::new(
        Arc::new(SlowMover),
        rig.verifier.clone(),
        rig.swapper.clone(),
        rig.checkpoints.clone(),
    )
    .with_options(MigrationOptions {
        copy_concurrency: 2,
        ..fast_options()
    })
    .with_metrics(rig.metrics.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let err = exec.execute(&rig.plan, None, cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(rig.metrics.counter(Counter::Failed), 0);

    // Progress so far is durable.
    let checkpoint = rig.checkpoints.load(rig.plan.plan_id).await.unwrap();
    assert!(checkpoint.is_some());
}

// Forced swap pushes verification mismatches through instead of failing
// them; without the override the same keys fail.
#[tokio::test]
async fn force_swap_overrides_verification_mismatch() {
    struct AlwaysMismatch;
    #[async_trait]
    impl VerificationStrategy<String> for AlwaysMismatch {
        async fn verify(&self, _: &KeyMove<String>) -> Result<VerifyOutcome, MoveFault> {
            Ok(VerifyOutcome::Mismatch)
        }
    }

    for (force, expect_done, expect_failed) in [(true, 3, 0), (false, 0, 3)] {
        let rig = rig(3);
        let exec = MigrationExecutor::new(
            rig.mover.clone(),
            Arc::new(AlwaysMismatch),
            rig.swapper.clone(),
            rig.checkpoints.clone(),
        )
        .with_options(MigrationOptions {
            force_swap_on_verification_failure: force,
            ..fast_options()
        });

        let summary = exec
            .execute(&rig.plan, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.done, expect_done, "force={force}");
        assert_eq!(summary.failed, expect_failed, "force={force}");
    }
}

// Progress events are throttled but a final event always arrives with
// terminal counters.
#[tokio::test]
async fn progress_always_ends_with_a_final_event() {
    let rig = rig(25);
    let exec = executor(&rig, fast_options());
    let (tx, mut rx) = mpsc::channel(64);

    exec.execute(&rig.plan, Some(tx), CancellationToken::new())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let last = events.last().expect("at least the final event");
    assert!(last.finished);
    assert_eq!(last.done, 25);
    assert_eq!(last.failed, 0);
    assert_eq!(last.total, 25);
    // Only the last event is final.
    assert_eq!(events.iter().filter(|e| e.finished).count(), 1);
}
