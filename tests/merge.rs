use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use shardmux::query::RecordingObserver;
use shardmux::testing::{delayed_stream, SkewProfile};
use shardmux::{
    FanOutOptions, OrderedMergeOptions, OrderedMerger, Shard, ShardBroadcaster, ShardErrorKind,
    ShardId, StopReason,
};

fn shards(ids: &[&str]) -> Vec<Shard<()>> {
    ids.iter().map(|id| Shard::new(*id, || ())).collect()
}

fn int_stream(items: Vec<i64>) -> BoxStream<'static, shardmux::ShardResult<i64>> {
    futures::stream::iter(items.into_iter().map(Ok)).boxed()
}

// Seeded scenario: 4 shards x 800 integers under harsh skew with buffer
// capacity 128. All 3200 items arrive, and no fast shard sees a yield
// gap of 8x capacity or more.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unordered_fan_out_is_fair_under_harsh_skew() {
    let broadcaster = ShardBroadcaster::new(shards(&["s0", "s1", "s2", "s3"]));
    let profile = SkewProfile::Harsh {
        fast: Duration::ZERO,
        slow: Duration::from_micros(300),
        slow_shard: 3,
    };

    let mut stream = broadcaster
        .fan_out(
            |shard| {
                let index = shard.id().as_str()[1..].parse::<usize>().unwrap();
                let items: Vec<i64> = (0..800).map(|i| (index * 1000 + i) as i64).collect();
                delayed_stream(items, profile.clone(), index)
            },
            FanOutOptions {
                backpressure_capacity: 128,
                ..FanOutOptions::default()
            },
            CancellationToken::new(),
        )
        .unwrap();

    let mut total = 0_usize;
    let mut last_seen: HashMap<ShardId, usize> = HashMap::new();
    let mut max_gap: HashMap<ShardId, usize> = HashMap::new();
    let mut ordinal = 0_usize;
    while let Some(item) = stream.next().await {
        let (shard_id, _) = item.unwrap();
        if let Some(prev) = last_seen.get(&shard_id) {
            let gap = ordinal - prev;
            let entry = max_gap.entry(shard_id.clone()).or_insert(0);
            *entry = (*entry).max(gap);
        }
        last_seen.insert(shard_id, ordinal);
        ordinal += 1;
        total += 1;
    }

    assert_eq!(total, 3200);
    // Fast shards must not be starved: gap < 8 x capacity.
    let gap = max_gap.get(&ShardId::new("s1")).copied().unwrap_or(0);
    assert!(gap < 1024, "shard s1 max yield gap {gap}");
}

#[tokio::test]
async fn fan_out_reports_paired_backpressure_and_lifecycle_events() {
    let observer = Arc::new(RecordingObserver::new());
    let broadcaster =
        ShardBroadcaster::new(shards(&["a", "b"])).with_observer(observer.clone());

    let mut stream = broadcaster
        .fan_out(
            |_| int_stream((0..50).collect()),
            FanOutOptions {
                backpressure_capacity: 2,
                ..FanOutOptions::default()
            },
            CancellationToken::new(),
        )
        .unwrap();

    // Slow consumer so producers hit the tiny buffer.
    let mut count = 0;
    while let Some(item) = stream.next().await {
        item.unwrap();
        count += 1;
        if count % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    assert_eq!(count, 100);

    let (starts, stops) = observer.wait_pairs();
    assert_eq!(starts, stops, "backpressure events must pair");

    // Exactly one stop per shard, after a completion.
    let stopped = observer.stopped();
    assert_eq!(stopped.len(), 2);
    assert!(stopped.iter().all(|(_, r)| *r == StopReason::Completed));
    assert_eq!(observer.completed().len(), 2);
    assert_eq!(observer.yielded().len(), 100);
}

#[tokio::test]
async fn fan_out_surfaces_producer_faults_with_shard_context() {
    let observer = Arc::new(RecordingObserver::new());
    let broadcaster =
        ShardBroadcaster::new(shards(&["good", "bad"])).with_observer(observer.clone());

    let mut stream = broadcaster
        .fan_out(
            |shard| {
                if shard.id().as_str() == "bad" {
                    futures::stream::iter(vec![
                        Ok(1_i64),
                        Err(shardmux::ShardError::new(
                            ShardErrorKind::Store,
                            "backend exploded",
                        )),
                    ])
                    .boxed()
                } else {
                    // Endless producer; must be cancelled by the fault.
                    futures::stream::unfold(0_i64, |n| async move {
                        tokio::time::sleep(Duration::from_micros(100)).await;
                        Some((Ok(n), n + 1))
                    })
                    .boxed()
                }
            },
            FanOutOptions::default(),
            CancellationToken::new(),
        )
        .unwrap();

    let mut saw_error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(_) => {}
            Err(err) => {
                saw_error = Some(err);
                break;
            }
        }
    }
    let err = saw_error.expect("fault must surface");
    assert_eq!(err.kind(), ShardErrorKind::Query);
    assert_eq!(err.diagnostic("shard_id"), Some("bad"));

    stream.shutdown().await;
    let stopped = observer.stopped();
    assert!(stopped
        .iter()
        .any(|(id, r)| id.as_str() == "bad" && *r == StopReason::Faulted));
}

// Cancelling the consumer stops every producer within a short grace
// period and leaves no task behind.
#[tokio::test]
async fn cancelled_fan_out_reclaims_producers_promptly() {
    let broadcaster = ShardBroadcaster::new(shards(&["a", "b", "c"]));
    let cancel = CancellationToken::new();

    let mut stream = broadcaster
        .fan_out(
            |_| {
                futures::stream::unfold(0_i64, |n| async move {
                    tokio::time::sleep(Duration::from_micros(50)).await;
                    Some((Ok(n), n + 1))
                })
                .boxed()
            },
            FanOutOptions {
                backpressure_capacity: 4,
                ..FanOutOptions::default()
            },
            cancel.clone(),
        )
        .unwrap();

    for _ in 0..5 {
        stream.next().await.unwrap().unwrap();
    }
    cancel.cancel();

    let grace = Instant::now();
    while !stream.producers_finished() {
        assert!(grace.elapsed() < Duration::from_secs(1), "producers leaked");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// Seeded scenario: A=[1,1,2], B=[1,2,2], C=[1,3,3] with prefetch 1.
// Output is globally non-decreasing and identical across runs.
#[tokio::test]
async fn ordered_merge_is_sorted_and_deterministic() {
    let run = || async {
        let merger = OrderedMerger::new(shards(&["A", "B", "C"]));
        let mut merge = merger
            .merge(
                |shard| {
                    int_stream(match shard.id().as_str() {
                        "A" => vec![1, 1, 2],
                        "B" => vec![1, 2, 2],
                        _ => vec![1, 3, 3],
                    })
                },
                |item: &i64| *item,
                OrderedMergeOptions::default(),
                CancellationToken::new(),
            )
            .unwrap();

        let mut out = Vec::new();
        while let Some(item) = merge.next().await {
            let (shard_id, value) = item.unwrap();
            out.push((shard_id.as_str().to_string(), value));
        }
        out
    };

    let first = run().await;
    let second = run().await;

    assert_eq!(first.len(), 9);
    let values: Vec<i64> = first.iter().map(|(_, v)| *v).collect();
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "not sorted: {values:?}");
    // Ties break by shard insertion order.
    assert_eq!(
        &first[0..4],
        &[
            ("A".to_string(), 1),
            ("A".to_string(), 1),
            ("B".to_string(), 1),
            ("C".to_string(), 1)
        ]
    );
    assert_eq!(first, second);
}

#[tokio::test]
async fn ordered_merge_samples_heap_and_bounds_memory() {
    let observer = Arc::new(RecordingObserver::new());
    let merger =
        OrderedMerger::new(shards(&["x", "y", "z"])).with_observer(observer.clone());

    let mut merge = merger
        .merge(
            |shard| {
                let base = match shard.id().as_str() {
                    "x" => 0,
                    "y" => 100,
                    _ => 200,
                };
                int_stream((base..base + 20).collect())
            },
            |item: &i64| *item,
            OrderedMergeOptions {
                prefetch_per_shard: 2,
                heap_sample_every: 1,
                ..OrderedMergeOptions::default()
            },
            CancellationToken::new(),
        )
        .unwrap();

    let mut count = 0;
    while let Some(item) = merge.next().await {
        item.unwrap();
        count += 1;
    }
    assert_eq!(count, 60);

    let samples = observer.heap_samples();
    assert_eq!(samples.len(), 60);
    // The heap holds at most one head per shard.
    assert!(samples.iter().all(|&s| s <= 3));
}

#[tokio::test]
async fn ordered_merge_first_item_is_bounded_by_slowest_first() {
    let merger = OrderedMerger::new(shards(&["fast1", "fast2", "slow"]));
    let started = Instant::now();
    let mut merge = merger
        .merge(
            |shard| {
                let profile = if shard.id().as_str() == "slow" {
                    SkewProfile::FrontLoaded {
                        first: Duration::from_millis(100),
                        rest: Duration::ZERO,
                    }
                } else {
                    SkewProfile::Uniform {
                        delay: Duration::ZERO,
                    }
                };
                delayed_stream((0..500).collect::<Vec<i64>>(), profile, 0)
            },
            |item: &i64| *item,
            OrderedMergeOptions::default(),
            CancellationToken::new(),
        )
        .unwrap();

    let first = merge.next().await.unwrap().unwrap();
    let elapsed = started.elapsed();
    assert_eq!(first.1, 0);
    // Bounded by the slow shard's first item, far below total
    // materialization of 1500 delayed items.
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2), "first item took {elapsed:?}");
    merge.shutdown().await;
}

#[tokio::test]
async fn ordered_merge_surfaces_faults_immediately() {
    let merger = OrderedMerger::new(shards(&["ok", "broken"]));
    let mut merge = merger
        .merge(
            |shard| {
                if shard.id().as_str() == "broken" {
                    futures::stream::iter(vec![Err(shardmux::ShardError::new(
                        ShardErrorKind::Store,
                        "read failed",
                    ))])
                    .boxed()
                } else {
                    int_stream((0..100).collect())
                }
            },
            |item: &i64| *item,
            OrderedMergeOptions::default(),
            CancellationToken::new(),
        )
        .unwrap();

    let mut fault = None;
    for _ in 0..101 {
        match merge.next().await {
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                fault = Some(err);
                break;
            }
            None => break,
        }
    }
    let err = fault.expect("fault must surface through the merge");
    assert_eq!(err.kind(), ShardErrorKind::Query);
    assert_eq!(err.diagnostic("shard_id"), Some("broken"));
    assert!(merge.next().await.is_none());
}

#[tokio::test]
async fn eager_merge_matches_streaming_order() {
    let merger = OrderedMerger::new(shards(&["A", "B", "C"]));
    let query = |shard: &Shard<()>| {
        int_stream(match shard.id().as_str() {
            "A" => vec![1, 1, 2],
            "B" => vec![1, 2, 2],
            _ => vec![1, 3, 3],
        })
    };

    let eager = merger
        .merge_eager(
            query,
            |item: &i64| *item,
            shardmux::HealthFilter::Include,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut streaming = Vec::new();
    let mut merge = merger
        .merge(
            query,
            |item: &i64| *item,
            OrderedMergeOptions::default(),
            CancellationToken::new(),
        )
        .unwrap();
    while let Some(item) = merge.next().await {
        streaming.push(item.unwrap());
    }

    assert_eq!(eager, streaming);
}
