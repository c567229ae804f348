// Determinism utilities for tests and benchmarks: seeded delays, skew
// profiles and stable shuffles. Shipped with the library so hosts can
// reproduce merge and migration schedules exactly.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ShardResult;

/// Per-shard delay schedules used to shape producer timing.
#[derive(Debug, Clone)]
pub enum SkewProfile {
    /// Every item on every shard waits the same amount.
    Uniform { delay: Duration },
    /// One shard is much slower than the rest.
    Harsh {
        fast: Duration,
        slow: Duration,
        slow_shard: usize,
    },
    /// The first item is expensive, the rest are cheap. Exercises
    /// slowest-among-firsts latency bounds.
    FrontLoaded { first: Duration, rest: Duration },
}

impl SkewProfile {
    pub fn delay_for(&self, shard_index: usize, item_index: usize) -> Duration {
        match self {
            SkewProfile::Uniform { delay } => *delay,
            SkewProfile::Harsh {
                fast,
                slow,
                slow_shard,
            } => {
                if shard_index == *slow_shard {
                    *slow
                } else {
                    *fast
                }
            }
            SkewProfile::FrontLoaded { first, rest } => {
                if item_index == 0 {
                    *first
                } else {
                    *rest
                }
            }
        }
    }
}

/// Seeded jitter source. Same seed, same delay sequence.
#[derive(Debug)]
pub struct SeededDelays {
    rng: StdRng,
    max: Duration,
}

impl SeededDelays {
    pub fn new(seed: u64, max: Duration) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let max_micros = self.max.as_micros().max(1) as u64;
        Duration::from_micros(self.rng.random_range(0..max_micros))
    }
}

/// Deterministic Fisher-Yates shuffle. Same seed, same permutation, on
/// any platform.
pub fn stable_shuffle<T>(items: &mut [T], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}

/// Build a producer stream that emits `items` with the profile's delay
/// schedule applied before each item.
pub fn delayed_stream<T: Send + 'static>(
    items: Vec<T>,
    profile: SkewProfile,
    shard_index: usize,
) -> BoxStream<'static, ShardResult<T>> {
    futures::stream::iter(items.into_iter().enumerate())
        .then(move |(item_index, item)| {
            let delay = profile.delay_for(shard_index, item_index);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(item)
            }
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_shuffle_is_deterministic() {
        let mut a: Vec<u32> = (0..100).collect();
        let mut b: Vec<u32> = (0..100).collect();
        stable_shuffle(&mut a, 42);
        stable_shuffle(&mut b, 42);
        assert_eq!(a, b);

        let mut c: Vec<u32> = (0..100).collect();
        stable_shuffle(&mut c, 43);
        assert_ne!(a, c);
    }

    #[test]
    fn seeded_delays_repeat() {
        let mut a = SeededDelays::new(7, Duration::from_millis(5));
        let mut b = SeededDelays::new(7, Duration::from_millis(5));
        for _ in 0..32 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn harsh_profile_slows_one_shard() {
        let profile = SkewProfile::Harsh {
            fast: Duration::from_millis(1),
            slow: Duration::from_millis(50),
            slow_shard: 2,
        };
        assert_eq!(profile.delay_for(0, 9), Duration::from_millis(1));
        assert_eq!(profile.delay_for(2, 0), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn delayed_stream_yields_everything_in_order() {
        let stream = delayed_stream(
            vec![1, 2, 3],
            SkewProfile::Uniform {
                delay: Duration::ZERO,
            },
            0,
        );
        let items: Vec<i32> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2, 3]);
    }
}
