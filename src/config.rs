use std::time::Duration;

use crate::health::HealthPolicyConfig;
use crate::migration::MigrationOptions;
use crate::query::{FanOutOptions, OrderedMergeOptions};
use crate::routing::DEFAULT_REPLICATION_FACTOR;

/// Top-level runtime configuration assembled from the environment, with
/// library defaults for anything unset.
#[derive(Debug, Clone)]
pub struct Config {
    pub replication_factor: u32,
    pub health: HealthPolicyConfig,
    pub fan_out: FanOutOptions,
    pub ordered_merge: OrderedMergeOptions,
    pub migration: MigrationOptions,
}

impl Config {
    pub fn from_env() -> Self {
        let mut health = HealthPolicyConfig::default();
        health.unhealthy_threshold = env_u32("SHARDMUX_UNHEALTHY_THRESHOLD", health.unhealthy_threshold);
        health.healthy_threshold = env_u32("SHARDMUX_HEALTHY_THRESHOLD", health.healthy_threshold);
        health.probe_interval = env_millis("SHARDMUX_PROBE_INTERVAL_MS", health.probe_interval);
        health.probe_timeout = env_millis("SHARDMUX_PROBE_TIMEOUT_MS", health.probe_timeout);
        health.cooldown = env_millis("SHARDMUX_COOLDOWN_MS", health.cooldown);

        let mut fan_out = FanOutOptions::default();
        fan_out.backpressure_capacity =
            env_usize("SHARDMUX_BACKPRESSURE_CAPACITY", fan_out.backpressure_capacity);

        let mut ordered_merge = OrderedMergeOptions::default();
        ordered_merge.prefetch_per_shard =
            env_usize("SHARDMUX_PREFETCH_PER_SHARD", ordered_merge.prefetch_per_shard);

        let mut migration = MigrationOptions::default();
        migration.copy_concurrency =
            env_usize("SHARDMUX_COPY_CONCURRENCY", migration.copy_concurrency);
        migration.verify_concurrency =
            env_usize("SHARDMUX_VERIFY_CONCURRENCY", migration.verify_concurrency);
        migration.swap_batch_size = env_usize("SHARDMUX_SWAP_BATCH_SIZE", migration.swap_batch_size);
        migration.max_retries = env_u32("SHARDMUX_MAX_RETRIES", migration.max_retries);
        migration.retry_base_delay =
            env_millis("SHARDMUX_RETRY_BASE_DELAY_MS", migration.retry_base_delay);

        Self {
            replication_factor: env_u32("SHARDMUX_REPLICATION_FACTOR", DEFAULT_REPLICATION_FACTOR),
            health,
            fan_out,
            ordered_merge,
            migration,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            health: HealthPolicyConfig::default(),
            fan_out: FanOutOptions::default(),
            ordered_merge: OrderedMergeOptions::default(),
            migration: MigrationOptions::default(),
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
