// Shard health tracking: a per-shard state machine fed by probes and by
// reactive success/failure reports from real query paths, plus the
// filtering modes the merge enumerators consult before fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{Shard, ShardId};
use crate::error::{diag, ShardError, ShardErrorKind, ShardResult};
use crate::metrics::{noop_metrics, Gauge, Histogram, MetricsHandle, MetricsSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Unknown is optimistic: a shard is routable until proven otherwise.
    pub fn is_routable(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

/// Per-shard health record.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_probe_at: None,
            last_failure_at: None,
            last_error: None,
            last_duration_ms: None,
        }
    }
}

/// Serializable view of a shard's health for reporting surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ShardHealthReport {
    pub shard_id: ShardId,
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HealthPolicyConfig {
    /// Consecutive failures before a shard is marked Unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an Unhealthy shard recovers.
    pub healthy_threshold: u32,
    /// How long an Unhealthy shard is left alone after its last failure.
    pub cooldown: Duration,
    /// Background probe cadence.
    pub probe_interval: Duration,
    /// Per-probe timeout.
    pub probe_timeout: Duration,
}

impl Default for HealthPolicyConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            cooldown: Duration::from_secs(5),
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Health probe provided by the host; one call per shard per cycle.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn execute(&self, shard_id: &ShardId) -> ShardResult<()>;
}

/// Scriptable reference probe: every shard reports healthy until marked
/// down. Useful for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryHealthProbe {
    down: RwLock<HashSet<ShardId>>,
}

impl InMemoryHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_down(&self, shard_id: &ShardId) {
        self.down.write().insert(shard_id.clone());
    }

    pub fn mark_up(&self, shard_id: &ShardId) {
        self.down.write().remove(shard_id);
    }
}

#[async_trait]
impl HealthProbe for InMemoryHealthProbe {
    async fn execute(&self, shard_id: &ShardId) -> ShardResult<()> {
        if self.down.read().contains(shard_id) {
            return Err(ShardError::new(ShardErrorKind::Store, "probe target down")
                .with_diagnostic(diag::SHARD_ID, shard_id)
                .with_diagnostic(diag::OPERATION, "probe"));
        }
        Ok(())
    }
}

/// Tracks health state for a set of shards. Shared between the prober,
/// reactive query paths and the filtering modes.
pub struct HealthTracker {
    states: RwLock<HashMap<ShardId, HealthState>>,
    config: HealthPolicyConfig,
    metrics: MetricsHandle,
    recovered_tx: broadcast::Sender<ShardId>,
}

impl HealthTracker {
    pub fn new(config: HealthPolicyConfig) -> Self {
        let (recovered_tx, _) = broadcast::channel(64);
        Self {
            states: RwLock::new(HashMap::new()),
            config,
            metrics: MetricsHandle::new(noop_metrics()),
            recovered_tx,
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = MetricsHandle::new(sink);
        self
    }

    pub fn config(&self) -> &HealthPolicyConfig {
        &self.config
    }

    /// Fires once per Unhealthy→Healthy edge.
    pub fn subscribe_recovered(&self) -> broadcast::Receiver<ShardId> {
        self.recovered_tx.subscribe()
    }

    pub fn status(&self, shard_id: &ShardId) -> HealthStatus {
        self.states
            .read()
            .get(shard_id)
            .map(|s| s.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn unhealthy_ids(&self) -> Vec<ShardId> {
        self.states
            .read()
            .iter()
            .filter(|(_, s)| s.status == HealthStatus::Unhealthy)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn report(&self) -> Vec<ShardHealthReport> {
        self.states
            .read()
            .iter()
            .map(|(id, s)| ShardHealthReport {
                shard_id: id.clone(),
                status: s.status,
                consecutive_successes: s.consecutive_successes,
                consecutive_failures: s.consecutive_failures,
                last_error: s.last_error.clone(),
                last_duration_ms: s.last_duration_ms,
            })
            .collect()
    }

    /// Record a successful probe or query against a shard.
    pub fn record_success(&self, shard_id: &ShardId, duration: Duration) {
        let mut recovered = false;
        {
            let mut states = self.states.write();
            let state = states.entry(shard_id.clone()).or_default();
            state.consecutive_failures = 0;
            state.consecutive_successes += 1;
            state.last_probe_at = Some(Instant::now());
            state.last_duration_ms = Some(duration.as_millis() as u64);

            match state.status {
                HealthStatus::Unknown | HealthStatus::Degraded => {
                    state.status = HealthStatus::Healthy;
                }
                HealthStatus::Unhealthy => {
                    if state.consecutive_successes >= self.config.healthy_threshold {
                        state.status = HealthStatus::Healthy;
                        state.last_error = None;
                        recovered = true;
                    }
                }
                HealthStatus::Healthy => {}
            }
        }
        if recovered {
            info!(shard_id = %shard_id, "shard recovered");
            self.publish_unhealthy_gauge();
            let _ = self.recovered_tx.send(shard_id.clone());
        }
    }

    /// Record a failed probe or query against a shard.
    pub fn record_failure(&self, shard_id: &ShardId, error: &str) {
        let mut went_unhealthy = false;
        {
            let mut states = self.states.write();
            let state = states.entry(shard_id.clone()).or_default();
            state.consecutive_successes = 0;
            state.consecutive_failures += 1;
            state.last_probe_at = Some(Instant::now());
            state.last_failure_at = Some(Instant::now());
            state.last_error = Some(error.to_string());

            if state.consecutive_failures >= self.config.unhealthy_threshold {
                if state.status != HealthStatus::Unhealthy {
                    state.status = HealthStatus::Unhealthy;
                    went_unhealthy = true;
                }
            } else if matches!(state.status, HealthStatus::Unknown | HealthStatus::Healthy) {
                state.status = HealthStatus::Degraded;
            }
        }
        if went_unhealthy {
            warn!(shard_id = %shard_id, error, "shard marked unhealthy");
            self.publish_unhealthy_gauge();
        }
    }

    /// Whether the prober should touch this shard now. Unhealthy shards
    /// are left alone until the cooldown since their last failure runs
    /// out.
    pub fn needs_probe(&self, shard_id: &ShardId) -> bool {
        let states = self.states.read();
        match states.get(shard_id) {
            Some(state) if state.status == HealthStatus::Unhealthy => state
                .last_failure_at
                .map(|at| at.elapsed() >= self.config.cooldown)
                .unwrap_or(true),
            _ => true,
        }
    }

    fn publish_unhealthy_gauge(&self) {
        let count = self
            .states
            .read()
            .values()
            .filter(|s| s.status == HealthStatus::Unhealthy)
            .count();
        self.metrics.gauge(Gauge::UnhealthyShardCount, count as i64);
    }
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("config", &self.config)
            .finish()
    }
}

/// Background prober: runs `HealthProbe::execute` against every tracked
/// shard at `probe_interval`, honoring the per-probe timeout and the
/// Unhealthy cooldown.
pub struct HealthProber {
    tracker: Arc<HealthTracker>,
    probe: Arc<dyn HealthProbe>,
    shard_ids: Vec<ShardId>,
    metrics: MetricsHandle,
}

impl HealthProber {
    pub fn new(
        tracker: Arc<HealthTracker>,
        probe: Arc<dyn HealthProbe>,
        shard_ids: Vec<ShardId>,
    ) -> Self {
        Self {
            tracker,
            probe,
            shard_ids,
            metrics: MetricsHandle::new(noop_metrics()),
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = MetricsHandle::new(sink);
        self
    }

    /// Spawn the probe loop. Stops promptly when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.tracker.config().probe_interval;
            let timeout = self.tracker.config().probe_timeout;
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("health prober stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                for shard_id in &self.shard_ids {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if !self.tracker.needs_probe(shard_id) {
                        continue;
                    }
                    let started = Instant::now();
                    let outcome =
                        tokio::time::timeout(timeout, self.probe.execute(shard_id)).await;
                    let elapsed = started.elapsed();
                    self.metrics.observe(Histogram::HealthProbeLatency, elapsed);
                    match outcome {
                        Ok(Ok(())) => self.tracker.record_success(shard_id, elapsed),
                        Ok(Err(err)) => {
                            self.tracker.record_failure(shard_id, &err.to_string())
                        }
                        Err(_) => self.tracker.record_failure(shard_id, "probe timed out"),
                    }
                }
            }
        })
    }
}

/// How fan-out treats unhealthy shards.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthFilter {
    /// Ignore health; query every shard.
    Include,
    /// Drop Unhealthy shards and continue with the remainder.
    Skip,
    /// Fail if any shard is Unhealthy.
    Quarantine,
    /// Fail unless the healthy set satisfies the requirement.
    Require(HealthRequirement),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthRequirement {
    MinCount(usize),
    MinFraction(f64),
    All,
}

impl Default for HealthFilter {
    fn default() -> Self {
        HealthFilter::Include
    }
}

impl HealthFilter {
    /// Resolve the participating shard set, failing before any shard is
    /// touched when the policy is not met.
    pub fn apply<S>(
        &self,
        shards: &[Shard<S>],
        tracker: &HealthTracker,
    ) -> ShardResult<Vec<Shard<S>>> {
        if matches!(self, HealthFilter::Include) {
            return Ok(shards.to_vec());
        }

        let unhealthy: Vec<ShardId> = shards
            .iter()
            .filter(|s| tracker.status(s.id()) == HealthStatus::Unhealthy)
            .map(|s| s.id().clone())
            .collect();
        let total = shards.len();
        let healthy = total - unhealthy.len();

        let insufficient = |message: &str| {
            let ids = unhealthy
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(",");
            ShardError::new(ShardErrorKind::InsufficientHealthyShards, message)
                .with_diagnostic(diag::TOTAL_SHARDS, total)
                .with_diagnostic(diag::HEALTHY_SHARDS, healthy)
                .with_diagnostic(diag::UNHEALTHY_SHARD_IDS, ids)
        };

        match self {
            HealthFilter::Include => unreachable!("handled above"),
            HealthFilter::Skip => Ok(shards
                .iter()
                .filter(|s| tracker.status(s.id()).is_routable())
                .cloned()
                .collect()),
            HealthFilter::Quarantine => {
                if unhealthy.is_empty() {
                    Ok(shards.to_vec())
                } else {
                    Err(insufficient("unhealthy shard present under quarantine"))
                }
            }
            HealthFilter::Require(requirement) => {
                let met = match requirement {
                    HealthRequirement::MinCount(min) => healthy >= *min,
                    HealthRequirement::MinFraction(fraction) => {
                        total > 0 && healthy as f64 / total as f64 >= *fraction
                    }
                    HealthRequirement::All => unhealthy.is_empty(),
                };
                if met {
                    Ok(shards.to_vec())
                } else {
                    Err(insufficient("healthy shard set below requirement"))
                }
            }
        }
    }
}
