// Metrics surface. Sinks are host-provided, invoked concurrently, and
// must never affect data-plane correctness: every call goes through a
// panic-isolating dispatcher.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Counter {
    RouteHit,
    RouteMiss,
    Planned,
    Copied,
    Verified,
    Swapped,
    Failed,
    Retries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Gauge {
    ActiveCopy,
    ActiveVerify,
    UnhealthyShardCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Histogram {
    RouteLatency,
    CopyDuration,
    VerifyDuration,
    SwapBatchDuration,
    HealthProbeLatency,
    TotalElapsed,
}

/// Non-blocking metrics sink. Implementations must be thread-safe; the
/// library treats callbacks as potentially blocking but never as
/// contributing to correctness.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, counter: Counter, delta: u64);
    fn gauge(&self, gauge: Gauge, value: i64);
    fn observe(&self, histogram: Histogram, value: Duration);
}

/// Default sink: drops everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _counter: Counter, _delta: u64) {}
    fn gauge(&self, _gauge: Gauge, _value: i64) {}
    fn observe(&self, _histogram: Histogram, _value: Duration) {}
}

static NOOP_METRICS: Lazy<Arc<NoopMetrics>> = Lazy::new(|| Arc::new(NoopMetrics));

pub fn noop_metrics() -> Arc<dyn MetricsSink> {
    NOOP_METRICS.clone()
}

/// Recording sink for tests and diagnostics.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<Counter, u64>>,
    gauges: Mutex<HashMap<Gauge, i64>>,
    histograms: Mutex<HashMap<Histogram, Vec<Duration>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters.lock().get(&counter).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, gauge: Gauge) -> i64 {
        self.gauges.lock().get(&gauge).copied().unwrap_or(0)
    }

    pub fn histogram_count(&self, histogram: Histogram) -> usize {
        self.histograms
            .lock()
            .get(&histogram)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn histogram_total(&self, histogram: Histogram) -> Duration {
        self.histograms
            .lock()
            .get(&histogram)
            .map(|samples| samples.iter().sum())
            .unwrap_or(Duration::ZERO)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr(&self, counter: Counter, delta: u64) {
        *self.counters.lock().entry(counter).or_insert(0) += delta;
    }

    fn gauge(&self, gauge: Gauge, value: i64) {
        self.gauges.lock().insert(gauge, value);
    }

    fn observe(&self, histogram: Histogram, value: Duration) {
        self.histograms.lock().entry(histogram).or_default().push(value);
    }
}

/// Panic-isolated handle the library uses internally for every sink call.
#[derive(Clone)]
pub(crate) struct MetricsHandle {
    sink: Arc<dyn MetricsSink>,
}

impl MetricsHandle {
    pub(crate) fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn incr(&self, counter: Counter, delta: u64) {
        let sink = &self.sink;
        let _ = catch_unwind(AssertUnwindSafe(|| sink.incr(counter, delta)));
    }

    pub(crate) fn gauge(&self, gauge: Gauge, value: i64) {
        let sink = &self.sink;
        let _ = catch_unwind(AssertUnwindSafe(|| sink.gauge(gauge, value)));
    }

    pub(crate) fn observe(&self, histogram: Histogram, value: Duration) {
        let sink = &self.sink;
        let _ = catch_unwind(AssertUnwindSafe(|| sink.observe(histogram, value)));
    }
}

impl std::fmt::Debug for MetricsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsHandle").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_records() {
        let sink = InMemoryMetrics::new();
        sink.incr(Counter::RouteHit, 1);
        sink.incr(Counter::RouteHit, 2);
        sink.gauge(Gauge::ActiveCopy, 5);
        sink.observe(Histogram::RouteLatency, Duration::from_millis(3));

        assert_eq!(sink.counter(Counter::RouteHit), 3);
        assert_eq!(sink.counter(Counter::RouteMiss), 0);
        assert_eq!(sink.gauge_value(Gauge::ActiveCopy), 5);
        assert_eq!(sink.histogram_count(Histogram::RouteLatency), 1);
    }

    #[test]
    fn panicking_sink_is_isolated() {
        struct Exploding;
        impl MetricsSink for Exploding {
            fn incr(&self, _: Counter, _: u64) {
                panic!("sink bug");
            }
            fn gauge(&self, _: Gauge, _: i64) {}
            fn observe(&self, _: Histogram, _: Duration) {}
        }

        let handle = MetricsHandle::new(Arc::new(Exploding));
        handle.incr(Counter::RouteMiss, 1);
    }
}
