// Streaming merge core: unordered fan-out and ordered k-way merge.
pub mod broadcast;
pub mod observer;
pub mod ordered;

pub use broadcast::{
    FanOutOptions, FanOutStream, ShardBroadcaster, DEFAULT_BACKPRESSURE_CAPACITY,
};
pub use observer::{MergeObserver, NoopObserver, RecordingObserver, StopReason};
pub use ordered::{
    OrderedMergeOptions, OrderedMergeStream, OrderedMerger, MAX_PREFETCH_PER_SHARD,
};
