// Routing core: assignment store, consistent-hash ring, routers.
pub mod map_store;
pub(crate) mod ring;
pub mod router;

pub use map_store::{AssignOutcome, InMemoryShardMapStore, MapEnumeration, ShardMapStore};
pub use router::{
    ConsistentHashRouter, ModuloRouter, RouterStats, ShardRouter, DEFAULT_REPLICATION_FACTOR,
    MAX_REPLICATION_FACTOR,
};
