use std::collections::BTreeMap;
use std::fmt;

/// Failure kinds surfaced by the library.
///
/// Configuration kinds are raised from constructors and are not
/// recoverable; everything else is surfaced to the caller with the
/// diagnostic context attached to the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardErrorKind {
    /// Invalid router construction parameter (e.g. replication factor).
    RoutingConfig,
    /// Two shards were registered under the same id.
    DuplicateShardId,
    /// A router was built over an empty shard set.
    EmptyTopology,
    /// Routing could not produce a live shard for a key.
    NoAvailableShard,
    /// A map-store assignment factory failed.
    AssignmentFailed,
    /// Shard map store operation failure.
    Store,
    /// Fan-out / merge query failure.
    Query,
    /// Topology enumeration or snapshot failure.
    Topology,
    /// Enumeration exceeded the caller's key budget.
    TopologyOverflow,
    /// Migration copy/verify/swap failure.
    Migration,
    /// A health filter rejected the query before any shard was touched.
    InsufficientHealthyShards,
    /// Cooperative cancellation; never counted as a failure.
    Cancelled,
}

impl ShardErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ShardErrorKind::RoutingConfig => "routing configuration error",
            ShardErrorKind::DuplicateShardId => "duplicate shard id",
            ShardErrorKind::EmptyTopology => "empty topology",
            ShardErrorKind::NoAvailableShard => "no available shard",
            ShardErrorKind::AssignmentFailed => "assignment failed",
            ShardErrorKind::Store => "shard store error",
            ShardErrorKind::Query => "shard query error",
            ShardErrorKind::Topology => "shard topology error",
            ShardErrorKind::TopologyOverflow => "topology overflow",
            ShardErrorKind::Migration => "shard migration error",
            ShardErrorKind::InsufficientHealthyShards => "insufficient healthy shards",
            ShardErrorKind::Cancelled => "operation cancelled",
        }
    }
}

/// Library error: a kind, a human-readable message, and a structured
/// diagnostic context map that is immutable once the error is built.
///
/// Diagnostics are copied in at construction time so callers can never
/// mutate context out from under an error they have already received.
#[derive(Debug)]
pub struct ShardError {
    kind: ShardErrorKind,
    message: String,
    diagnostics: BTreeMap<String, String>,
    source: Option<anyhow::Error>,
}

impl ShardError {
    pub fn new(kind: ShardErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostics: BTreeMap::new(),
            source: None,
        }
    }

    /// Attach one diagnostic entry. Builder-style; only usable before the
    /// error is handed off.
    pub fn with_diagnostic(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.diagnostics.insert(key.into(), value.to_string());
        self
    }

    /// Copy a batch of diagnostics in. The source map stays with the
    /// caller; later mutation of it does not reach this error.
    pub fn with_diagnostics<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (k, v) in entries {
            self.diagnostics.insert(k.into(), v.to_string());
        }
        self
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn kind(&self) -> ShardErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Read-only diagnostic context.
    pub fn diagnostics(&self) -> &BTreeMap<String, String> {
        &self.diagnostics
    }

    pub fn diagnostic(&self, key: &str) -> Option<&str> {
        self.diagnostics.get(key).map(String::as_str)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ShardErrorKind::Cancelled
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ShardErrorKind::Cancelled, message)
    }
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if !self.diagnostics.is_empty() {
            write!(f, " [")?;
            for (i, (k, v)) in self.diagnostics.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source.as_deref() {
            Some(err) => {
                let err: &(dyn std::error::Error + 'static) = err;
                Some(err)
            }
            None => None,
        }
    }
}

impl From<anyhow::Error> for ShardError {
    fn from(err: anyhow::Error) -> Self {
        ShardError::new(ShardErrorKind::Store, err.to_string()).with_source(err)
    }
}

pub type ShardResult<T> = Result<T, ShardError>;

/// Well-known diagnostic keys. Kept as constants so error producers and
/// assertions agree on spelling.
pub mod diag {
    pub const SHARD_ID: &str = "shard_id";
    pub const KEY_HASH: &str = "key_hash";
    pub const SHARD_COUNT: &str = "shard_count";
    pub const OPERATION: &str = "operation";
    pub const ATTEMPT_COUNT: &str = "attempt_count";
    pub const PHASE: &str = "phase";
    pub const TARGETED_SHARD_COUNT: &str = "targeted_shard_count";
    pub const TOPOLOGY_VERSION: &str = "topology_version";
    pub const KEY_COUNT: &str = "key_count";
    pub const MAX_KEY_COUNT: &str = "max_key_count";
    pub const SOURCE_SHARD_ID: &str = "source_shard_id";
    pub const TARGET_SHARD_ID: &str = "target_shard_id";
    pub const PLAN_ID: &str = "plan_id";
    pub const TOTAL_SHARDS: &str = "total_shards";
    pub const HEALTHY_SHARDS: &str = "healthy_shards";
    pub const UNHEALTHY_SHARD_IDS: &str = "unhealthy_shard_ids";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_are_isolated_from_caller_map() {
        let mut context = std::collections::HashMap::new();
        context.insert("shard_count", 4);
        let err = ShardError::new(ShardErrorKind::NoAvailableShard, "ring exhausted")
            .with_diagnostics(context.clone());

        context.insert("shard_count", 99);
        assert_eq!(err.diagnostic("shard_count"), Some("4"));
    }

    #[test]
    fn display_includes_kind_and_context() {
        let err = ShardError::new(ShardErrorKind::TopologyOverflow, "too many keys")
            .with_diagnostic(diag::KEY_COUNT, 1001)
            .with_diagnostic(diag::MAX_KEY_COUNT, 1000);
        let rendered = err.to_string();
        assert!(rendered.contains("topology overflow"));
        assert!(rendered.contains("key_count=1001"));
        assert!(rendered.contains("max_key_count=1000"));
    }

    #[test]
    fn cancelled_is_its_own_category() {
        let err = ShardError::cancelled("consumer dropped");
        assert!(err.is_cancelled());
        assert_ne!(err.kind(), ShardErrorKind::Query);
    }
}
