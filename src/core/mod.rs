// Core identity and topology types shared by routing, query and migration.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque shard identifier. Non-empty string; equality by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ShardId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Canonical byte form of an application key.
///
/// Hashing and plan ordering operate on these bytes, so they must be
/// independent of process, locale and machine word size. Integers encode
/// big-endian for that reason.
pub trait KeyBytes {
    fn key_bytes(&self) -> Cow<'_, [u8]>;
}

impl KeyBytes for String {
    fn key_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

impl KeyBytes for &str {
    fn key_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

impl KeyBytes for u32 {
    fn key_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Owned(self.to_be_bytes().to_vec())
    }
}

impl KeyBytes for u64 {
    fn key_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Owned(self.to_be_bytes().to_vec())
    }
}

impl KeyBytes for i64 {
    fn key_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Owned(self.to_be_bytes().to_vec())
    }
}

impl KeyBytes for u128 {
    fn key_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Owned(self.to_be_bytes().to_vec())
    }
}

impl KeyBytes for uuid::Uuid {
    fn key_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

/// Wrapper around an application key. Equality and hash delegate to the
/// inner key type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardKey<K>(K);

impl<K> ShardKey<K> {
    pub fn new(key: K) -> Self {
        Self(key)
    }

    pub fn get(&self) -> &K {
        &self.0
    }

    pub fn into_inner(self) -> K {
        self.0
    }
}

impl<K: KeyBytes> ShardKey<K> {
    pub fn key_bytes(&self) -> Cow<'_, [u8]> {
        self.0.key_bytes()
    }
}

impl<K> From<K> for ShardKey<K> {
    fn from(key: K) -> Self {
        Self(key)
    }
}

/// A shard handle: an id plus a session factory.
///
/// The session type `S` is opaque to the library; caller-supplied query
/// functions use it as a capability to reach the actual backend.
pub struct Shard<S> {
    id: ShardId,
    session_factory: Arc<dyn Fn() -> S + Send + Sync>,
}

impl<S> Shard<S> {
    pub fn new(id: impl Into<ShardId>, session_factory: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            session_factory: Arc::new(session_factory),
        }
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    /// Open a session against this shard's backend.
    pub fn session(&self) -> S {
        (self.session_factory)()
    }
}

impl<S> Clone for Shard<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            session_factory: Arc::clone(&self.session_factory),
        }
    }
}

impl<S> fmt::Debug for Shard<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard").field("id", &self.id).finish()
    }
}

/// A single unit of migration: move `key` from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMove<K> {
    pub key: ShardKey<K>,
    pub source: ShardId,
    pub target: ShardId,
}

impl<K> KeyMove<K> {
    /// Source and target must differ; a same-shard move is meaningless
    /// and would corrupt swap accounting.
    pub fn new(
        key: ShardKey<K>,
        source: ShardId,
        target: ShardId,
    ) -> crate::error::ShardResult<Self> {
        if source == target {
            return Err(crate::error::ShardError::new(
                crate::error::ShardErrorKind::Migration,
                "key move source and target are the same shard",
            )
            .with_diagnostic(crate::error::diag::SOURCE_SHARD_ID, &source)
            .with_diagnostic(crate::error::diag::TARGET_SHARD_ID, &target));
        }
        Ok(Self { key, source, target })
    }
}

/// Immutable point-in-time view of key assignments plus the live shard
/// set. Produced by stores/routers, consumed by the migration planner.
#[derive(Debug, Clone)]
pub struct TopologySnapshot<K> {
    version: u64,
    assignments: HashMap<ShardKey<K>, ShardId>,
    shard_ids: BTreeSet<ShardId>,
}

impl<K: Eq + Hash> TopologySnapshot<K> {
    pub fn new(
        version: u64,
        assignments: impl IntoIterator<Item = (ShardKey<K>, ShardId)>,
        shard_ids: impl IntoIterator<Item = ShardId>,
    ) -> Self {
        Self {
            version,
            assignments: assignments.into_iter().collect(),
            shard_ids: shard_ids.into_iter().collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn assignment(&self, key: &ShardKey<K>) -> Option<&ShardId> {
        self.assignments.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShardKey<K>, &ShardId)> {
        self.assignments.iter()
    }

    pub fn key_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = &ShardId> {
        self.shard_ids.iter()
    }

    pub fn contains_shard(&self, shard_id: &ShardId) -> bool {
        self.shard_ids.contains(shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_key_equality_delegates_to_inner() {
        assert_eq!(ShardKey::new("k1".to_string()), ShardKey::new("k1".to_string()));
        assert_ne!(ShardKey::new(1_u64), ShardKey::new(2_u64));
    }

    #[test]
    fn integer_key_bytes_are_big_endian() {
        let key = 0x0102_0304_u32;
        assert_eq!(key.key_bytes().as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn shard_sessions_come_from_the_factory() {
        let shard = Shard::new("s1", || 42_u8);
        assert_eq!(shard.id().as_str(), "s1");
        assert_eq!(shard.session(), 42);
        assert_eq!(shard.clone().session(), 42);
    }
}
