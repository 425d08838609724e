//! Database shards as consumed by the worker node.
//!
//! A cluster divides every database into `num_shards` partitions; a worker
//! node loads exactly one partition of each database. Object ids are global:
//! the ids belonging to shard `s` are those with `id % num_shards == s`.
//! Shard loading and on-disk layout are outside this crate; the engine only
//! needs indexed access, and that access must be cheap and re-entrant
//! because back-end threads may re-fetch objects concurrently.

use std::fmt;
use std::sync::Arc;

/// One database object: a residue sequence or a serialized profile,
/// depending on the database the shard came from.
///
/// The payload is shared, not copied. Cloning a `SeqObject` bumps a
/// refcount, which is what makes `object_at` cheap enough to call from the
/// comparison hot path.
#[derive(Clone, Debug, PartialEq)]
pub struct SeqObject {
    /// Global object id.
    pub id: u64,
    /// Object payload. Interpretation depends on the search kind.
    pub data: Arc<[u8]>,
}

impl SeqObject {
    /// Payload length in bytes (residue count for sequence databases).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Which shard a global object id belongs to.
#[inline]
pub fn shard_of(id: u64, num_shards: u32) -> u32 {
    debug_assert!(num_shards > 0);
    (id % u64::from(num_shards)) as u32
}

/// Errors surfaced by shard access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardError {
    /// The id is outside the database's object space.
    OutOfRange { id: u64, count: u64 },
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardError::OutOfRange { id, count } => {
                write!(f, "object id {id} out of range (database holds {count})")
            }
        }
    }
}

impl std::error::Error for ShardError {}

/// Indexed access to one shard of a database.
///
/// # Contract
///
/// - `count()` is the size of the database's *global* object space, not the
///   number of objects physically present in this shard.
/// - `object_at(id)` must succeed for every in-range id that satisfies the
///   shard predicate. Implementations may also serve foreign ids; the
///   engine never asks for them.
/// - Both calls must be cheap and safe to issue from many threads at once.
pub trait DbShard: Send + Sync + 'static {
    /// Size of the database's global object-id space.
    fn count(&self) -> u64;

    /// Fetch the object with the given global id.
    fn object_at(&self, id: u64) -> Result<SeqObject, ShardError>;
}

/// In-memory shard backed by a vector, indexed directly by global id.
///
/// Used by tests and by single-node deployments where the whole database
/// fits in memory. Holds every object of the database, so it can serve any
/// shard predicate.
pub struct VecShard {
    objects: Vec<Arc<[u8]>>,
}

impl VecShard {
    pub fn new(objects: Vec<Vec<u8>>) -> Self {
        Self {
            objects: objects.into_iter().map(Arc::from).collect(),
        }
    }

    /// A shard of `count` synthetic objects, each `object_len` bytes of a
    /// repeating residue pattern. Handy for scheduler tests that never look
    /// at object contents.
    pub fn synthetic(count: u64, object_len: usize) -> Self {
        let objects = (0..count)
            .map(|id| {
                (0..object_len)
                    .map(|i| ((id as usize + i) % 20) as u8)
                    .collect()
            })
            .collect();
        Self::new(objects)
    }
}

impl DbShard for VecShard {
    fn count(&self) -> u64 {
        self.objects.len() as u64
    }

    fn object_at(&self, id: u64) -> Result<SeqObject, ShardError> {
        match self.objects.get(id as usize) {
            Some(data) => Ok(SeqObject {
                id,
                data: Arc::clone(data),
            }),
            None => Err(ShardError::OutOfRange {
                id,
                count: self.count(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_of_partitions_ids() {
        assert_eq!(shard_of(0, 4), 0);
        assert_eq!(shard_of(6, 4), 2);
        assert_eq!(shard_of(7, 1), 0);
    }

    #[test]
    fn vec_shard_serves_in_range_ids() {
        let shard = VecShard::synthetic(10, 8);
        assert_eq!(shard.count(), 10);
        let obj = shard.object_at(3).unwrap();
        assert_eq!(obj.id, 3);
        assert_eq!(obj.len(), 8);
    }

    #[test]
    fn vec_shard_rejects_out_of_range() {
        let shard = VecShard::synthetic(10, 8);
        assert_eq!(
            shard.object_at(10),
            Err(ShardError::OutOfRange { id: 10, count: 10 })
        );
    }
}
