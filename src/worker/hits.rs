//! Shared hit collection, kept in upload order.
//!
//! Threads add hits in whatever order the back end produces them; the
//! collector's ordering is what the master observes. The multiset is keyed
//! by `(primary_key desc, secondary_key desc)` using the IEEE total order,
//! so NaN scores cannot poison the sort.
//!
//! `drain` is destructive and runs only on the main thread at search end,
//! when every worker is quiescent.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::pipeline::Hit;

/// Sort key: descending primary, then descending secondary.
#[derive(Clone, Copy, Debug)]
struct HitKey {
    primary: f64,
    secondary: f64,
}

impl PartialEq for HitKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HitKey {}

impl PartialOrd for HitKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HitKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed operand order makes the map iterate largest-first.
        other
            .primary
            .total_cmp(&self.primary)
            .then_with(|| other.secondary.total_cmp(&self.secondary))
    }
}

/// Ordered multiset of hits shared by all worker threads.
pub struct HitCollector {
    list: Mutex<BTreeMap<HitKey, Vec<Hit>>>,
    count: AtomicU64,
}

impl Default for HitCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl HitCollector {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(BTreeMap::new()),
            count: AtomicU64::new(0),
        }
    }

    /// Insert one hit. Equal-keyed hits are all kept (multiset semantics).
    pub fn add(&self, hit: Hit) {
        let key = HitKey {
            primary: hit.primary_key,
            secondary: hit.secondary_key,
        };
        let mut list = self.list.lock().expect("hit list lock poisoned");
        list.entry(key).or_default().push(hit);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Hits collected so far.
    #[inline]
    pub fn len(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every hit, best first.
    pub fn drain(&self) -> Vec<Hit> {
        let mut list = self.list.lock().expect("hit list lock poisoned");
        let map = std::mem::take(&mut *list);
        self.count.store(0, Ordering::Relaxed);
        let mut out = Vec::new();
        for (_, bucket) in map {
            out.extend(bucket);
        }
        out
    }
}
