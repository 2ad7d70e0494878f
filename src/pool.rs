//! Pool of idle server side storage slots, bucketed by element type and
//! element count. A freed array's storage lands here and the next
//! allocation of a matching shape stores into it instead of allocating.

use crate::dtype::DType;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct SlotPool {
    buckets: BTreeMap<(DType, u64), BTreeSet<Box<str>>>,
}

impl SlotPool {
    pub(crate) const fn new() -> Self {
        SlotPool { buckets: BTreeMap::new() }
    }

    /// Take one idle physical name matching `(dtype, size)` out of the pool.
    pub(crate) fn claim(&mut self, dtype: DType, size: u64) -> Option<Box<str>> {
        let bucket = self.buckets.get_mut(&(dtype, size))?;
        let name = bucket.iter().next().cloned()?;
        bucket.remove(&name);
        debug!("claimed recycled slot {name} for {dtype} x {size}");
        Some(name)
    }

    /// Return an idle physical name to the pool.
    pub(crate) fn release(&mut self, dtype: DType, size: u64, name: Box<str>) {
        debug!("recycling slot {name} for {dtype} x {size}");
        let _inserted = self.buckets.entry((dtype, size)).or_default().insert(name);
        // Double release would alias live storage on the next two claims.
        debug_assert!(_inserted);
    }

    /// Is there an idle slot matching `(dtype, size)`?
    #[cfg(test)]
    pub(crate) fn contains(&self, dtype: DType, size: u64) -> bool {
        self.buckets.get(&(dtype, size)).is_some_and(|b| !b.is_empty())
    }
}

#[test]
fn claim_is_at_most_once() {
    let mut pool = SlotPool::new();
    pool.release(DType::Int64, 100, "sv_7".into());
    assert!(pool.contains(DType::Int64, 100));
    assert!(!pool.contains(DType::Float64, 100));
    assert_eq!(pool.claim(DType::Int64, 100).as_deref(), Some("sv_7"));
    assert_eq!(pool.claim(DType::Int64, 100), None);
}

#[test]
fn buckets_do_not_mix_sizes() {
    let mut pool = SlotPool::new();
    pool.release(DType::Int64, 100, "sv_1".into());
    pool.release(DType::Int64, 200, "sv_2".into());
    assert_eq!(pool.claim(DType::Int64, 200).as_deref(), Some("sv_2"));
    assert_eq!(pool.claim(DType::Int64, 200), None);
    assert_eq!(pool.claim(DType::Int64, 100).as_deref(), Some("sv_1"));
}
