//! Result cache keyed by operator and operand identity.
//!
//! Binary operations register their result here so that requesting the
//! same computation again returns the live handle instead of a remote call.
//! Values are generation checked ids, so a key whose result has since been
//! released resolves to nothing and is pruned on the next probe.

use crate::array::ArrayId;
use crate::ops::BinOp;
use std::collections::BTreeMap;

/// Cache key: operator plus the canonical operand encodings, either an
/// identity token or a literal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct OpKey {
    pub op: BinOp,
    pub lhs: Box<str>,
    pub rhs: Box<str>,
}

impl OpKey {
    pub(crate) fn new(op: BinOp, lhs: &str, rhs: &str) -> Self {
        OpKey { op, lhs: lhs.into(), rhs: rhs.into() }
    }

    fn swapped(&self) -> Self {
        OpKey { op: self.op, lhs: self.rhs.clone(), rhs: self.lhs.clone() }
    }
}

#[derive(Debug, Default)]
pub(crate) struct OpCache {
    // OpKey -> result id
    results: BTreeMap<OpKey, ArrayId>,
    // result id -> every key registered for it, for invalidation
    keys_by_id: BTreeMap<ArrayId, Vec<OpKey>>,
}

impl OpCache {
    pub(crate) const fn new() -> Self {
        OpCache { results: BTreeMap::new(), keys_by_id: BTreeMap::new() }
    }

    /// Probe for a live result of `op` applied to the given operands.
    /// The commutative swap is probed as well for `+` and `*`.
    /// Entries whose result is no longer live are pruned.
    pub(crate) fn lookup(
        &mut self,
        op: BinOp,
        lhs: &str,
        rhs: &str,
        live: impl Fn(ArrayId) -> bool,
    ) -> Option<ArrayId> {
        let formed = OpKey::new(op, lhs, rhs);
        let mut probes = vec![formed.swapped(), formed];
        if !op.is_commutative() {
            probes.remove(0);
        }
        while let Some(key) = probes.pop() {
            if let Some(&id) = self.results.get(&key) {
                if live(id) {
                    return Some(id);
                }
                self.results.remove(&key);
            }
        }
        None
    }

    /// Register `id` as the result of `op` applied to the given operands.
    /// For commutative operators both operand orderings map to `id`.
    pub(crate) fn register(&mut self, id: ArrayId, op: BinOp, lhs: &str, rhs: &str) {
        let key = OpKey::new(op, lhs, rhs);
        let keys = self.keys_by_id.entry(id).or_default();
        if op.is_commutative() && lhs != rhs {
            let swapped = key.swapped();
            self.results.insert(swapped.clone(), id);
            keys.push(swapped);
        }
        self.results.insert(key.clone(), id);
        keys.push(key);
    }

    /// Drop every entry whose result is `id`. Keys that merely mention the
    /// identity as an operand stay, their results are still live.
    pub(crate) fn invalidate(&mut self, id: ArrayId) {
        if let Some(keys) = self.keys_by_id.remove(&id) {
            for key in keys {
                if self.results.get(&key) == Some(&id) {
                    self.results.remove(&key);
                }
            }
        }
    }

    /// Drop every entry keyed by `token` as an operand. Used when the array
    /// behind the token is mutated in place, which falsifies results that
    /// were computed from it. Destruction does not need this, a dead operand
    /// cannot be asked about again.
    pub(crate) fn invalidate_operand(&mut self, token: &str) {
        self.results.retain(|key, _| key.lhs.as_ref() != token && key.rhs.as_ref() != token);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.results.len()
    }
}

#[test]
fn commutative_ops_alias_both_orderings() {
    let mut cache = OpCache::new();
    let r = ArrayId::new(3, 0);
    cache.register(r, BinOp::Add, "id_1_0", "id_2_0");
    assert_eq!(cache.lookup(BinOp::Add, "id_1_0", "id_2_0", |_| true), Some(r));
    assert_eq!(cache.lookup(BinOp::Add, "id_2_0", "id_1_0", |_| true), Some(r));
    assert_eq!(cache.lookup(BinOp::Mul, "id_1_0", "id_2_0", |_| true), None);
}

#[test]
fn non_commutative_ops_hit_only_the_formed_ordering() {
    let mut cache = OpCache::new();
    let r = ArrayId::new(3, 0);
    cache.register(r, BinOp::Sub, "id_1_0", "id_2_0");
    assert_eq!(cache.lookup(BinOp::Sub, "id_1_0", "id_2_0", |_| true), Some(r));
    assert_eq!(cache.lookup(BinOp::Sub, "id_2_0", "id_1_0", |_| true), None);
}

#[test]
fn dead_results_are_pruned_on_probe() {
    let mut cache = OpCache::new();
    let r = ArrayId::new(3, 0);
    cache.register(r, BinOp::Add, "id_1_0", "2");
    assert_eq!(cache.len(), 2);
    // A probe sees the dead result and prunes it, alias included.
    assert_eq!(cache.lookup(BinOp::Add, "id_1_0", "2", |_| false), None);
    assert_eq!(cache.len(), 0);
    // Registering again after the prune works as if nothing happened.
    cache.register(r, BinOp::Add, "id_1_0", "2");
    assert_eq!(cache.lookup(BinOp::Add, "2", "id_1_0", |_| true), Some(r));
}

#[test]
fn operand_invalidation_drops_results_computed_from_it() {
    let mut cache = OpCache::new();
    let r1 = ArrayId::new(3, 0);
    let r2 = ArrayId::new(4, 0);
    cache.register(r1, BinOp::Add, "id_1_0", "id_2_0");
    cache.register(r2, BinOp::Mul, "id_5_0", "id_6_0");
    cache.invalidate_operand("id_1_0");
    assert_eq!(cache.lookup(BinOp::Add, "id_1_0", "id_2_0", |_| true), None);
    assert_eq!(cache.lookup(BinOp::Add, "id_2_0", "id_1_0", |_| true), None);
    assert_eq!(cache.lookup(BinOp::Mul, "id_5_0", "id_6_0", |_| true), Some(r2));
}

#[test]
fn invalidation_spares_entries_keyed_by_the_dying_operand() {
    let mut cache = OpCache::new();
    let r1 = ArrayId::new(3, 0);
    let r2 = ArrayId::new(4, 0);
    // r1 = a + b, r2 = r1 - c: r1 appears as an operand of r2's key.
    cache.register(r1, BinOp::Add, "id_1_0", "id_2_0");
    cache.register(r2, BinOp::Sub, "id_3_0", "id_5_0");
    cache.invalidate(r1);
    assert_eq!(cache.lookup(BinOp::Add, "id_1_0", "id_2_0", |_| true), None);
    // The r2 entry mentioning id_3_0 as operand must survive.
    assert_eq!(cache.lookup(BinOp::Sub, "id_3_0", "id_5_0", |_| true), Some(r2));
}
