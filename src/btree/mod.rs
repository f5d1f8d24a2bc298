//! The copy-on-write B-tree (spec §4.3): the persistence primitive every
//! higher layer builds on. A tree is identified purely by its root block —
//! there is no in-memory tree object to hold, only a location that changes
//! on every mutation.
//!
//! A "multi-level" tree (the HSM metadata layer's `(dev, block) -> value`
//! maps) is not a distinct structure here: it is two of these trees nested,
//! the outer one valued with [`value::RootPtr`] pointing at an inner one,
//! exactly as spec.md §4.4 describes.
//!
//! Grounded in the teacher's `index/btree.rs` for the descent-and-latch
//! shape (search/insert/delete, crabbing down the tree), generalized from
//! an in-memory `Arc<RwLock<Node>>` tree to one stored as shadowed disk
//! blocks via [`TransactionManager`].

pub mod node;
pub mod value;

pub use value::{RootPtr, ValueType};

use crate::block::BlockId;
use crate::blockio::{BlockCache, CrcLocationValidator, Validator};
use crate::error::Result;
use crate::transaction_manager::TransactionManager;
use node::{NodeRef, NodeRefMut};
use std::marker::PhantomData;
use std::sync::Arc;

pub struct BTree<V: ValueType> {
    _marker: PhantomData<V>,
}

impl<V: ValueType> BTree<V> {
    fn validator() -> Arc<dyn Validator> {
        Arc::new(CrcLocationValidator)
    }

    fn leaf_max(tm: &TransactionManager) -> u32 {
        node::max_entries_for(tm.block_size(), V::SIZE)
    }

    fn internal_max(tm: &TransactionManager) -> u32 {
        node::max_entries_for(tm.block_size(), 8)
    }

    /// Allocate a single empty leaf and return its location as the root of
    /// a brand-new, empty tree.
    pub fn create_empty(tm: &TransactionManager) -> Result<BlockId> {
        let loc = tm.new_block()?;
        let max = Self::leaf_max(tm);
        let mut w = tm.write_lock(loc, Self::validator())?;
        NodeRefMut::new(&mut w).init(true, max);
        Ok(loc)
    }

    pub fn lookup(cache: &BlockCache, root: BlockId, key: u64) -> Result<Option<V>> {
        let mut loc = root;
        loop {
            let r = cache.read_lock(loc, &CrcLocationValidator)?;
            let n = NodeRef::new(&r);
            if n.is_leaf() {
                let i = n.lower_bound(key);
                if i < n.nr_entries() as usize && n.key(i) == key {
                    return Ok(Some(V::unpack(n.value_bytes(i, V::SIZE))));
                }
                return Ok(None);
            }
            match n.descend_index(key) {
                Some(i) => {
                    let child = n.child(i);
                    drop(r);
                    loc = child;
                }
                None => return Ok(None),
            }
        }
    }

    /// Non-blocking variant of [`BTree::lookup`]: fails with
    /// [`crate::error::CacheError::WouldBlock`] the moment any node on the
    /// path is non-resident or already write-locked, rather than waiting.
    /// Used by the fast lookup path that must never stall behind the
    /// worker task's in-progress transaction (spec §4.1, §4.4).
    pub fn try_lookup(cache: &BlockCache, root: BlockId, key: u64) -> Result<Option<V>> {
        let mut loc = root;
        loop {
            let r = cache.try_read_lock(loc, &CrcLocationValidator)?;
            let n = NodeRef::new(&r);
            if n.is_leaf() {
                let i = n.lower_bound(key);
                if i < n.nr_entries() as usize && n.key(i) == key {
                    return Ok(Some(V::unpack(n.value_bytes(i, V::SIZE))));
                }
                return Ok(None);
            }
            match n.descend_index(key) {
                Some(i) => {
                    let child = n.child(i);
                    drop(r);
                    loc = child;
                }
                None => return Ok(None),
            }
        }
    }

    /// Visit every `(key, value)` pair in ascending key order.
    pub fn walk(cache: &BlockCache, root: BlockId, f: &mut dyn FnMut(u64, V)) -> Result<()> {
        let r = cache.read_lock(root, &CrcLocationValidator)?;
        let n = NodeRef::new(&r);
        if n.is_leaf() {
            for i in 0..n.nr_entries() as usize {
                f(n.key(i), V::unpack(n.value_bytes(i, V::SIZE)));
            }
            Ok(())
        } else {
            let children: Vec<BlockId> = (0..n.nr_entries() as usize).map(|i| n.child(i)).collect();
            drop(r);
            for child in children {
                Self::walk(cache, child, f)?;
            }
            Ok(())
        }
    }

    /// Insert or overwrite `key -> value`, returning the tree's new root.
    ///
    /// Splitting happens on the way down (spec §4.3, §9): before descending
    /// into any node we make sure it has room for one more entry, so the
    /// recursive insert never has to report a split back up to its caller.
    /// The root has no parent to do this for it, so `insert` itself splits
    /// the root first if it is already full.
    pub fn insert(tm: &TransactionManager, root: BlockId, key: u64, value: V) -> Result<BlockId> {
        let mut packed = vec![0u8; V::SIZE];
        value.pack(&mut packed);

        let root_full = {
            let r = tm.read_lock(root, &CrcLocationValidator)?;
            let n = NodeRef::new(&r);
            n.nr_entries() == n.max_entries()
        };
        let root = if root_full { Self::split_root(tm, root)? } else { root };

        Self::insert_rec(tm, root, key, packed)
    }

    /// Split an already-full root in place, producing a new one-level-taller
    /// root with two children.
    fn split_root(tm: &TransactionManager, root: BlockId) -> Result<BlockId> {
        let orig_min = Self::min_key(tm.cache(), root)?;
        let (left_loc, split_key, right_loc) = Self::split_full_node(tm, root)?;
        let max = Self::internal_max(tm);
        let loc = tm.new_block()?;
        let mut w = tm.write_lock(loc, Self::validator())?;
        let mut n = NodeRefMut::new(&mut w);
        n.init(false, max);
        n.insert_at(0, orig_min, &left_loc.to_le_bytes());
        n.insert_at(1, split_key, &right_loc.to_le_bytes());
        Ok(loc)
    }

    /// After shadowing a node whose old refcount was greater than one, both
    /// the old and new copies now point at the same children: each child's
    /// refcount must be bumped to account for the new incoming reference
    /// (spec §4.2, §4.3's `on_copy` hook).
    fn handle_copy(tm: &TransactionManager, new_loc: BlockId, is_leaf: bool) -> Result<()> {
        let r = tm.read_lock(new_loc, &CrcLocationValidator)?;
        let n = NodeRef::new(&r);
        let nr = n.nr_entries() as usize;
        if is_leaf {
            let values: Vec<V> = (0..nr).map(|i| V::unpack(n.value_bytes(i, V::SIZE))).collect();
            drop(r);
            for v in values {
                v.on_copy(tm)?;
            }
        } else {
            let children: Vec<BlockId> = (0..nr).map(|i| n.child(i)).collect();
            drop(r);
            for c in children {
                tm.inc(c)?;
            }
        }
        Ok(())
    }

    fn min_key(cache: &BlockCache, loc: BlockId) -> Result<u64> {
        let r = cache.read_lock(loc, &CrcLocationValidator)?;
        let n = NodeRef::new(&r);
        if n.is_leaf() {
            Ok(n.key(0))
        } else {
            let child = n.child(0);
            drop(r);
            Self::min_key(cache, child)
        }
    }

    /// Descend into `loc` inserting `key -> packed`. The caller guarantees
    /// `loc` itself has room for one more entry (either it's the root,
    /// handled by [`Self::insert`], or the parent call just split it via
    /// [`Self::split_full_node`] before recursing here) — so this never
    /// needs to report a split back up. Only (parent, current) are ever
    /// write-locked at once: the parent's guard is dropped before the
    /// recursive call and re-acquired just to patch in the child's new
    /// location afterward (spec §3, §4.3, §9).
    fn insert_rec(tm: &TransactionManager, loc: BlockId, key: u64, packed: Vec<u8>) -> Result<BlockId> {
        let shadow = tm.shadow(loc, Self::validator())?;
        let inc_children = shadow.inc_children;
        let new_loc = shadow.loc;
        let mut w = shadow.guard;
        let is_leaf = NodeRefMut::new(&mut w).is_leaf();
        if inc_children {
            drop(w);
            Self::handle_copy(tm, new_loc, is_leaf)?;
            w = tm.write_lock(new_loc, Self::validator())?;
        }

        if is_leaf {
            let (idx, exists) = {
                let n = NodeRefMut::new(&mut w).as_ref();
                let i = n.lower_bound(key);
                (i, i < n.nr_entries() as usize && n.key(i) == key)
            };
            if exists {
                NodeRefMut::new(&mut w).set_value_at(idx, packed.len(), &packed);
            } else {
                NodeRefMut::new(&mut w).insert_at(idx, key, &packed);
            }
            return Ok(new_loc);
        }

        let mut child_idx = {
            let n = NodeRefMut::new(&mut w).as_ref();
            n.descend_index(key).unwrap_or(0)
        };
        let mut child_loc = NodeRefMut::new(&mut w).as_ref().child(child_idx);

        let child_full = {
            let r = tm.read_lock(child_loc, &CrcLocationValidator)?;
            let n = NodeRef::new(&r);
            n.nr_entries() == n.max_entries()
        };

        if child_full {
            let (left_loc, split_key, right_loc) = Self::split_full_node(tm, child_loc)?;
            NodeRefMut::new(&mut w).set_value_at(child_idx, 8, &left_loc.to_le_bytes());
            NodeRefMut::new(&mut w).insert_at(child_idx + 1, split_key, &right_loc.to_le_bytes());
            if key >= split_key {
                child_idx += 1;
                child_loc = right_loc;
            } else {
                child_loc = left_loc;
            }
        }

        drop(w);
        let new_child_loc = Self::insert_rec(tm, child_loc, key, packed)?;

        let mut w = tm.write_lock(new_loc, Self::validator())?;
        NodeRefMut::new(&mut w).set_value_at(child_idx, 8, &new_child_loc.to_le_bytes());
        Ok(new_loc)
    }

    /// Split a node that is already at capacity, without inserting anything
    /// new: gather its existing entries, divide them evenly, write the
    /// first half back in place and the second half into a fresh sibling
    /// block. Used both to make room in a full child before descending into
    /// it, and to split an overflowing root.
    fn split_full_node(tm: &TransactionManager, loc: BlockId) -> Result<(BlockId, u64, BlockId)> {
        let validator = Self::validator();
        let shadow = tm.shadow(loc, validator.clone())?;
        let inc_children = shadow.inc_children;
        let new_loc = shadow.loc;
        let mut w = shadow.guard;
        let is_leaf = NodeRefMut::new(&mut w).is_leaf();
        if inc_children {
            drop(w);
            Self::handle_copy(tm, new_loc, is_leaf)?;
            w = tm.write_lock(new_loc, validator.clone())?;
        }

        let (max, nr, leaf, value_size) = {
            let n = NodeRefMut::new(&mut w).as_ref();
            let leaf = n.is_leaf();
            let vs = if leaf { V::SIZE } else { 8 };
            (n.max_entries(), n.nr_entries() as usize, leaf, vs)
        };

        let mut keys = Vec::with_capacity(nr);
        let mut values = Vec::with_capacity(nr);
        {
            let n = NodeRefMut::new(&mut w).as_ref();
            for i in 0..nr {
                keys.push(n.key(i));
                values.push(n.value_bytes(i, value_size).to_vec());
            }
        }

        let mid = nr / 2;
        let (left_keys, right_keys) = keys.split_at(mid);
        let (left_values, right_values) = values.split_at(mid);

        {
            let mut n = NodeRefMut::new(&mut w);
            n.truncate(0);
            n.append_entries(left_keys, left_values);
        }
        drop(w);

        let right_loc = tm.new_block()?;
        let mut rw = tm.write_lock(right_loc, validator)?;
        let mut rn = NodeRefMut::new(&mut rw);
        rn.init(leaf, max);
        rn.append_entries(right_keys, right_values);
        let split_key = right_keys[0];

        Ok((new_loc, split_key, right_loc))
    }

    /// Remove `key` if present, returning the tree's new root.
    pub fn remove(tm: &TransactionManager, root: BlockId, key: u64) -> Result<BlockId> {
        let (new_root, _) = Self::remove_rec(tm, root, key)?;
        Ok(new_root)
    }

    /// Descend into `loc` removing `key`, if present. Rebalancing happens on
    /// the way down (spec §4.3, §9): before descending into a child sitting
    /// at or below the minimum-occupancy threshold we merge or borrow for
    /// it first, so the removal underneath can never leave it underflowed
    /// and nothing needs reporting back up. Only (parent, current) are ever
    /// write-locked at once, same discipline as [`Self::insert_rec`].
    fn remove_rec(tm: &TransactionManager, loc: BlockId, key: u64) -> Result<(BlockId, bool)> {
        let shadow = tm.shadow(loc, Self::validator())?;
        let inc_children = shadow.inc_children;
        let new_loc = shadow.loc;
        let mut w = shadow.guard;
        let is_leaf = NodeRefMut::new(&mut w).is_leaf();
        if inc_children {
            drop(w);
            Self::handle_copy(tm, new_loc, is_leaf)?;
            w = tm.write_lock(new_loc, Self::validator())?;
        }

        if is_leaf {
            let (idx, exists) = {
                let n = NodeRefMut::new(&mut w).as_ref();
                let i = n.lower_bound(key);
                (i, i < n.nr_entries() as usize && n.key(i) == key)
            };
            if !exists {
                return Ok((new_loc, false));
            }
            let old_value = V::unpack(NodeRefMut::new(&mut w).as_ref().value_bytes(idx, V::SIZE));
            NodeRefMut::new(&mut w).remove_at(idx, V::SIZE);
            drop(w);
            old_value.on_delete(tm)?;
            return Ok((new_loc, true));
        }

        let mut child_idx = {
            let n = NodeRefMut::new(&mut w).as_ref();
            n.descend_index(key).unwrap_or(0)
        };
        let mut child_loc = NodeRefMut::new(&mut w).as_ref().child(child_idx);

        let parent_nr = NodeRefMut::new(&mut w).nr_entries() as usize;
        if parent_nr > 1 {
            // spec.md's rebalance threshold: a node at or below ceil(max/3)
            // entries must merge or borrow from a sibling before we remove
            // one more entry from somewhere underneath it.
            let (child_max, child_nr) = {
                let r = tm.read_lock(child_loc, &CrcLocationValidator)?;
                let n = NodeRef::new(&r);
                (n.max_entries() as usize, n.nr_entries() as usize)
            };
            let min = (child_max + 2) / 3;
            if child_nr <= min {
                Self::rebalance(tm, &mut w, child_idx, min)?;
                // The child's index (and possibly identity, if it merged
                // with its neighbor) may have shifted; re-resolve it.
                child_idx = {
                    let n = NodeRefMut::new(&mut w).as_ref();
                    n.descend_index(key).unwrap_or(0)
                };
                child_loc = NodeRefMut::new(&mut w).as_ref().child(child_idx);
            }
        }

        drop(w);
        let (new_child_loc, removed) = Self::remove_rec(tm, child_loc, key)?;
        if !removed {
            return Ok((new_loc, false));
        }

        let mut w = tm.write_lock(new_loc, Self::validator())?;
        NodeRefMut::new(&mut w).set_value_at(child_idx, 8, &new_child_loc.to_le_bytes());
        Ok((new_loc, true))
    }

    /// Restore the minimum-occupancy invariant for the child at
    /// `child_idx` by merging it with, or borrowing entries from,
    /// whichever neighbor (by index) currently holds the larger node.
    ///
    /// Entries (and, for internal siblings, child block pointers) are moved
    /// across the `lo`/`hi` boundary by relocating them wholesale rather
    /// than going through `handle_copy`'s per-child `inc`. That is only
    /// safe while `lo` and `hi` are each exclusively owned by this parent
    /// (refcount 1) going in — a COW-shared sibling would need its moved
    /// children's refcounts bumped to account for the old, still-live copy
    /// continuing to reference them, which this function does not do.
    fn rebalance(
        tm: &TransactionManager,
        parent_w: &mut crate::blockio::WriteGuard,
        child_idx: usize,
        min: usize,
    ) -> Result<()> {
        let validator = Self::validator();
        let parent_nr = NodeRefMut::new(parent_w).nr_entries() as usize;

        let sib_idx = if child_idx + 1 < parent_nr {
            child_idx + 1
        } else if child_idx > 0 {
            child_idx - 1
        } else {
            return Ok(());
        };

        let (lo_idx, hi_idx) = if sib_idx > child_idx {
            (child_idx, sib_idx)
        } else {
            (sib_idx, child_idx)
        };
        let lo_loc = NodeRefMut::new(parent_w).as_ref().child(lo_idx);
        let hi_loc = NodeRefMut::new(parent_w).as_ref().child(hi_idx);

        if tm.ref_count(lo_loc)? > 1 || tm.ref_count(hi_loc)? > 1 {
            return Err(crate::error::CacheError::Internal(
                "rebalance: sibling is COW-shared, entry relocation would under-count its children".into(),
            ));
        }

        let lo_shadow = tm.shadow(lo_loc, validator.clone())?;
        let lo_inc_children = lo_shadow.inc_children;
        let new_lo_loc = lo_shadow.loc;
        let mut lo_w = lo_shadow.guard;
        let lo_is_leaf = NodeRefMut::new(&mut lo_w).is_leaf();
        if lo_inc_children {
            drop(lo_w);
            Self::handle_copy(tm, new_lo_loc, lo_is_leaf)?;
            lo_w = tm.write_lock(new_lo_loc, validator.clone())?;
        }
        let hi_r = tm.read_lock(hi_loc, &CrcLocationValidator)?;

        let (max, leaf, value_size, lo_nr, hi_nr) = {
            let lo_n = NodeRefMut::new(&mut lo_w).as_ref();
            let hi_n = NodeRef::new(&hi_r);
            let leaf = lo_n.is_leaf();
            let vs = if leaf { V::SIZE } else { 8 };
            (lo_n.max_entries() as usize, leaf, vs, lo_n.nr_entries() as usize, hi_n.nr_entries() as usize)
        };

        let mut lo_keys = Vec::with_capacity(lo_nr);
        let mut lo_values = Vec::with_capacity(lo_nr);
        {
            let lo_n = NodeRefMut::new(&mut lo_w).as_ref();
            for i in 0..lo_nr {
                lo_keys.push(lo_n.key(i));
                lo_values.push(lo_n.value_bytes(i, value_size).to_vec());
            }
        }
        let mut hi_keys = Vec::with_capacity(hi_nr);
        let mut hi_values = Vec::with_capacity(hi_nr);
        {
            let hi_n = NodeRef::new(&hi_r);
            for i in 0..hi_nr {
                hi_keys.push(hi_n.key(i));
                hi_values.push(hi_n.value_bytes(i, value_size).to_vec());
            }
        }
        drop(hi_r);

        if lo_nr + hi_nr <= max {
            // Merge: fold everything into `lo`, drop `hi` from the parent.
            lo_keys.extend(hi_keys);
            lo_values.extend(hi_values);
            {
                let mut n = NodeRefMut::new(&mut lo_w);
                n.truncate(0);
                n.append_entries(&lo_keys, &lo_values);
            }
            drop(lo_w);

            let mut p = NodeRefMut::new(parent_w);
            p.set_value_at(lo_idx, 8, &new_lo_loc.to_le_bytes());
            p.remove_at(hi_idx, 8);
            // `hi`'s entries were copied into `lo`, not moved by reference;
            // the parent no longer points at `hi` itself.
            tm.dec(hi_loc)?;
        } else {
            // Redistribute: move entries across the boundary until both
            // sides meet the minimum occupancy.
            let mut all_keys = lo_keys;
            let mut all_values = lo_values;
            all_keys.extend(hi_keys);
            all_values.extend(hi_values);

            let total = all_keys.len();
            let new_lo_len = (total / 2).max(min);
            let (lk, rk) = all_keys.split_at(new_lo_len);
            let (lv, rv) = all_values.split_at(new_lo_len);

            {
                let mut n = NodeRefMut::new(&mut lo_w);
                n.truncate(0);
                n.append_entries(lk, lv);
            }
            drop(lo_w);

            let hi_shadow = tm.shadow(hi_loc, validator)?;
            // hi_loc was just asserted refcount 1, so this shadow is a
            // plain same-owner copy (inc_children is always false here);
            // the old content is about to be fully overwritten anyway.
            let new_hi_loc = hi_shadow.loc;
            let mut hi_w = hi_shadow.guard;
            {
                let mut n = NodeRefMut::new(&mut hi_w);
                n.init(leaf, max as u32);
                n.append_entries(rk, rv);
            }
            drop(hi_w);

            let mut p = NodeRefMut::new(parent_w);
            p.set_value_at(lo_idx, 8, &new_lo_loc.to_le_bytes());
            p.set_value_at(hi_idx, 8, &new_hi_loc.to_le_bytes());
        }

        Ok(())
    }
}

/// Recursively free the subtree rooted at `root`, whose leaf values have
/// type `V`. If `root` is still referenced elsewhere (refcount > 1 before
/// this call), only that one reference is dropped — the rest of the
/// subtree is left alone for its other owner.
///
/// Used by [`RootPtr::on_delete`] to free an entire inner tree when the
/// outer entry that owned it is removed (spec §4.3, §4.4).
pub fn delete_subtree<V: ValueType>(tm: &TransactionManager, root: BlockId) -> Result<()> {
    if tm.ref_count(root)? > 1 {
        return tm.dec(root);
    }

    let is_leaf = {
        let r = tm.read_lock(root, &CrcLocationValidator)?;
        NodeRef::new(&r).is_leaf()
    };

    if is_leaf {
        let values: Vec<V> = {
            let r = tm.read_lock(root, &CrcLocationValidator)?;
            let n = NodeRef::new(&r);
            (0..n.nr_entries() as usize)
                .map(|i| V::unpack(n.value_bytes(i, V::SIZE)))
                .collect()
        };
        for v in values {
            v.on_delete(tm)?;
        }
    } else {
        let children: Vec<BlockId> = {
            let r = tm.read_lock(root, &CrcLocationValidator)?;
            let n = NodeRef::new(&r);
            (0..n.nr_entries() as usize).map(|i| n.child(i)).collect()
        };
        for c in children {
            delete_subtree::<V>(tm, c)?;
        }
    }

    tm.dec(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space_map::SpaceMap;
    use tempfile::tempdir;

    fn fresh_tm(block_size: usize) -> (tempfile::TempDir, TransactionManager) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::open(&dir.path().join("md"), block_size, 256).unwrap());
        let space_map = SpaceMap::create(cache.clone(), 1024, 1).unwrap();
        let tm = TransactionManager::new(cache, space_map);
        (dir, tm)
    }

    #[test]
    fn insert_and_lookup_roundtrip() {
        let (_dir, tm) = fresh_tm(256);
        let mut root = BTree::<u64>::create_empty(&tm).unwrap();
        for k in [10u64, 3, 77, 1, 42] {
            root = BTree::<u64>::insert(&tm, root, k, k).unwrap();
        }
        for k in [10u64, 3, 77, 1, 42] {
            assert_eq!(BTree::<u64>::lookup(tm.cache(), root, k).unwrap(), Some(k));
        }
        assert_eq!(BTree::<u64>::lookup(tm.cache(), root, 999).unwrap(), None);
    }

    #[test]
    fn remove_drops_entry() {
        let (_dir, tm) = fresh_tm(256);
        let mut root = BTree::<u64>::create_empty(&tm).unwrap();
        for k in 0..20u64 {
            root = BTree::<u64>::insert(&tm, root, k, k).unwrap();
        }
        root = BTree::<u64>::remove(&tm, root, 5).unwrap();
        assert_eq!(BTree::<u64>::lookup(tm.cache(), root, 5).unwrap(), None);
        assert_eq!(BTree::<u64>::lookup(tm.cache(), root, 6).unwrap(), Some(6));
    }
}
