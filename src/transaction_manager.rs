//! The transaction manager (spec §4.2): the only path through which the
//! B-tree, space map and HSM metadata layer touch the block cache. Owns the
//! shadow spine invariant — at most two blocks held write-locked at a time,
//! a parent and the node currently being descended into — and coalesces a
//! node shadowed twice within the same transaction into a single new block.
//!
//! Grounded in the teacher's `storage/buffer.rs` for the lock-acquire /
//! release discipline; the copy-on-write semantics themselves come from
//! spec.md §4.1-§4.2, which this module implements directly since the
//! teacher has no analogue.

use crate::block::BlockId;
use crate::blockio::{BlockCache, ReadGuard, Validator, WriteGuard};
use crate::error::Result;
use crate::space_map::SpaceMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// The result of shadowing a node: its new location, a write lock already
/// primed with the old node's contents, and whether the node's children
/// must each have their refcount bumped (the old node was shared, so after
/// this shadow both the old and new copies point at them).
pub struct ShadowResult {
    pub loc: BlockId,
    pub guard: WriteGuard,
    pub inc_children: bool,
}

pub struct TransactionManager {
    cache: Arc<BlockCache>,
    space_map: Arc<SpaceMap>,
    /// orig block -> new block, for nodes already shadowed in this
    /// transaction (spec §4.2: "shadowing a node already shadowed in the
    /// current transaction returns the existing new location").
    shadowed_this_txn: Mutex<HashMap<BlockId, BlockId>>,
}

impl TransactionManager {
    pub fn new(cache: Arc<BlockCache>, space_map: Arc<SpaceMap>) -> Self {
        Self {
            cache,
            space_map,
            shadowed_this_txn: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn space_map(&self) -> &Arc<SpaceMap> {
        &self.space_map
    }

    pub fn block_size(&self) -> usize {
        self.cache.block_size
    }

    /// Allocate and zero a brand-new block, owned outright by the caller.
    pub fn new_block(&self) -> Result<BlockId> {
        let loc = self.space_map.alloc(self)?;
        self.cache.new_block(loc)?;
        Ok(loc)
    }

    /// Reserve a specific block (e.g. the fixed-location superblock) before
    /// the space map's own structures exist.
    pub fn reserve_block(&self, loc: BlockId) -> Result<()> {
        self.space_map.reserve(loc, self)
    }

    pub fn read_lock(&self, loc: BlockId, validator: &dyn Validator) -> Result<ReadGuard> {
        self.cache.read_lock(loc, validator)
    }

    /// Write-lock a block outright, with no shadowing. Only safe for a
    /// block this transaction already owns exclusively (one just allocated
    /// via [`TransactionManager::new_block`], or the result of a prior
    /// [`TransactionManager::shadow`]).
    pub fn write_lock(&self, loc: BlockId, validator: Arc<dyn Validator>) -> Result<WriteGuard> {
        self.cache.write_lock(loc, validator)
    }

    pub fn try_read_lock(&self, loc: BlockId, validator: &dyn Validator) -> Result<ReadGuard> {
        self.cache.try_read_lock(loc, validator)
    }

    pub fn try_write_lock(&self, loc: BlockId, validator: Arc<dyn Validator>) -> Result<WriteGuard> {
        self.cache.try_write_lock(loc, validator)
    }

    /// Shadow `orig`: copy its content into a fresh block, drop one
    /// reference from `orig`, and return a write lock on the copy.
    ///
    /// If `orig` was already shadowed earlier in this transaction, returns
    /// the same new location again rather than allocating a second time.
    pub fn shadow(&self, orig: BlockId, validator: Arc<dyn Validator>) -> Result<ShadowResult> {
        if let Some(&new_loc) = self.shadowed_this_txn.lock().get(&orig) {
            let guard = self.cache.write_lock(new_loc, validator)?;
            return Ok(ShadowResult {
                loc: new_loc,
                guard,
                inc_children: false,
            });
        }

        let old_count = self.space_map.get_count(orig)?;
        let data = self.cache.read_lock(orig, validator.as_ref())?.to_vec();

        let new_loc = self.space_map.alloc(self)?;
        self.cache.new_block(new_loc)?;
        let mut guard = self.cache.write_lock(new_loc, validator)?;
        guard.copy_from_slice(&data);

        self.space_map.dec(orig, self)?;
        self.shadowed_this_txn.lock().insert(orig, new_loc);

        Ok(ShadowResult {
            loc: new_loc,
            guard,
            inc_children: old_count > 1,
        })
    }

    pub fn inc(&self, loc: BlockId) -> Result<()> {
        self.space_map.inc(loc, self)
    }

    pub fn dec(&self, loc: BlockId) -> Result<()> {
        self.space_map.dec(loc, self)
    }

    pub fn ref_count(&self, loc: BlockId) -> Result<u32> {
        self.space_map.get_count(loc)
    }

    /// Flush every dirty block and the space map's own on-disk state, but
    /// do not yet write the superblock. Split from `commit` so a caller can
    /// assemble the new superblock contents from post-flush state (e.g. the
    /// space map's serialized root) before the atomic commit point.
    pub fn pre_commit(&self) -> Result<()> {
        self.space_map.pre_commit(self)?;
        self.cache.flush_all()
    }

    /// Complete the transaction: `pre_commit`, then write the superblock —
    /// the single block whose write makes every other change in this
    /// transaction visible (spec §4.1).
    pub fn commit(&self, superblock_loc: BlockId) -> Result<()> {
        self.pre_commit()?;
        self.cache.flush_one(superblock_loc)?;
        self.space_map.commit_snapshot();
        self.shadowed_this_txn.lock().clear();
        Ok(())
    }

    /// A fresh handle sharing this manager's cache and space map but with
    /// no in-progress shadow state, for a reader that must never block
    /// behind a writer's transaction (spec §4.2).
    pub fn non_blocking_clone(&self) -> TransactionManager {
        TransactionManager {
            cache: self.cache.clone(),
            space_map: self.space_map.clone(),
            shadowed_this_txn: Mutex::new(HashMap::new()),
        }
    }
}
