//! L4: HSM metadata — the forward map (`(dev, origin block) -> (pool
//! block, flags)`) and reverse map (`(dev, pool block) -> origin block`)
//! that sit on top of the B-tree and space map (spec §5).
//!
//! Both maps are two-level trees: an outer [`BTree<RootPtr>`] keyed by
//! device id whose values are the root of a per-device inner
//! [`BTree<u64>`]. Removing a device's entry from the outer tree drops the
//! whole inner tree via [`RootPtr::on_delete`], so deleting a device is one
//! outer-tree removal per map, not a walk of its mappings.

pub mod superblock;

use crate::block::{pack_mapping, unpack_mapping, DevId, MappingFlags, OBlock, PBlock};
use crate::blockio::{BlockCache, CrcLocationValidator, DEFAULT_CACHE_CAPACITY};
use crate::btree::{BTree, RootPtr};
use crate::error::{CacheError, Result};
use crate::space_map::SpaceMap;
use crate::transaction_manager::TransactionManager;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

pub use superblock::{Superblock, METADATA_BLOCK_SIZE_SECTORS, SUPERBLOCK_LOC};

/// Fixed metadata block size (spec §6); unlike the cached-device block
/// size, this is never configurable.
pub const METADATA_BLOCK_SIZE: usize = 4096;

/// Metadata devices are bump-allocated, not grown on demand, so a cap must
/// be picked up front. 32768 blocks at 4KiB is 128MiB of metadata, in line
/// with the real-world ratios in spec §6.
pub const DEFAULT_NR_METADATA_BLOCKS: u64 = 32_768;

fn registry() -> &'static DashMap<PathBuf, Arc<Metadata>> {
    static REGISTRY: OnceLock<DashMap<PathBuf, Arc<Metadata>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// A live handle onto one metadata device's forward/reverse maps.
///
/// Handles are process-wide singletons keyed by path (spec §4.4: "opening
/// the same metadata device twice must return the same handle, not a
/// second independent transaction context"), tracked in a registry rather
/// than behind a refcount so `close` is an explicit, caller-driven act.
pub struct Metadata {
    tm: TransactionManager,
    superblock_loc: crate::block::BlockId,
    nr_metadata_blocks: u64,
    data_block_size: u64,
    nr_data_blocks: RwLock<u64>,
    /// High-water mark of allocated pool blocks; `insert` hands out
    /// `first_free_block` and post-increments it (spec §4.4). Never
    /// decremented by `remove` — freed pool blocks are not reused by this
    /// simplified allocator (see DESIGN.md).
    first_free_block: RwLock<u64>,
    forward_root: RwLock<crate::block::BlockId>,
    reverse_root: RwLock<crate::block::BlockId>,
    have_inserted: RwLock<bool>,
    /// Sticky CONSISTENCY-FAIL state (spec §7): once a commit fails partway
    /// through, every subsequent operation on this handle must fail too,
    /// rather than risk operating against a superblock that doesn't match
    /// what's on disk.
    consistency_failed: RwLock<Option<String>>,
    transaction_count: AtomicU64,
}

impl Metadata {
    /// Create a brand-new metadata device, formatting its superblock and
    /// both empty maps, and register the handle.
    pub fn create(path: &Path, data_block_size: u64, nr_data_blocks: u64) -> Result<Arc<Metadata>> {
        let key = path.to_path_buf();
        if let Some(existing) = registry().get(&key) {
            tracing::debug!(path = %path.display(), "metadata already open, returning existing handle");
            return Ok(existing.clone());
        }

        tracing::info!(path = %path.display(), data_block_size, nr_data_blocks, "formatting metadata device");
        let cache = Arc::new(BlockCache::open(path, METADATA_BLOCK_SIZE, DEFAULT_CACHE_CAPACITY)?);
        let space_map = SpaceMap::create(cache.clone(), DEFAULT_NR_METADATA_BLOCKS, 1)?;
        let tm = TransactionManager::new(cache, space_map);
        // Block 0 is the superblock's fixed location; claim it before any
        // other allocation can hand it out.
        tm.reserve_block(SUPERBLOCK_LOC)?;

        let forward_root = BTree::<RootPtr>::create_empty(&tm)?;
        let reverse_root = BTree::<RootPtr>::create_empty(&tm)?;

        let md = Arc::new(Metadata {
            tm,
            superblock_loc: SUPERBLOCK_LOC,
            nr_metadata_blocks: DEFAULT_NR_METADATA_BLOCKS,
            data_block_size,
            nr_data_blocks: RwLock::new(nr_data_blocks),
            first_free_block: RwLock::new(0),
            forward_root: RwLock::new(forward_root),
            reverse_root: RwLock::new(reverse_root),
            have_inserted: RwLock::new(true),
            consistency_failed: RwLock::new(None),
            transaction_count: AtomicU64::new(0),
        });
        md.commit()?;
        registry().insert(key, md.clone());
        Ok(md)
    }

    /// Open an existing metadata device, reading its superblock and
    /// restoring the space map from the embedded root.
    pub fn open(path: &Path) -> Result<Arc<Metadata>> {
        let key = path.to_path_buf();
        if let Some(existing) = registry().get(&key) {
            tracing::debug!(path = %path.display(), "metadata already open, returning existing handle");
            return Ok(existing.clone());
        }

        tracing::info!(path = %path.display(), "opening metadata device");
        let cache = Arc::new(BlockCache::open(path, METADATA_BLOCK_SIZE, DEFAULT_CACHE_CAPACITY)?);
        let sb_data = cache.read_lock(SUPERBLOCK_LOC, &CrcLocationValidator)?.to_vec();
        let sb = Superblock::unpack(&sb_data)?;
        let space_map = SpaceMap::restore(cache.clone(), &sb.space_map_root)?;
        let tm = TransactionManager::new(cache, space_map);

        let md = Arc::new(Metadata {
            tm,
            superblock_loc: SUPERBLOCK_LOC,
            nr_metadata_blocks: sb.metadata_nr_blocks,
            data_block_size: sb.data_block_size,
            nr_data_blocks: RwLock::new(sb.data_nr_blocks),
            first_free_block: RwLock::new(sb.first_free_block),
            forward_root: RwLock::new(sb.forward_root),
            reverse_root: RwLock::new(sb.reverse_root),
            have_inserted: RwLock::new(false),
            consistency_failed: RwLock::new(None),
            transaction_count: AtomicU64::new(0),
        });
        registry().insert(key, md.clone());
        Ok(md)
    }

    /// Drop this path's registry entry. Any `Arc<Metadata>` the caller
    /// still holds stays valid until dropped; a later `open` of the same
    /// path constructs a fresh handle from what's on disk.
    pub fn close(path: &Path) {
        tracing::info!(path = %path.display(), "closing metadata handle");
        registry().remove(path);
    }

    fn check_consistency(&self) -> Result<()> {
        if let Some(reason) = self.consistency_failed.read().clone() {
            return Err(CacheError::ConsistencyFail(reason));
        }
        Ok(())
    }

    pub fn get_data_block_size(&self) -> u64 {
        self.data_block_size
    }

    pub fn get_data_dev_size(&self) -> u64 {
        *self.nr_data_blocks.read()
    }

    /// Number of transactions committed since this handle was opened.
    /// Distinct from the superblock's own persisted state; a process
    /// restart resets it to zero even though the metadata itself persists.
    pub fn get_metadata_transaction_count(&self) -> u64 {
        self.transaction_count.load(Ordering::Relaxed)
    }

    pub fn get_free_metadata_blocks(&self) -> u64 {
        self.tm.space_map().get_nr_free_blocks()
    }

    /// Resize the data device. Rejected if the new size would truncate
    /// already-allocated blocks (spec §4.4: `new < first_free_block`).
    pub fn resize_data_dev(&self, new_nr_data_blocks: u64) -> Result<()> {
        self.check_consistency()?;
        if new_nr_data_blocks < *self.first_free_block.read() {
            return Err(CacheError::NoSpaceData);
        }
        *self.nr_data_blocks.write() = new_nr_data_blocks;
        *self.have_inserted.write() = true;
        Ok(())
    }

    /// Count of blocks currently mapped for `dev` (spec §4.4, used for
    /// capacity accounting).
    pub fn get_provisioned_blocks(&self, dev: DevId) -> Result<u64> {
        self.check_consistency()?;
        let forward_root = *self.forward_root.read();
        let inner_root = match BTree::<RootPtr>::lookup(self.tm.cache(), forward_root, dev)? {
            Some(r) => r.0,
            None => return Ok(0),
        };
        let mut count = 0u64;
        BTree::<u64>::walk(self.tm.cache(), inner_root, &mut |_, _| count += 1)?;
        Ok(count)
    }

    fn forward_lookup(&self, dev: DevId, ob: OBlock) -> Result<Option<u64>> {
        let forward_root = *self.forward_root.read();
        let inner_root = match BTree::<RootPtr>::lookup(self.tm.cache(), forward_root, dev)? {
            Some(r) => r.0,
            None => return Ok(None),
        };
        BTree::<u64>::lookup(self.tm.cache(), inner_root, ob.get())
    }

    /// Non-blocking variant backing `lookup(.., may_block = false)`: fails
    /// with [`CacheError::WouldBlock`] rather than waiting on a lock held
    /// by the worker task's in-progress transaction.
    fn try_forward_lookup(&self, dev: DevId, ob: OBlock) -> Result<Option<u64>> {
        let forward_root = *self.forward_root.read();
        let inner_root = match BTree::<RootPtr>::try_lookup(self.tm.cache(), forward_root, dev)? {
            Some(r) => r.0,
            None => return Ok(None),
        };
        BTree::<u64>::try_lookup(self.tm.cache(), inner_root, ob.get())
    }

    fn reverse_lookup(&self, dev: DevId, pb: PBlock) -> Result<Option<u64>> {
        let reverse_root = *self.reverse_root.read();
        let inner_root = match BTree::<RootPtr>::lookup(self.tm.cache(), reverse_root, dev)? {
            Some(r) => r.0,
            None => return Ok(None),
        };
        BTree::<u64>::lookup(self.tm.cache(), inner_root, pb.get())
    }

    fn forward_insert(&self, dev: DevId, ob: OBlock, packed: u64) -> Result<()> {
        let mut forward_root = self.forward_root.write();
        let inner_root = match BTree::<RootPtr>::lookup(self.tm.cache(), *forward_root, dev)? {
            Some(r) => r.0,
            None => BTree::<u64>::create_empty(&self.tm)?,
        };
        let new_inner = BTree::<u64>::insert(&self.tm, inner_root, ob.get(), packed)?;
        *forward_root = BTree::<RootPtr>::insert(&self.tm, *forward_root, dev, RootPtr(new_inner))?;
        Ok(())
    }

    fn reverse_insert(&self, dev: DevId, pb: PBlock, ob: u64) -> Result<()> {
        let mut reverse_root = self.reverse_root.write();
        let inner_root = match BTree::<RootPtr>::lookup(self.tm.cache(), *reverse_root, dev)? {
            Some(r) => r.0,
            None => BTree::<u64>::create_empty(&self.tm)?,
        };
        let new_inner = BTree::<u64>::insert(&self.tm, inner_root, pb.get(), ob)?;
        *reverse_root = BTree::<RootPtr>::insert(&self.tm, *reverse_root, dev, RootPtr(new_inner))?;
        Ok(())
    }

    fn forward_remove(&self, dev: DevId, ob: OBlock) -> Result<Option<u64>> {
        let mut forward_root = self.forward_root.write();
        let inner_root = match BTree::<RootPtr>::lookup(self.tm.cache(), *forward_root, dev)? {
            Some(r) => r.0,
            None => return Ok(None),
        };
        let existing = BTree::<u64>::lookup(self.tm.cache(), inner_root, ob.get())?;
        if existing.is_none() {
            return Ok(None);
        }
        let new_inner = BTree::<u64>::remove(&self.tm, inner_root, ob.get())?;
        *forward_root = BTree::<RootPtr>::insert(&self.tm, *forward_root, dev, RootPtr(new_inner))?;
        Ok(existing)
    }

    fn reverse_remove(&self, dev: DevId, pb: PBlock) -> Result<()> {
        let mut reverse_root = self.reverse_root.write();
        let inner_root = match BTree::<RootPtr>::lookup(self.tm.cache(), *reverse_root, dev)? {
            Some(r) => r.0,
            None => return Ok(()),
        };
        if BTree::<u64>::lookup(self.tm.cache(), inner_root, pb.get())?.is_none() {
            return Ok(());
        }
        let new_inner = BTree::<u64>::remove(&self.tm, inner_root, pb.get())?;
        *reverse_root = BTree::<RootPtr>::insert(&self.tm, *reverse_root, dev, RootPtr(new_inner))?;
        Ok(())
    }

    /// Allocate the next free pool block for `(dev, ob)`, insert it into
    /// both maps and return it with fresh `DIRTY|UPTODATE` flags (spec
    /// §4.4). Fails [`CacheError::NoSpaceData`] once every data block has
    /// been handed out.
    pub fn insert(&self, dev: DevId, ob: OBlock) -> Result<(PBlock, MappingFlags)> {
        self.check_consistency()?;
        let mut first_free = self.first_free_block.write();
        if *first_free >= *self.nr_data_blocks.read() {
            return Err(CacheError::NoSpaceData);
        }
        let pb = PBlock::new(*first_free);
        *first_free += 1;
        drop(first_free);

        let flags = MappingFlags {
            dirty: true,
            uptodate: true,
            ..Default::default()
        };
        self.forward_insert(dev, ob, pack_mapping(pb, flags))?;
        self.reverse_insert(dev, pb, ob.get())?;
        *self.have_inserted.write() = true;
        Ok((pb, flags))
    }

    /// Remove the mapping for `(dev, ob)`, if any.
    pub fn remove(&self, dev: DevId, ob: OBlock) -> Result<()> {
        self.check_consistency()?;
        if let Some(old_packed) = self.forward_remove(dev, ob)? {
            let (old_pb, _) = unpack_mapping(old_packed);
            self.reverse_remove(dev, old_pb)?;
        }
        *self.have_inserted.write() = true;
        Ok(())
    }

    /// Re-key an existing mapping from `old_ob` to `new_ob`, keeping the
    /// same pool block. Cache residency (`CBlock`, owned by the
    /// replacement policy) and thin-provisioned backing storage
    /// (`PBlock`, owned here) are independent allocations in this
    /// implementation, and the bump allocator behind [`Self::insert`]
    /// never reclaims a block on its own; this is how a pool block freed
    /// by a cache-level reclaim gets handed to a different, newly-touched
    /// origin block once the device has filled up at least once. Also
    /// usable as a plain administrative correction (e.g.
    /// `force_mapping`-style remaps at the HSM layer). Fails
    /// [`CacheError::NotFound`] if `old_ob` has no mapping.
    pub fn reassign(&self, dev: DevId, old_ob: OBlock, new_ob: OBlock) -> Result<(PBlock, MappingFlags)> {
        self.check_consistency()?;
        let old_packed = self.forward_remove(dev, old_ob)?.ok_or(CacheError::NotFound)?;
        let (pb, _) = unpack_mapping(old_packed);
        self.reverse_remove(dev, pb)?;
        let flags = MappingFlags {
            dirty: true,
            uptodate: true,
            ..Default::default()
        };
        self.forward_insert(dev, new_ob, pack_mapping(pb, flags))?;
        self.reverse_insert(dev, pb, new_ob.get())?;
        *self.have_inserted.write() = true;
        Ok((pb, flags))
    }

    /// Look up `(dev, ob)`. When `may_block` is false, uses the
    /// non-blocking descent and returns [`CacheError::WouldBlock`] instead
    /// of waiting on a contended node (spec §4.4).
    pub fn lookup(&self, dev: DevId, ob: OBlock, may_block: bool) -> Result<Option<(PBlock, MappingFlags)>> {
        self.check_consistency()?;
        let packed = if may_block {
            self.forward_lookup(dev, ob)?
        } else {
            self.try_forward_lookup(dev, ob)?
        };
        Ok(packed.map(unpack_mapping))
    }

    pub fn lookup_reverse(&self, dev: DevId, pb: PBlock) -> Result<Option<OBlock>> {
        self.check_consistency()?;
        Ok(self.reverse_lookup(dev, pb)?.map(OBlock::new))
    }

    /// Update an existing mapping's flags without touching its pool block
    /// (spec §4.4: flipping DIRTY/UPTODATE on write-back and promotion).
    pub fn update(&self, dev: DevId, ob: OBlock, flags: MappingFlags) -> Result<()> {
        self.check_consistency()?;
        let old = self.forward_lookup(dev, ob)?.ok_or(CacheError::NotFound)?;
        let (pb, _) = unpack_mapping(old);
        self.forward_insert(dev, ob, pack_mapping(pb, flags))?;
        *self.have_inserted.write() = true;
        Ok(())
    }

    /// Drop every mapping belonging to `dev` in one step: removing its
    /// entry from each outer tree cascades the whole inner tree's free via
    /// [`RootPtr::on_delete`], rather than walking and removing mappings
    /// one at a time (open question resolved in DESIGN.md).
    pub fn delete(&self, dev: DevId) -> Result<()> {
        self.check_consistency()?;
        tracing::info!(dev, "deleting device mappings");
        {
            let mut forward_root = self.forward_root.write();
            if BTree::<RootPtr>::lookup(self.tm.cache(), *forward_root, dev)?.is_some() {
                *forward_root = BTree::<RootPtr>::remove(&self.tm, *forward_root, dev)?;
            }
        }
        {
            let mut reverse_root = self.reverse_root.write();
            if BTree::<RootPtr>::lookup(self.tm.cache(), *reverse_root, dev)?.is_some() {
                *reverse_root = BTree::<RootPtr>::remove(&self.tm, *reverse_root, dev)?;
            }
        }
        *self.have_inserted.write() = true;
        Ok(())
    }

    /// Flush every dirty block and write a fresh superblock. A no-op if
    /// nothing has changed since the last commit.
    pub fn commit(&self) -> Result<()> {
        self.check_consistency()?;
        if !*self.have_inserted.read() {
            return Ok(());
        }
        if let Err(e) = self.commit_inner() {
            tracing::warn!(error = %e, "commit failed, marking handle CONSISTENCY-FAIL");
            *self.consistency_failed.write() = Some(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    fn commit_inner(&self) -> Result<()> {
        self.tm.pre_commit()?;

        let sb = Superblock {
            metadata_nr_blocks: self.nr_metadata_blocks,
            data_block_size: self.data_block_size,
            data_nr_blocks: *self.nr_data_blocks.read(),
            first_free_block: *self.first_free_block.read(),
            forward_root: *self.forward_root.read(),
            reverse_root: *self.reverse_root.read(),
            space_map_root: self.tm.space_map().serialize_root(),
        };
        {
            let mut w = self
                .tm
                .write_lock(self.superblock_loc, Arc::new(CrcLocationValidator))?;
            sb.pack(&mut w[..superblock::SUPERBLOCK_BODY_LEN]);
        }
        self.tm.commit(self.superblock_loc)?;
        *self.have_inserted.write() = false;
        self.transaction_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("metadata commit complete");
        Ok(())
    }
}
