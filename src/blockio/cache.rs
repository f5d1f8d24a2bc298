//! L0: the buffered block I/O cache.
//!
//! This stands in for the external, host-provided block layer described in
//! spec.md §2 (L0): fixed-size block read/write, a bounded warm set, and a
//! keyed reader/writer lock per block. Everything above this module (the
//! space map, transaction manager, B-tree, HSM metadata) only ever talks to
//! a device through this cache.
//!
//! Grounded in the teacher's `storage/disk.rs` + `storage/buffer.rs` split:
//! a `Device` does raw file I/O, a `BlockCache` in front of it does
//! pinning/eviction, mirroring `DiskManager` / `BufferPoolManager`.

use crate::block::BlockId;
use crate::blockio::checksum::Validator;
use crate::error::{CacheError, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Raw fixed-block-size file-backed device.
struct Device {
    file: File,
    block_size: usize,
}

impl Device {
    fn open(path: &Path, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file, block_size })
    }

    fn read_block(&mut self, loc: BlockId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        let offset = loc * self.block_size as u64;
        let len = self.file.metadata()?.len();
        if offset >= len {
            // Never-written block reads as zeroed.
            return Ok(buf);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(buf),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    fn write_block(&mut self, loc: BlockId, data: &[u8]) -> Result<()> {
        let offset = loc * self.block_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Default warm-set capacity (spec §6: 128 metadata blocks).
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

struct Entry {
    block: Arc<RwLock<Vec<u8>>>,
    dirty: Arc<RwLock<bool>>,
}

/// The L0 block cache: a bounded, LRU-evicted set of block buffers backed by
/// a single file, each individually lockable.
pub struct BlockCache {
    device: Arc<RwLock<Device>>,
    pub block_size: usize,
    capacity: usize,
    entries: RwLock<HashMap<BlockId, Entry>>,
    lru: RwLock<VecDeque<BlockId>>,
}

impl BlockCache {
    pub fn open(path: &Path, block_size: usize, capacity: usize) -> Result<Self> {
        let device = Device::open(path, block_size)?;
        Ok(Self {
            device: Arc::new(RwLock::new(device)),
            block_size,
            capacity,
            entries: RwLock::new(HashMap::new()),
            lru: RwLock::new(VecDeque::new()),
        })
    }

    fn touch(&self, loc: BlockId) {
        let mut lru = self.lru.write();
        lru.retain(|&b| b != loc);
        lru.push_front(loc);
    }

    /// Ensure `loc` is resident, loading from disk on a miss. Returns the
    /// shared buffer handle.
    fn resident(&self, loc: BlockId) -> Result<Arc<RwLock<Vec<u8>>>> {
        if let Some(e) = self.entries.read().get(&loc) {
            self.touch(loc);
            return Ok(e.block.clone());
        }

        let data = self.device.write().read_block(loc)?;
        self.evict_if_needed();

        let mut entries = self.entries.write();
        let entry = entries.entry(loc).or_insert_with(|| Entry {
            block: Arc::new(RwLock::new(data)),
            dirty: Arc::new(RwLock::new(false)),
        });
        self.touch(loc);
        Ok(entry.block.clone())
    }

    fn evict_if_needed(&self) {
        loop {
            if self.entries.read().len() < self.capacity {
                return;
            }
            let victim = {
                let lru = self.lru.read();
                lru.iter().rev().copied().find(|loc| {
                    self.entries
                        .read()
                        .get(loc)
                        .map(|e| !*e.dirty.read())
                        .unwrap_or(false)
                })
            };
            match victim {
                Some(loc) => {
                    self.entries.write().remove(&loc);
                    self.lru.write().retain(|&b| b != loc);
                }
                // Every resident block is dirty; grow rather than stall.
                None => return,
            }
        }
    }

    /// Allocate a zeroed in-cache block without touching disk. Caller must
    /// fill it before releasing the write lock (no-read-before-write).
    pub fn new_block(&self, loc: BlockId) -> Result<()> {
        self.evict_if_needed();
        let mut entries = self.entries.write();
        entries.insert(
            loc,
            Entry {
                block: Arc::new(RwLock::new(vec![0u8; self.block_size])),
                dirty: Arc::new(RwLock::new(true)),
            },
        );
        drop(entries);
        self.touch(loc);
        Ok(())
    }

    pub fn read_lock(&self, loc: BlockId, validator: &dyn Validator) -> Result<ReadGuard> {
        let buf = self.resident(loc)?;
        let guard = buf.read_arc();
        validator.check(loc, &guard)?;
        Ok(ReadGuard { guard })
    }

    pub fn write_lock(&self, loc: BlockId, validator: Arc<dyn Validator>) -> Result<WriteGuard> {
        let buf = self.resident(loc)?;
        let dirty = self.dirty_flag(loc);
        let guard = buf.write_arc();
        Ok(WriteGuard {
            loc,
            guard,
            dirty,
            validator,
        })
    }

    pub fn try_read_lock(&self, loc: BlockId, validator: &dyn Validator) -> Result<ReadGuard> {
        if !self.entries.read().contains_key(&loc) {
            // A non-resident block requires disk I/O, which the
            // non-blocking path is not allowed to perform.
            return Err(CacheError::WouldBlock);
        }
        let buf = self.resident(loc)?;
        match buf.try_read_arc() {
            Some(guard) => {
                validator.check(loc, &guard)?;
                Ok(ReadGuard { guard })
            }
            None => Err(CacheError::WouldBlock),
        }
    }

    pub fn try_write_lock(&self, loc: BlockId, validator: Arc<dyn Validator>) -> Result<WriteGuard> {
        if !self.entries.read().contains_key(&loc) {
            return Err(CacheError::WouldBlock);
        }
        let buf = self.resident(loc)?;
        let dirty = self.dirty_flag(loc);
        match buf.try_write_arc() {
            Some(guard) => Ok(WriteGuard {
                loc,
                guard,
                dirty,
                validator,
            }),
            None => Err(CacheError::WouldBlock),
        }
    }

    fn dirty_flag(&self, loc: BlockId) -> Arc<RwLock<bool>> {
        self.entries
            .read()
            .get(&loc)
            .expect("resident() just inserted this entry")
            .dirty
            .clone()
    }

    /// Flush every dirty block to disk and fsync. Called from
    /// `TransactionManager::pre_commit`.
    pub fn flush_all(&self) -> Result<()> {
        let dirty_locs: Vec<BlockId> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| *e.dirty.read())
            .map(|(loc, _)| *loc)
            .collect();

        for loc in dirty_locs {
            let (block, dirty) = {
                let entries = self.entries.read();
                let e = entries.get(&loc).unwrap();
                (e.block.clone(), e.dirty.clone())
            };
            let data = block.read();
            self.device.write().write_block(loc, &data)?;
            *dirty.write() = false;
        }
        self.device.write().sync()?;
        Ok(())
    }

    /// Write and sync a single block immediately; used for the superblock,
    /// which must be the last write of a commit (spec §4.1).
    pub fn flush_one(&self, loc: BlockId) -> Result<()> {
        let (block, dirty) = {
            let entries = self.entries.read();
            match entries.get(&loc) {
                Some(e) => (e.block.clone(), e.dirty.clone()),
                None => return Ok(()),
            }
        };
        let data = block.read();
        self.device.write().write_block(loc, &data)?;
        self.device.write().sync()?;
        *dirty.write() = false;
        Ok(())
    }
}

pub struct ReadGuard {
    guard: parking_lot::ArcRwLockReadGuard<parking_lot::RawRwLock, Vec<u8>>,
}

impl std::ops::Deref for ReadGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

pub struct WriteGuard {
    loc: BlockId,
    guard: parking_lot::ArcRwLockWriteGuard<parking_lot::RawRwLock, Vec<u8>>,
    dirty: Arc<RwLock<bool>>,
    validator: Arc<dyn Validator>,
}

impl std::ops::Deref for WriteGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for WriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.validator.prepare_for_write(self.loc, &mut self.guard);
        *self.dirty.write() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockio::checksum::NullValidator;
    use tempfile::tempdir;

    #[test]
    fn new_block_roundtrips_through_write_and_read() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::open(&dir.path().join("dev"), 64, 4).unwrap();
        cache.new_block(0).unwrap();
        {
            let mut w = cache.write_lock(0, Arc::new(NullValidator)).unwrap();
            w[0..4].copy_from_slice(b"ABCD");
        }
        let r = cache.read_lock(0, &NullValidator).unwrap();
        assert_eq!(&r[0..4], b"ABCD");
    }

    #[test]
    fn flush_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");
        {
            let cache = BlockCache::open(&path, 64, 4).unwrap();
            cache.new_block(0).unwrap();
            {
                let mut w = cache.write_lock(0, Arc::new(NullValidator)).unwrap();
                w[0..4].copy_from_slice(b"WXYZ");
            }
            cache.flush_all().unwrap();
        }
        {
            let cache = BlockCache::open(&path, 64, 4).unwrap();
            let r = cache.read_lock(0, &NullValidator).unwrap();
            assert_eq!(&r[0..4], b"WXYZ");
        }
    }

    #[test]
    fn try_read_lock_on_non_resident_would_block() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::open(&dir.path().join("dev"), 64, 4).unwrap();
        let err = cache.try_read_lock(5, &NullValidator).unwrap_err();
        assert!(matches!(err, CacheError::WouldBlock));
    }
}
