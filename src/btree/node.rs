//! On-disk B-tree node layout (spec §6).
//!
//! ```text
//! header:  flags:u32  nr_entries:u32  max_entries:u32  magic:u32
//! keys:    [u64; max_entries]                (only the first nr_entries valid)
//! values:  [u8;  max_entries * value_size]   (leaf values, or 8-byte child pointers)
//! trailer: location:u64  crc32c:u32          (written by CrcLocationValidator)
//! ```
//!
//! Internal nodes pair each key with an 8-byte child block pointer stored in
//! the same value slot a leaf would use for its `V`-typed value — the
//! `value_size` a caller passes in is 8 for internal nodes and `V::SIZE` for
//! leaves, but the layout code below never needs to otherwise distinguish
//! the two. An internal entry's key is the lowest key reachable through its
//! child, not a classic separator: child 0 holds everything below key 1.

use crate::block::BlockId;

pub const NODE_HEADER_LEN: usize = 16;
pub const NODE_TRAILER_LEN: usize = 12;
pub const NODE_MAGIC: u32 = 160_774;

const FLAG_LEAF: u32 = 1 << 0;

/// Compute the maximum number of entries a node of `block_size` bytes can
/// hold for a value of `value_size` bytes (8 for internal nodes).
pub fn max_entries_for(block_size: usize, value_size: usize) -> u32 {
    let available = block_size - NODE_HEADER_LEN - NODE_TRAILER_LEN;
    (available / (8 + value_size)) as u32
}

fn keys_offset() -> usize {
    NODE_HEADER_LEN
}

fn values_offset(max_entries: u32) -> usize {
    NODE_HEADER_LEN + max_entries as usize * 8
}

/// Read-only view over a node's body (everything before the trailer, which
/// the validator owns).
pub struct NodeRef<'a> {
    data: &'a [u8],
}

impl<'a> NodeRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & FLAG_LEAF != 0
    }

    fn flags(&self) -> u32 {
        u32::from_le_bytes(self.data[0..4].try_into().unwrap())
    }

    pub fn nr_entries(&self) -> u32 {
        u32::from_le_bytes(self.data[4..8].try_into().unwrap())
    }

    pub fn max_entries(&self) -> u32 {
        u32::from_le_bytes(self.data[8..12].try_into().unwrap())
    }

    pub fn magic(&self) -> u32 {
        u32::from_le_bytes(self.data[12..16].try_into().unwrap())
    }

    pub fn key(&self, i: usize) -> u64 {
        let off = keys_offset() + i * 8;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    /// Index of the first key `>= k`, in `[0, nr_entries]`.
    pub fn lower_bound(&self, k: u64) -> usize {
        let n = self.nr_entries() as usize;
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key(mid) < k {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// The child to descend into for `k`, under the "key = min key of
    /// child's subtree" convention. Child 0 holds everything below key 1,
    /// so a `k` below the node's own minimum still descends into child 0.
    pub fn descend_index(&self, k: u64) -> Option<usize> {
        if self.nr_entries() == 0 {
            return None;
        }
        let i = self.lower_bound(k);
        if i < self.nr_entries() as usize && self.key(i) == k {
            Some(i)
        } else if i == 0 {
            Some(0)
        } else {
            Some(i - 1)
        }
    }

    pub fn value_bytes(&self, i: usize, value_size: usize) -> &[u8] {
        let off = values_offset(self.max_entries()) + i * value_size;
        &self.data[off..off + value_size]
    }

    pub fn child(&self, i: usize) -> BlockId {
        let off = values_offset(self.max_entries()) + i * 8;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }
}

/// Mutable view over a node's body.
pub struct NodeRefMut<'a> {
    data: &'a mut [u8],
}

impl<'a> NodeRefMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn as_ref(&self) -> NodeRef<'_> {
        NodeRef::new(self.data)
    }

    pub fn init(&mut self, leaf: bool, max_entries: u32) {
        let flags = if leaf { FLAG_LEAF } else { 0 };
        self.data[0..4].copy_from_slice(&flags.to_le_bytes());
        self.data[4..8].copy_from_slice(&0u32.to_le_bytes());
        self.data[8..12].copy_from_slice(&max_entries.to_le_bytes());
        self.data[12..16].copy_from_slice(&NODE_MAGIC.to_le_bytes());
    }

    pub fn is_leaf(&self) -> bool {
        self.as_ref().is_leaf()
    }

    pub fn nr_entries(&self) -> u32 {
        self.as_ref().nr_entries()
    }

    pub fn max_entries(&self) -> u32 {
        self.as_ref().max_entries()
    }

    pub fn set_nr_entries(&mut self, n: u32) {
        self.data[4..8].copy_from_slice(&n.to_le_bytes());
    }

    fn set_key(&mut self, i: usize, k: u64) {
        let off = keys_offset() + i * 8;
        self.data[off..off + 8].copy_from_slice(&k.to_le_bytes());
    }

    fn set_value_bytes(&mut self, i: usize, value_size: usize, bytes: &[u8]) {
        let off = values_offset(self.max_entries()) + i * value_size;
        self.data[off..off + value_size].copy_from_slice(bytes);
    }

    pub fn set_child(&mut self, i: usize, b: BlockId) {
        self.set_value_bytes(i, 8, &b.to_le_bytes());
    }

    /// Shift `keys[from..nr)` and `values[from..nr)` right by one slot to
    /// make room for an insert at `from`.
    fn shift_right(&mut self, from: usize, value_size: usize) {
        let n = self.nr_entries() as usize;
        let koff = keys_offset();
        self.data.copy_within(koff + from * 8..koff + n * 8, koff + (from + 1) * 8);
        let voff = values_offset(self.max_entries());
        self.data.copy_within(
            voff + from * value_size..voff + n * value_size,
            voff + (from + 1) * value_size,
        );
    }

    /// Shift `keys[from+1..nr)` and `values[from+1..nr)` left by one slot,
    /// removing the entry at `from`.
    fn shift_left(&mut self, from: usize, value_size: usize) {
        let n = self.nr_entries() as usize;
        let koff = keys_offset();
        self.data.copy_within(koff + (from + 1) * 8..koff + n * 8, koff + from * 8);
        let voff = values_offset(self.max_entries());
        self.data.copy_within(
            voff + (from + 1) * value_size..voff + n * value_size,
            voff + from * value_size,
        );
    }

    /// Insert a single `(key, value)` entry at index `i`, shifting later
    /// entries right. `value.len()` is the caller's value size (8 for
    /// internal nodes, `V::SIZE` for leaves).
    pub fn insert_at(&mut self, i: usize, key: u64, value: &[u8]) {
        let n = self.nr_entries() as usize;
        self.shift_right(i, value.len());
        self.set_key(i, key);
        self.set_value_bytes(i, value.len(), value);
        self.set_nr_entries((n + 1) as u32);
    }

    pub fn remove_at(&mut self, i: usize, value_size: usize) {
        let n = self.nr_entries() as usize;
        self.shift_left(i, value_size);
        self.set_nr_entries((n - 1) as u32);
    }

    pub fn set_value_at(&mut self, i: usize, value_size: usize, value: &[u8]) {
        self.set_value_bytes(i, value_size, value);
    }

    /// Append already-encoded `(key, value)` pairs starting at the current
    /// `nr_entries`. Used when redistributing or merging siblings.
    pub fn append_entries(&mut self, keys: &[u64], values: &[Vec<u8>]) {
        let mut n = self.nr_entries() as usize;
        for (k, v) in keys.iter().zip(values.iter()) {
            self.set_key(n, *k);
            self.set_value_bytes(n, v.len(), v);
            n += 1;
        }
        self.set_nr_entries(n as u32);
    }

    pub fn truncate(&mut self, new_len: u32) {
        self.set_nr_entries(new_len);
    }
}
