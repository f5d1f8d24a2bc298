//! On-disk superblock layout (spec §6): the single block whose write
//! commits a transaction, and the root of everything else — the space
//! map's own serialized root, and the forward/reverse map roots.

use crate::block::BlockId;
use crate::error::{CacheError, Result};
use crate::space_map::SERIALIZED_ROOT_LEN;

pub const SUPERBLOCK_MAGIC: u64 = 21_081_990;
pub const SUPERBLOCK_VERSION: u64 = 1;
pub const SUPERBLOCK_LOC: BlockId = 0;

/// One metadata block is 8 512-byte sectors (4096 bytes), fixed.
pub const METADATA_BLOCK_SIZE_SECTORS: u64 = 8;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_METADATA_BLOCK_SIZE: usize = 16;
const OFF_METADATA_NR_BLOCKS: usize = 24;
const OFF_DATA_BLOCK_SIZE: usize = 32;
const OFF_DATA_NR_BLOCKS: usize = 40;
const OFF_FIRST_FREE_BLOCK: usize = 48;
const OFF_FORWARD_ROOT: usize = 56;
const OFF_REVERSE_ROOT: usize = 64;
const OFF_SPACE_MAP_ROOT: usize = 72;
pub const SUPERBLOCK_BODY_LEN: usize = OFF_SPACE_MAP_ROOT + SERIALIZED_ROOT_LEN;

pub struct Superblock {
    pub metadata_nr_blocks: u64,
    pub data_block_size: u64,
    pub data_nr_blocks: u64,
    pub first_free_block: u64,
    pub forward_root: BlockId,
    pub reverse_root: BlockId,
    pub space_map_root: [u8; SERIALIZED_ROOT_LEN],
}

impl Superblock {
    pub fn pack(&self, out: &mut [u8]) {
        out[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        out[OFF_VERSION..OFF_VERSION + 8].copy_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
        out[OFF_METADATA_BLOCK_SIZE..OFF_METADATA_BLOCK_SIZE + 8]
            .copy_from_slice(&METADATA_BLOCK_SIZE_SECTORS.to_le_bytes());
        out[OFF_METADATA_NR_BLOCKS..OFF_METADATA_NR_BLOCKS + 8]
            .copy_from_slice(&self.metadata_nr_blocks.to_le_bytes());
        out[OFF_DATA_BLOCK_SIZE..OFF_DATA_BLOCK_SIZE + 8].copy_from_slice(&self.data_block_size.to_le_bytes());
        out[OFF_DATA_NR_BLOCKS..OFF_DATA_NR_BLOCKS + 8].copy_from_slice(&self.data_nr_blocks.to_le_bytes());
        out[OFF_FIRST_FREE_BLOCK..OFF_FIRST_FREE_BLOCK + 8].copy_from_slice(&self.first_free_block.to_le_bytes());
        out[OFF_FORWARD_ROOT..OFF_FORWARD_ROOT + 8].copy_from_slice(&self.forward_root.to_le_bytes());
        out[OFF_REVERSE_ROOT..OFF_REVERSE_ROOT + 8].copy_from_slice(&self.reverse_root.to_le_bytes());
        out[OFF_SPACE_MAP_ROOT..OFF_SPACE_MAP_ROOT + SERIALIZED_ROOT_LEN].copy_from_slice(&self.space_map_root);
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let magic = u64::from_le_bytes(data[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());
        if magic != SUPERBLOCK_MAGIC {
            return Err(CacheError::ConsistencyFail(format!(
                "bad superblock magic {magic}, expected {SUPERBLOCK_MAGIC}"
            )));
        }
        let version = u64::from_le_bytes(data[OFF_VERSION..OFF_VERSION + 8].try_into().unwrap());
        if version != SUPERBLOCK_VERSION {
            return Err(CacheError::ConsistencyFail(format!(
                "unsupported superblock version {version}"
            )));
        }
        Ok(Self {
            metadata_nr_blocks: u64::from_le_bytes(
                data[OFF_METADATA_NR_BLOCKS..OFF_METADATA_NR_BLOCKS + 8].try_into().unwrap(),
            ),
            data_block_size: u64::from_le_bytes(
                data[OFF_DATA_BLOCK_SIZE..OFF_DATA_BLOCK_SIZE + 8].try_into().unwrap(),
            ),
            data_nr_blocks: u64::from_le_bytes(data[OFF_DATA_NR_BLOCKS..OFF_DATA_NR_BLOCKS + 8].try_into().unwrap()),
            first_free_block: u64::from_le_bytes(
                data[OFF_FIRST_FREE_BLOCK..OFF_FIRST_FREE_BLOCK + 8].try_into().unwrap(),
            ),
            forward_root: u64::from_le_bytes(data[OFF_FORWARD_ROOT..OFF_FORWARD_ROOT + 8].try_into().unwrap()),
            reverse_root: u64::from_le_bytes(data[OFF_REVERSE_ROOT..OFF_REVERSE_ROOT + 8].try_into().unwrap()),
            space_map_root: data[OFF_SPACE_MAP_ROOT..OFF_SPACE_MAP_ROOT + SERIALIZED_ROOT_LEN]
                .try_into()
                .unwrap(),
        })
    }
}
