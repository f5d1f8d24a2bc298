//! L0 — the buffered block I/O cache (spec §2, §4, external collaborator
//! modeled concretely so the layers above it are testable; see
//! `SPEC_FULL.md` §2).

pub mod cache;
pub mod checksum;

pub use cache::{BlockCache, ReadGuard, WriteGuard, DEFAULT_CACHE_CAPACITY};
pub use checksum::{crc32c, CrcLocationValidator, NullValidator, Validator};
