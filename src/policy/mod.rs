//! L5: the cache-replacement policy interface (spec §4.5) and its three
//! concrete implementations, plus stack composition.
//!
//! Every method here is a hard non-blocking contract: no disk I/O, no lock
//! that could be held across a suspension point, no allocation on the
//! `map` hot path once a policy's arena is warm. The cache core is the
//! only caller; it never blocks waiting on a policy.
//!
//! Grounded in the teacher's `buffer/eviction.rs` `EvictionPolicy` trait —
//! same shape (a small required surface, generously defaulted optional
//! capabilities, a `name()`/`stats()` pair) generalized from "pick a
//! victim frame" to "decide hit/miss/admit/replace for one origin block".

pub mod arc;
pub mod mq;
pub mod stack;
pub mod writeback;

use crate::block::{CBlock, OBlock};
use crate::error::Result;

/// Outcome of [`Policy::map`] (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyResult {
    /// `ob` is already cached at `cb`; remap the request there.
    Hit { cb: CBlock },
    /// `ob` lives only on the origin; carry on without remapping.
    Miss,
    /// `ob` should be admitted into the free block `cb`: quiesce further
    /// I/O to `ob`, copy origin -> cache, then remap.
    New { cb: CBlock },
    /// As `New`, but `cb` currently holds a (possibly dirty) mapping for
    /// `old_ob` that must be written back and evicted first.
    Replace { cb: CBlock, old_ob: OBlock },
}

/// Per-request context a policy may use for stream classification (spec
/// §4.5's multiqueue sequential-stream detection is the only consumer
/// today, but the shape is policy-agnostic).
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestInfo {
    pub write: bool,
    /// Sector offset of this request, for adjacency-based sequential
    /// stream detection.
    pub sector: u64,
}

/// Point-in-time counters for `status()`/observability (SPEC_FULL §4:
/// status-line rendering beyond the bare `<free> <used> <dirty>` tuple).
#[derive(Debug, Clone, Default)]
pub struct PolicyStats {
    pub residency: u64,
    pub nr_dirty: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Uniform contract every cache-replacement policy implements (spec
/// §4.5). Modeled as a capability variant: a policy that isn't
/// writeback-capable simply inherits the no-op defaults for
/// `set_dirty`/`clear_dirty`/`writeback_work`.
pub trait Policy: Send + Sync {
    /// Decide what to do with a request against `ob`. Must never return
    /// `New`/`Replace` when `can_migrate` is false (spec §8 invariant 7).
    fn map(&self, ob: OBlock, can_migrate: bool, discarded: bool, info: RequestInfo) -> Result<PolicyResult>;

    /// Replay a persisted mapping at startup.
    fn load_mapping(&self, ob: OBlock, cb: CBlock, hint: &[u8]) -> Result<()>;

    /// Enumerate every live `(ob, cb, hint)` triple for persistence.
    fn walk_mappings(&self, f: &mut dyn FnMut(OBlock, CBlock, &[u8])) -> Result<()>;

    /// Roll back a `New`/`Replace` the core declined to carry out.
    /// Contractually infallible (spec §4.5).
    fn remove_mapping(&self, ob: OBlock);

    /// Re-key a live mapping from `cur_ob` to `new_ob`. Contractually
    /// infallible.
    fn force_mapping(&self, cur_ob: OBlock, new_ob: OBlock);

    fn residency(&self) -> u64;

    /// Advance the policy's notion of time by one scheduling pass (spec
    /// §4.5, SPEC_FULL §4: wired once per worker-task iteration).
    fn tick(&self) {}

    fn status(&self) -> PolicyStats {
        PolicyStats::default()
    }

    fn message(&self, _args: &[&str]) -> Result<Option<String>> {
        Ok(None)
    }

    /// No-op unless the policy is writeback-capable.
    fn set_dirty(&self, _cb: CBlock) {}
    fn clear_dirty(&self, _cb: CBlock) {}

    /// `None` unless the policy is writeback-capable.
    fn writeback_work(&self) -> Option<(OBlock, CBlock)> {
        None
    }

    /// Per-entry persisted hint size in bytes; zero for a hintless policy
    /// (spec §6 glossary: "Hintless shim").
    fn hint_size(&self) -> usize {
        0
    }

    fn version(&self) -> [u32; 3] {
        [1, 0, 0]
    }

    fn name(&self) -> &'static str;
}
