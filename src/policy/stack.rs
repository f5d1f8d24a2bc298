//! Policy stack composition (spec §4.5, §6): a chain of shim policies
//! wrapping one terminal policy. Every call dispatches straight through
//! to the terminal; the shims above it only contribute to the
//! stack's composite name, version, and persisted hint size, the same
//! way `dm-cache`'s hintless shims are invisible on disk but still
//! present in the reported policy name.

use super::{Policy, PolicyResult, PolicyStats, RequestInfo};
use crate::block::{CBlock, OBlock};
use crate::error::Result;
use std::sync::Arc;

/// One named link in the chain. Only the last segment is the terminal
/// policy that actually owns state; earlier segments are informational
/// shims (spec §6 glossary: "Hintless shim" — a shim contributing no
/// bytes per entry is skipped from the canonical name, except when it
/// is itself terminal).
pub struct PolicyStack {
    segments: Vec<(&'static str, Arc<dyn Policy>)>,
}

impl PolicyStack {
    pub fn new(segments: Vec<(&'static str, Arc<dyn Policy>)>) -> Self {
        assert!(!segments.is_empty(), "a policy stack needs at least one terminal policy");
        Self { segments }
    }

    fn terminal(&self) -> &Arc<dyn Policy> {
        &self.segments.last().unwrap().1
    }

    /// Concatenation of segment names, skipping non-terminal shims with
    /// no persisted hint (spec §8 scenario S6).
    pub fn canonical_name(&self) -> String {
        let last = self.segments.len() - 1;
        self.segments
            .iter()
            .enumerate()
            .filter(|(i, (_, p))| *i == last || p.hint_size() > 0)
            .map(|(_, (name, _))| *name)
            .collect()
    }

    pub fn canonical_version(&self) -> [u32; 3] {
        let last = self.segments.len() - 1;
        self.segments
            .iter()
            .enumerate()
            .filter(|(i, (_, p))| *i == last || p.hint_size() > 0)
            .fold([0u32, 0, 0], |mut acc, (_, (_, p))| {
                let v = p.version();
                for i in 0..3 {
                    acc[i] += v[i];
                }
                acc
            })
    }
}

impl Policy for PolicyStack {
    fn map(&self, ob: OBlock, can_migrate: bool, discarded: bool, info: RequestInfo) -> Result<PolicyResult> {
        self.terminal().map(ob, can_migrate, discarded, info)
    }

    fn load_mapping(&self, ob: OBlock, cb: CBlock, hint: &[u8]) -> Result<()> {
        self.terminal().load_mapping(ob, cb, hint)
    }

    fn walk_mappings(&self, f: &mut dyn FnMut(OBlock, CBlock, &[u8])) -> Result<()> {
        self.terminal().walk_mappings(f)
    }

    fn remove_mapping(&self, ob: OBlock) {
        self.terminal().remove_mapping(ob)
    }

    fn force_mapping(&self, cur_ob: OBlock, new_ob: OBlock) {
        self.terminal().force_mapping(cur_ob, new_ob)
    }

    fn residency(&self) -> u64 {
        self.terminal().residency()
    }

    fn tick(&self) {
        self.terminal().tick()
    }

    fn status(&self) -> PolicyStats {
        self.terminal().status()
    }

    fn message(&self, args: &[&str]) -> Result<Option<String>> {
        self.terminal().message(args)
    }

    fn set_dirty(&self, cb: CBlock) {
        self.terminal().set_dirty(cb)
    }

    fn clear_dirty(&self, cb: CBlock) {
        self.terminal().clear_dirty(cb)
    }

    fn writeback_work(&self) -> Option<(OBlock, CBlock)> {
        self.terminal().writeback_work()
    }

    fn hint_size(&self) -> usize {
        self.segments.iter().map(|(_, p)| p.hint_size()).sum()
    }

    fn version(&self) -> [u32; 3] {
        self.canonical_version()
    }

    fn name(&self) -> &'static str {
        self.terminal().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::mq::MqPolicy;
    use crate::policy::writeback::WritebackPolicy;

    struct Hintless(Arc<dyn Policy>);
    impl Policy for Hintless {
        fn map(&self, ob: OBlock, can_migrate: bool, discarded: bool, info: RequestInfo) -> Result<PolicyResult> {
            self.0.map(ob, can_migrate, discarded, info)
        }
        fn load_mapping(&self, ob: OBlock, cb: CBlock, hint: &[u8]) -> Result<()> {
            self.0.load_mapping(ob, cb, hint)
        }
        fn walk_mappings(&self, f: &mut dyn FnMut(OBlock, CBlock, &[u8])) -> Result<()> {
            self.0.walk_mappings(f)
        }
        fn remove_mapping(&self, ob: OBlock) {
            self.0.remove_mapping(ob)
        }
        fn force_mapping(&self, cur_ob: OBlock, new_ob: OBlock) {
            self.0.force_mapping(cur_ob, new_ob)
        }
        fn residency(&self) -> u64 {
            self.0.residency()
        }
        fn name(&self) -> &'static str {
            "trace"
        }
    }

    #[test]
    fn hintless_non_terminal_shim_is_skipped_from_canonical_name() {
        let terminal: Arc<dyn Policy> = Arc::new(MqPolicy::new(8));
        let trace: Arc<dyn Policy> = Arc::new(Hintless(Arc::new(WritebackPolicy::new())));
        let stack = PolicyStack::new(vec![("trace", trace), ("mq", terminal)]);
        assert_eq!(stack.canonical_name(), "mq");
    }

    #[test]
    fn terminal_is_always_kept_even_if_hintless() {
        let terminal: Arc<dyn Policy> = Arc::new(WritebackPolicy::new());
        let stack = PolicyStack::new(vec![("writeback", terminal)]);
        assert_eq!(stack.canonical_name(), "writeback");
    }
}
