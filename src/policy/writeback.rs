//! The `writeback` policy: admission is driven entirely by the caller
//! (via `load_mapping`/`force_mapping`) rather than by `map` itself — it
//! never returns `New`/`Replace`. It exists to give a terminal policy
//! with dirty-block tracking to stack shims in front of (spec §4.5, §6
//! glossary: "Hintless shim").
//!
//! LRU bookkeeping mirrors the teacher's `BlockCache` touch/evict
//! pattern: front of the deque is most-recently-touched, eviction/scan
//! candidates are found from the back.

use super::{Policy, PolicyResult, PolicyStats, RequestInfo};
use crate::block::{CBlock, OBlock};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

struct Entry {
    cb: CBlock,
    dirty: bool,
}

struct State {
    order: VecDeque<OBlock>,
    entries: HashMap<OBlock, Entry>,
    cb_to_ob: HashMap<CBlock, OBlock>,
    nr_dirty: u64,
}

impl State {
    fn touch(&mut self, ob: OBlock) {
        if let Some(pos) = self.order.iter().position(|&o| o == ob) {
            self.order.remove(pos);
        }
        self.order.push_front(ob);
    }

    fn unlink(&mut self, ob: OBlock) {
        if let Some(pos) = self.order.iter().position(|&o| o == ob) {
            self.order.remove(pos);
        }
    }
}

pub struct WritebackPolicy {
    state: Mutex<State>,
}

impl WritebackPolicy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                entries: HashMap::new(),
                cb_to_ob: HashMap::new(),
                nr_dirty: 0,
            }),
        }
    }
}

impl Default for WritebackPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for WritebackPolicy {
    fn map(&self, ob: OBlock, _can_migrate: bool, _discarded: bool, _info: RequestInfo) -> Result<PolicyResult> {
        let mut st = self.state.lock();
        if let Some(e) = st.entries.get(&ob) {
            let cb = e.cb;
            st.touch(ob);
            Ok(PolicyResult::Hit { cb })
        } else {
            Ok(PolicyResult::Miss)
        }
    }

    fn load_mapping(&self, ob: OBlock, cb: CBlock, _hint: &[u8]) -> Result<()> {
        let mut st = self.state.lock();
        st.entries.insert(ob, Entry { cb, dirty: false });
        st.cb_to_ob.insert(cb, ob);
        st.order.push_front(ob);
        Ok(())
    }

    fn walk_mappings(&self, f: &mut dyn FnMut(OBlock, CBlock, &[u8])) -> Result<()> {
        let st = self.state.lock();
        for (&ob, e) in st.entries.iter() {
            f(ob, e.cb, &[]);
        }
        Ok(())
    }

    fn remove_mapping(&self, ob: OBlock) {
        let mut st = self.state.lock();
        if let Some(e) = st.entries.remove(&ob) {
            st.cb_to_ob.remove(&e.cb);
            if e.dirty {
                st.nr_dirty -= 1;
            }
        }
        st.unlink(ob);
    }

    fn force_mapping(&self, cur_ob: OBlock, new_ob: OBlock) {
        let mut st = self.state.lock();
        if let Some(e) = st.entries.remove(&cur_ob) {
            st.unlink(cur_ob);
            st.cb_to_ob.insert(e.cb, new_ob);
            let cb = e.cb;
            let dirty = e.dirty;
            st.entries.insert(new_ob, Entry { cb, dirty });
            st.order.push_front(new_ob);
        }
    }

    fn residency(&self) -> u64 {
        self.state.lock().entries.len() as u64
    }

    fn status(&self) -> PolicyStats {
        let st = self.state.lock();
        PolicyStats {
            residency: st.entries.len() as u64,
            nr_dirty: st.nr_dirty,
            ..Default::default()
        }
    }

    fn set_dirty(&self, cb: CBlock) {
        let mut st = self.state.lock();
        if let Some(&ob) = st.cb_to_ob.get(&cb) {
            if let Some(e) = st.entries.get_mut(&ob) {
                if !e.dirty {
                    e.dirty = true;
                    st.nr_dirty += 1;
                }
            }
        }
    }

    fn clear_dirty(&self, cb: CBlock) {
        let mut st = self.state.lock();
        if let Some(&ob) = st.cb_to_ob.get(&cb) {
            if let Some(e) = st.entries.get_mut(&ob) {
                if e.dirty {
                    e.dirty = false;
                    st.nr_dirty -= 1;
                }
            }
        }
    }

    fn writeback_work(&self) -> Option<(OBlock, CBlock)> {
        let mut st = self.state.lock();
        let candidate = st
            .order
            .iter()
            .rev()
            .find(|ob| st.entries.get(ob).map(|e| e.dirty).unwrap_or(false))
            .copied()?;
        let cb = st.entries.get(&candidate)?.cb;
        st.touch(candidate);
        Some((candidate, cb))
    }

    fn hint_size(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "writeback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_mapping_is_a_miss_until_loaded() {
        let p = WritebackPolicy::new();
        let ob = OBlock::new(7);
        assert_eq!(p.map(ob, true, false, RequestInfo::default()).unwrap(), PolicyResult::Miss);
        p.load_mapping(ob, CBlock::new(3), &[]).unwrap();
        assert_eq!(
            p.map(ob, true, false, RequestInfo::default()).unwrap(),
            PolicyResult::Hit { cb: CBlock::new(3) }
        );
    }

    #[test]
    fn writeback_work_only_surfaces_dirty_entries() {
        let p = WritebackPolicy::new();
        let ob = OBlock::new(1);
        let cb = CBlock::new(1);
        p.load_mapping(ob, cb, &[]).unwrap();
        assert!(p.writeback_work().is_none());
        p.set_dirty(cb);
        assert_eq!(p.writeback_work(), Some((ob, cb)));
        p.clear_dirty(cb);
        assert!(p.writeback_work().is_none());
    }

    #[test]
    fn remove_mapping_drops_dirty_accounting() {
        let p = WritebackPolicy::new();
        let ob = OBlock::new(2);
        let cb = CBlock::new(2);
        p.load_mapping(ob, cb, &[]).unwrap();
        p.set_dirty(cb);
        p.remove_mapping(ob);
        assert_eq!(p.status().nr_dirty, 0);
        assert_eq!(p.residency(), 0);
    }
}
