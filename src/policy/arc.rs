//! Adaptive replacement cache (spec §4.5): `T1`/`T2` hold live, cached
//! blocks (recently-used-once vs. frequently-used); `B1`/`B2` are ghost
//! lists remembering evicted keys so their ratio can drive the adaptive
//! target size `p`. A block seen for the very first time is filtered
//! through an "interesting blocks" set before admission, so a single
//! scan of cold data can't evict a genuinely hot working set (spec §9
//! open question, resolved: default capacity is half the cache).

use super::{Policy, PolicyResult, PolicyStats, RequestInfo};
use crate::block::{CBlock, OBlock};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListId {
    T1,
    T2,
    B1,
    B2,
}

struct State {
    t1: VecDeque<OBlock>,
    t2: VecDeque<OBlock>,
    b1: VecDeque<OBlock>,
    b2: VecDeque<OBlock>,
    cb_of: HashMap<OBlock, CBlock>,
    list_of: HashMap<OBlock, ListId>,
    free_cbs: VecDeque<CBlock>,
    p: u64,
    cache_size: u64,
    interesting: VecDeque<OBlock>,
    interesting_set: HashSet<OBlock>,
    interesting_cap: usize,
}

impl State {
    fn list_mut(&mut self, id: ListId) -> &mut VecDeque<OBlock> {
        match id {
            ListId::T1 => &mut self.t1,
            ListId::T2 => &mut self.t2,
            ListId::B1 => &mut self.b1,
            ListId::B2 => &mut self.b2,
        }
    }

    fn unlink(&mut self, ob: OBlock, id: ListId) {
        let q = self.list_mut(id);
        if let Some(pos) = q.iter().position(|&o| o == ob) {
            q.remove(pos);
        }
    }

    fn mark_interesting(&mut self, ob: OBlock) -> bool {
        if self.interesting_set.contains(&ob) {
            return true;
        }
        if self.interesting.len() >= self.interesting_cap {
            if let Some(old) = self.interesting.pop_back() {
                self.interesting_set.remove(&old);
            }
        }
        self.interesting.push_front(ob);
        self.interesting_set.insert(ob);
        false
    }

    fn forget_interesting(&mut self, ob: OBlock) {
        if self.interesting_set.remove(&ob) {
            if let Some(pos) = self.interesting.iter().position(|&o| o == ob) {
                self.interesting.remove(pos);
            }
        }
    }

    /// Pick a victim from `T1` or `T2` per the ARC replacement rule and
    /// demote it into the matching ghost list.
    fn replace(&mut self, hit_in_b2: bool) -> Option<(OBlock, CBlock)> {
        let take_from_t1 = !self.t1.is_empty() && (self.t1.len() as u64 > self.p || (hit_in_b2 && self.t1.len() as u64 == self.p));
        if take_from_t1 {
            let victim = self.t1.pop_back()?;
            let cb = self.cb_of.remove(&victim)?;
            self.list_of.insert(victim, ListId::B1);
            self.b1.push_front(victim);
            if self.b1.len() as u64 > self.cache_size {
                self.b1.pop_back();
            }
            Some((victim, cb))
        } else {
            let victim = self.t2.pop_back()?;
            let cb = self.cb_of.remove(&victim)?;
            self.list_of.insert(victim, ListId::B2);
            self.b2.push_front(victim);
            if self.b2.len() as u64 > self.cache_size {
                self.b2.pop_back();
            }
            Some((victim, cb))
        }
    }
}

pub struct ArcPolicy {
    state: Mutex<State>,
}

impl ArcPolicy {
    pub fn new(cache_size: u64) -> Self {
        Self {
            state: Mutex::new(State {
                t1: VecDeque::new(),
                t2: VecDeque::new(),
                b1: VecDeque::new(),
                b2: VecDeque::new(),
                cb_of: HashMap::new(),
                list_of: HashMap::new(),
                free_cbs: (0..cache_size).map(CBlock::new).collect(),
                p: 0,
                cache_size,
                interesting: VecDeque::new(),
                interesting_set: HashSet::new(),
                interesting_cap: (cache_size / 2).max(1) as usize,
            }),
        }
    }
}

impl Policy for ArcPolicy {
    fn map(&self, ob: OBlock, can_migrate: bool, discarded: bool, _info: RequestInfo) -> Result<PolicyResult> {
        let mut st = self.state.lock();

        match st.list_of.get(&ob).copied() {
            Some(ListId::T1) | Some(ListId::T2) => {
                st.unlink(ob, st.list_of[&ob]);
                st.list_of.insert(ob, ListId::T2);
                st.t2.push_front(ob);
                Ok(PolicyResult::Hit { cb: st.cb_of[&ob] })
            }
            Some(ListId::B1) => {
                let delta = (st.b2.len() as u64 / st.b1.len().max(1) as u64).max(1);
                st.p = (st.p + delta).min(st.cache_size);
                st.unlink(ob, ListId::B1);
                st.list_of.remove(&ob);
                if !can_migrate {
                    return Ok(PolicyResult::Miss);
                }
                match st.replace(false) {
                    Some((victim_ob, victim_cb)) => {
                        st.list_of.insert(ob, ListId::T2);
                        st.t2.push_front(ob);
                        st.cb_of.insert(ob, victim_cb);
                        Ok(PolicyResult::Replace { cb: victim_cb, old_ob: victim_ob })
                    }
                    None => Ok(PolicyResult::Miss),
                }
            }
            Some(ListId::B2) => {
                let delta = (st.b1.len() as u64 / st.b2.len().max(1) as u64).max(1);
                st.p = st.p.saturating_sub(delta);
                st.unlink(ob, ListId::B2);
                st.list_of.remove(&ob);
                if !can_migrate {
                    return Ok(PolicyResult::Miss);
                }
                match st.replace(true) {
                    Some((victim_ob, victim_cb)) => {
                        st.list_of.insert(ob, ListId::T2);
                        st.t2.push_front(ob);
                        st.cb_of.insert(ob, victim_cb);
                        Ok(PolicyResult::Replace { cb: victim_cb, old_ob: victim_ob })
                    }
                    None => Ok(PolicyResult::Miss),
                }
            }
            None => {
                if discarded {
                    return Ok(PolicyResult::Miss);
                }
                if !st.mark_interesting(ob) {
                    return Ok(PolicyResult::Miss);
                }
                if !can_migrate {
                    return Ok(PolicyResult::Miss);
                }
                st.forget_interesting(ob);
                if let Some(cb) = st.free_cbs.pop_front() {
                    st.list_of.insert(ob, ListId::T1);
                    st.t1.push_front(ob);
                    st.cb_of.insert(ob, cb);
                    Ok(PolicyResult::New { cb })
                } else {
                    match st.replace(false) {
                        Some((victim_ob, victim_cb)) => {
                            st.list_of.insert(ob, ListId::T1);
                            st.t1.push_front(ob);
                            st.cb_of.insert(ob, victim_cb);
                            Ok(PolicyResult::Replace { cb: victim_cb, old_ob: victim_ob })
                        }
                        None => Ok(PolicyResult::Miss),
                    }
                }
            }
        }
    }

    fn load_mapping(&self, ob: OBlock, cb: CBlock, hint: &[u8]) -> Result<()> {
        let mut st = self.state.lock();
        let in_t2 = hint.first().copied().unwrap_or(1) == 1;
        st.free_cbs.retain(|&c| c != cb);
        st.cb_of.insert(ob, cb);
        if in_t2 {
            st.list_of.insert(ob, ListId::T2);
            st.t2.push_front(ob);
        } else {
            st.list_of.insert(ob, ListId::T1);
            st.t1.push_front(ob);
        }
        Ok(())
    }

    fn walk_mappings(&self, f: &mut dyn FnMut(OBlock, CBlock, &[u8])) -> Result<()> {
        let st = self.state.lock();
        for (&ob, &cb) in st.cb_of.iter() {
            let in_t2 = matches!(st.list_of.get(&ob), Some(ListId::T2));
            f(ob, cb, &[in_t2 as u8]);
        }
        Ok(())
    }

    fn remove_mapping(&self, ob: OBlock) {
        let mut st = self.state.lock();
        if let Some(id) = st.list_of.remove(&ob) {
            st.unlink(ob, id);
        }
        if let Some(cb) = st.cb_of.remove(&ob) {
            st.free_cbs.push_back(cb);
        }
    }

    fn force_mapping(&self, cur_ob: OBlock, new_ob: OBlock) {
        let mut st = self.state.lock();
        if let Some(id) = st.list_of.remove(&cur_ob) {
            st.unlink(cur_ob, id);
            if let Some(cb) = st.cb_of.remove(&cur_ob) {
                st.cb_of.insert(new_ob, cb);
            }
            st.list_of.insert(new_ob, id);
            st.list_mut(id).push_front(new_ob);
        }
    }

    fn residency(&self) -> u64 {
        self.state.lock().cb_of.len() as u64
    }

    fn status(&self) -> PolicyStats {
        let st = self.state.lock();
        PolicyStats {
            residency: st.cb_of.len() as u64,
            ..Default::default()
        }
    }

    fn hint_size(&self) -> usize {
        1
    }

    fn name(&self) -> &'static str {
        "arc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> RequestInfo {
        RequestInfo::default()
    }

    #[test]
    fn first_sighting_is_filtered_then_admitted_on_second() {
        let p = ArcPolicy::new(4);
        let ob = OBlock::new(1);
        assert_eq!(p.map(ob, true, false, req()).unwrap(), PolicyResult::Miss);
        assert!(matches!(p.map(ob, true, false, req()).unwrap(), PolicyResult::New { .. }));
    }

    #[test]
    fn never_admits_without_migration_permission() {
        let p = ArcPolicy::new(1);
        let ob = OBlock::new(2);
        let _ = p.map(ob, false, false, req()).unwrap();
        let r = p.map(ob, false, false, req()).unwrap();
        assert!(!matches!(r, PolicyResult::New { .. } | PolicyResult::Replace { .. }));
    }

    #[test]
    fn hit_on_resident_block_returns_hit() {
        let p = ArcPolicy::new(4);
        let ob = OBlock::new(3);
        let _ = p.map(ob, true, false, req()).unwrap();
        let r = p.map(ob, true, false, req()).unwrap();
        let cb = match r {
            PolicyResult::New { cb } => cb,
            _ => panic!("expected admission"),
        };
        assert_eq!(p.map(ob, true, false, req()).unwrap(), PolicyResult::Hit { cb });
    }
}
