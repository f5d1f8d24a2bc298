//! The `mq` (multiqueue) policy (spec §4.5): two 16-level queues,
//! `pre_cache` for observed-but-not-yet-admitted blocks and `cache` for
//! admitted ones. A block is promoted from `pre_cache` to `cache` once
//! its hit count crosses [`PROMOTE_THRESHOLD`]; every [`DEMOTE_PERIOD`]
//! hits, every entry's level drops by one so a block that stops being
//! hit eventually falls back out. Detected sequential streams bypass the
//! cache entirely, mirroring the teacher's stream-aware admission intent
//! in `buffer/eviction.rs` generalized from per-frame recency to
//! per-block level tracking.

use super::{Policy, PolicyResult, PolicyStats, RequestInfo};
use crate::block::{CBlock, OBlock};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

const NR_QUEUE_LEVELS: usize = 16;
const PROMOTE_THRESHOLD: u32 = 128;
const DEMOTE_PERIOD: u64 = 1 << 16;
const SEQUENTIAL_THRESHOLD: u32 = 512;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Home {
    PreCache,
    Cache,
}

struct Entry {
    home: Home,
    cb: Option<CBlock>,
    level: usize,
    hit_count: u32,
}

struct State {
    pre_cache: Vec<VecDeque<OBlock>>,
    cache: Vec<VecDeque<OBlock>>,
    entries: HashMap<OBlock, Entry>,
    cb_to_ob: HashMap<CBlock, OBlock>,
    free_cbs: VecDeque<CBlock>,
    total_hits: u64,
    last_demote_at: u64,
    last_sector: Option<u64>,
    nr_seq_samples: u32,
}

fn level_for_hits(hit_count: u32) -> usize {
    (32 - hit_count.max(1).leading_zeros() as usize - 1).min(NR_QUEUE_LEVELS - 1)
}

impl State {
    fn queue_mut(&mut self, home: Home, level: usize) -> &mut VecDeque<OBlock> {
        match home {
            Home::PreCache => &mut self.pre_cache[level],
            Home::Cache => &mut self.cache[level],
        }
    }

    fn unlink(&mut self, ob: OBlock, home: Home, level: usize) {
        let q = self.queue_mut(home, level);
        if let Some(pos) = q.iter().position(|&o| o == ob) {
            q.remove(pos);
        }
    }

    fn record_hit(&mut self, ob: OBlock) {
        let (home, old_level, new_level) = {
            let e = self.entries.get_mut(&ob).unwrap();
            e.hit_count += 1;
            let new_level = level_for_hits(e.hit_count);
            let old_level = e.level;
            e.level = new_level;
            (e.home, old_level, new_level)
        };
        if new_level != old_level {
            self.unlink(ob, home, old_level);
            self.queue_mut(home, new_level).push_front(ob);
        }
        self.total_hits += 1;
        if self.total_hits - self.last_demote_at >= DEMOTE_PERIOD {
            self.demote_all();
            self.last_demote_at = self.total_hits;
        }
    }

    fn demote_all(&mut self) {
        for home in [Home::PreCache, Home::Cache] {
            for level in (1..NR_QUEUE_LEVELS).rev() {
                let obs: Vec<OBlock> = {
                    let q = self.queue_mut(home, level);
                    q.drain(..).collect()
                };
                for ob in obs {
                    if let Some(e) = self.entries.get_mut(&ob) {
                        e.level = level - 1;
                    }
                    self.queue_mut(home, level - 1).push_back(ob);
                }
            }
        }
    }

    /// Evict the lowest-level entry currently admitted to `cache`.
    fn evict_from_cache(&mut self) -> Option<(OBlock, CBlock)> {
        for level in 0..NR_QUEUE_LEVELS {
            if let Some(victim) = self.cache[level].pop_back() {
                let e = self.entries.get_mut(&victim).unwrap();
                let cb = e.cb.take().unwrap();
                e.home = Home::PreCache;
                self.cb_to_ob.remove(&cb);
                self.pre_cache[e.level].push_front(victim);
                return Some((victim, cb));
            }
        }
        None
    }
}

pub struct MqPolicy {
    state: Mutex<State>,
}

impl MqPolicy {
    pub fn new(cache_size: u64) -> Self {
        Self {
            state: Mutex::new(State {
                pre_cache: (0..NR_QUEUE_LEVELS).map(|_| VecDeque::new()).collect(),
                cache: (0..NR_QUEUE_LEVELS).map(|_| VecDeque::new()).collect(),
                entries: HashMap::new(),
                cb_to_ob: HashMap::new(),
                free_cbs: (0..cache_size).map(CBlock::new).collect(),
                total_hits: 0,
                last_demote_at: 0,
                last_sector: None,
                nr_seq_samples: 0,
            }),
        }
    }
}

impl Policy for MqPolicy {
    fn map(&self, ob: OBlock, can_migrate: bool, discarded: bool, info: RequestInfo) -> Result<PolicyResult> {
        let mut st = self.state.lock();

        match st.last_sector {
            Some(s) if s + 1 == info.sector => st.nr_seq_samples += 1,
            _ => st.nr_seq_samples = 0,
        }
        st.last_sector = Some(info.sector);
        let sequential = st.nr_seq_samples >= SEQUENTIAL_THRESHOLD;

        if discarded || sequential {
            return Ok(PolicyResult::Miss);
        }

        if !st.entries.contains_key(&ob) {
            let level = 0;
            st.entries.insert(
                ob,
                Entry {
                    home: Home::PreCache,
                    cb: None,
                    level,
                    hit_count: 1,
                },
            );
            st.pre_cache[level].push_front(ob);
            return Ok(PolicyResult::Miss);
        }

        st.record_hit(ob);
        let (home, cb, hit_count) = {
            let e = &st.entries[&ob];
            (e.home, e.cb, e.hit_count)
        };

        if home == Home::Cache {
            return Ok(PolicyResult::Hit { cb: cb.unwrap() });
        }

        if !can_migrate || hit_count < PROMOTE_THRESHOLD {
            return Ok(PolicyResult::Miss);
        }

        if let Some(free_cb) = st.free_cbs.pop_front() {
            let level = st.entries[&ob].level;
            st.unlink(ob, Home::PreCache, level);
            let e = st.entries.get_mut(&ob).unwrap();
            e.home = Home::Cache;
            e.cb = Some(free_cb);
            st.cache[level].push_front(ob);
            st.cb_to_ob.insert(free_cb, ob);
            return Ok(PolicyResult::New { cb: free_cb });
        }

        match st.evict_from_cache() {
            Some((victim_ob, victim_cb)) => {
                let level = st.entries[&ob].level;
                st.unlink(ob, Home::PreCache, level);
                let e = st.entries.get_mut(&ob).unwrap();
                e.home = Home::Cache;
                e.cb = Some(victim_cb);
                st.cache[level].push_front(ob);
                st.cb_to_ob.insert(victim_cb, ob);
                Ok(PolicyResult::Replace { cb: victim_cb, old_ob: victim_ob })
            }
            None => Ok(PolicyResult::Miss),
        }
    }

    fn load_mapping(&self, ob: OBlock, cb: CBlock, hint: &[u8]) -> Result<()> {
        let mut st = self.state.lock();
        let (hit_count, level) = if hint.len() >= 8 {
            let hc = u32::from_le_bytes(hint[0..4].try_into().unwrap());
            let lv = u32::from_le_bytes(hint[4..8].try_into().unwrap()) as usize;
            (hc, lv.min(NR_QUEUE_LEVELS - 1))
        } else {
            (PROMOTE_THRESHOLD, NR_QUEUE_LEVELS - 1)
        };
        st.free_cbs.retain(|&c| c != cb);
        st.entries.insert(
            ob,
            Entry {
                home: Home::Cache,
                cb: Some(cb),
                level,
                hit_count,
            },
        );
        st.cache[level].push_front(ob);
        st.cb_to_ob.insert(cb, ob);
        Ok(())
    }

    fn walk_mappings(&self, f: &mut dyn FnMut(OBlock, CBlock, &[u8])) -> Result<()> {
        let st = self.state.lock();
        for (&ob, e) in st.entries.iter() {
            if let Some(cb) = e.cb {
                let mut hint = [0u8; 8];
                hint[0..4].copy_from_slice(&e.hit_count.to_le_bytes());
                hint[4..8].copy_from_slice(&(e.level as u32).to_le_bytes());
                f(ob, cb, &hint);
            }
        }
        Ok(())
    }

    fn remove_mapping(&self, ob: OBlock) {
        let mut st = self.state.lock();
        if let Some(e) = st.entries.remove(&ob) {
            let (home, level, cb) = (e.home, e.level, e.cb);
            st.unlink(ob, home, level);
            if let Some(cb) = cb {
                st.cb_to_ob.remove(&cb);
                st.free_cbs.push_back(cb);
            }
        }
    }

    fn force_mapping(&self, cur_ob: OBlock, new_ob: OBlock) {
        let mut st = self.state.lock();
        if let Some(e) = st.entries.remove(&cur_ob) {
            let (home, level, cb) = (e.home, e.level, e.cb);
            st.unlink(cur_ob, home, level);
            if let Some(cb) = cb {
                st.cb_to_ob.insert(cb, new_ob);
            }
            st.queue_mut(home, level).push_front(new_ob);
            st.entries.insert(new_ob, e);
        }
    }

    fn residency(&self) -> u64 {
        self.state.lock().cb_to_ob.len() as u64
    }

    fn status(&self) -> PolicyStats {
        let st = self.state.lock();
        PolicyStats {
            residency: st.cb_to_ob.len() as u64,
            ..Default::default()
        }
    }

    fn hint_size(&self) -> usize {
        8
    }

    fn name(&self) -> &'static str {
        "mq"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(sector: u64) -> RequestInfo {
        RequestInfo { write: false, sector }
    }

    #[test]
    fn first_touch_is_a_miss_and_enters_pre_cache() {
        let p = MqPolicy::new(4);
        assert_eq!(p.map(OBlock::new(1), true, false, req(0)).unwrap(), PolicyResult::Miss);
        assert_eq!(p.residency(), 0);
    }

    #[test]
    fn promotes_after_threshold_hits_when_migration_allowed() {
        let p = MqPolicy::new(4);
        let ob = OBlock::new(5);
        let mut last = PolicyResult::Miss;
        for i in 0..PROMOTE_THRESHOLD + 1 {
            last = p.map(ob, true, false, req(1000 + i as u64 * 99)).unwrap();
        }
        assert!(matches!(last, PolicyResult::New { .. } | PolicyResult::Hit { .. }));
    }

    #[test]
    fn never_admits_without_migration_permission() {
        let p = MqPolicy::new(1);
        let ob = OBlock::new(9);
        for i in 0..PROMOTE_THRESHOLD + 5 {
            let r = p.map(ob, false, false, req(500 + i as u64 * 17)).unwrap();
            assert!(!matches!(r, PolicyResult::New { .. } | PolicyResult::Replace { .. }));
        }
    }

    #[test]
    fn sequential_stream_never_admits() {
        let p = MqPolicy::new(4);
        let ob = OBlock::new(1);
        for s in 0..(SEQUENTIAL_THRESHOLD as u64 + 10) {
            let r = p.map(ob, true, false, req(s)).unwrap();
            assert!(!matches!(r, PolicyResult::New { .. } | PolicyResult::Replace { .. }));
        }
    }
}
