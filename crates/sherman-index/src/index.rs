//! Index A: a hierarchical-lock B+-tree client. Path read, optimistic
//! two-level version check, HOCL (LLT-then-GLT CAS) on writes, combined
//! write+unlock, and a size-triggered split policy.

use crate::delegation::{CollisionPolicy as DelegationCollisionPolicy, DelegationTable};
use crate::hopscotch::HopscotchOverlay;
use crate::locks::{Glt, Llt};
use sim_config::config::{CollisionPolicy, IndexConfig, ShermanConfig};
use sim_engine::{CacheKey, IndexClient, LruCache, SimShared};
use sim_types::{RdmaReq, SimTime, Target, Verb};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

const SIBLING_XOR: u64 = 0x5bd1_e995;

struct LeafMeta {
    node_ver: u64,
    entry_ver: Vec<u64>,
    entries: u32,
    access_count: u64,
    overlay: Option<HopscotchOverlay>,
}

impl LeafMeta {
    fn new(capacity: u32) -> Self {
        Self {
            node_ver: 0,
            entry_ver: vec![0; capacity as usize],
            entries: 0,
            access_count: 0,
            overlay: None,
        }
    }
}

pub struct Sherman {
    shared: Rc<RefCell<SimShared>>,
    delegation: Rc<RefCell<DelegationTable>>,
    cs_id: u32,
    ms_id: u32,
    qp: u32,
    node_bytes: u64,
    leaf_entry_bytes: u64,
    combine: bool,
    hocl_enable: bool,
    llt_enable: bool,
    llt_local_wait_us: f64,
    two_level_versions: bool,
    glt_slots: u32,
    model_glt_collisions: bool,
    glt_hash_seed: u64,
    cas_max_retries: u32,
    cas_backoff_us: f64,
    leaf_max_entries: u32,
    enable_splits: bool,
    split_threshold: f64,
    hopscotch_enable: bool,
    hopscotch_h: u32,
    hopscotch_slots_per_leaf: u32,
    hopscotch_topk: u32,
    hopscotch_rebuild_threshold: u32,
    cache: RefCell<LruCache>,
    glt: RefCell<Glt>,
    llt: RefCell<Llt>,
    leafs: RefCell<HashMap<u64, LeafMeta>>,
    /// Recency order of leaves with a currently-built overlay, oldest at the
    /// front. Bounds the active overlay set to `hopscotch_topk` leaves.
    overlay_order: RefCell<VecDeque<u64>>,
}

impl Sherman {
    pub fn new(
        shared: Rc<RefCell<SimShared>>,
        delegation: Rc<RefCell<DelegationTable>>,
        conf: &ShermanConfig,
        idx: &IndexConfig,
        cs_id: u32,
        ms_id: u32,
        qp: u32,
        cache_bytes: u64,
    ) -> Rc<Self> {
        Rc::new(Self {
            shared,
            delegation,
            cs_id,
            ms_id,
            qp,
            node_bytes: idx.node_bytes,
            leaf_entry_bytes: idx.leaf_entry_bytes,
            combine: conf.combine_commands && !idx.ablations.sherman.disable_combine,
            hocl_enable: conf.hocl.enable && !idx.ablations.sherman.disable_hocl,
            llt_enable: conf.hocl.llt_enable,
            llt_local_wait_us: conf.hocl.llt_local_wait_us,
            two_level_versions: conf.enable_two_level_versions && !idx.ablations.sherman.disable_versions,
            glt_slots: conf.hocl.glt_slots,
            model_glt_collisions: conf.model_glt_collisions,
            glt_hash_seed: conf.glt_hash_seed,
            cas_max_retries: conf.cas_max_retries,
            cas_backoff_us: conf.cas_backoff_us,
            leaf_max_entries: conf.leaf_max_entries,
            enable_splits: conf.enable_splits,
            split_threshold: conf.split_threshold as f64 / 100.0,
            hopscotch_enable: conf.hopscotch.enable,
            hopscotch_h: conf.hopscotch.h,
            hopscotch_slots_per_leaf: conf.hopscotch.slots_per_leaf,
            hopscotch_topk: conf.hopscotch.topk,
            hopscotch_rebuild_threshold: conf.hopscotch.rebuild_threshold,
            cache: RefCell::new(LruCache::new(cache_bytes)),
            glt: RefCell::new(Glt::new(conf.hocl.glt_slots)),
            llt: RefCell::new(Llt::new()),
            leafs: RefCell::new(HashMap::new()),
            overlay_order: RefCell::new(VecDeque::new()),
        })
    }

    fn leaf_capacity(&self) -> u32 {
        if self.leaf_max_entries > 0 {
            self.leaf_max_entries
        } else {
            (self.node_bytes / self.leaf_entry_bytes.max(1)) as u32
        }
    }

    fn path_to_leaf(key: u64) -> (u64, [u64; 3]) {
        let nodes = [key >> 32, key >> 16, key];
        (key, nodes)
    }

    fn glt_slot(&self, leaf: u64) -> u32 {
        if !self.model_glt_collisions {
            return (leaf % self.glt_slots as u64) as u32;
        }
        let mut x = leaf ^ self.glt_slots as u64 ^ self.glt_hash_seed;
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51afd7ed558ccd);
        x ^= x >> 33;
        x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
        x ^= x >> 33;
        (x % self.glt_slots as u64) as u32
    }

    fn read_node(&self, node_id: u64, level: i32, done: &mut SimTime) {
        let key = CacheKey::new(node_id, level);
        if self.cache.borrow_mut().get(key) {
            return;
        }
        let r = RdmaReq::new(Verb::Read, Target::Dram, self.node_bytes as usize, self.qp, self.cs_id, self.ms_id);
        let c = SimShared::post_rdma(&self.shared, r);
        *done = done.max(c.when);
        self.cache.borrow_mut().put(key, self.node_bytes);
    }

    /// HOCL acquisition: LLT hand-off plus GLT CAS. Uses the current
    /// head-of-LLT-and-free-GLT success condition rather than a randomized
    /// retry outcome, so repeated runs of the same workload are
    /// deterministic.
    fn hocl_acquire(&self, leaf: u64, tid: i64, done: &mut SimTime) {
        if self.hocl_enable && self.llt_enable {
            let pos = self.llt.borrow_mut().enqueue_and_pos(leaf, tid);
            if pos > 0 {
                *done += self.llt_local_wait_us * pos as f64;
            }
        }
        let slot = self.glt_slot(leaf);
        let target = if self.hocl_enable { Target::RnicOnchip } else { Target::Dram };
        let mut retries = 0u32;
        loop {
            let cas = RdmaReq::new(Verb::Cas, target, 8, self.qp, self.cs_id, self.ms_id);
            let c = SimShared::post_rdma(&self.shared, cas);
            *done = done.max(c.when);

            let head_ok = !self.llt_enable || self.llt.borrow().at_head(leaf, tid);
            let glt_free = self.glt.borrow().is_free(slot);
            if head_ok && glt_free {
                self.glt.borrow_mut().set_owner(slot, tid);
                break;
            }
            retries += 1;
            if retries >= self.cas_max_retries {
                self.glt.borrow_mut().set_owner(slot, tid);
                break;
            }
            *done += self.cas_backoff_us;
        }
    }

    fn hocl_release_state_at(&self, leaf: u64, tid: i64, when: SimTime, slot: u32) {
        self.glt.borrow_mut().clear(slot);
        if self.llt_enable {
            self.llt.borrow_mut().release(leaf, tid);
        }
        let _ = when;
    }

    fn hocl_release(&self, leaf: u64, tid: i64, done: &mut SimTime) {
        let w = RdmaReq::new(Verb::Write, Target::Dram, 8, self.qp, self.cs_id, self.ms_id);
        let c = SimShared::post_rdma(&self.shared, w);
        *done = done.max(c.when);
        let slot = self.glt_slot(leaf);
        self.hocl_release_state_at(leaf, tid, *done, slot);
    }

    /// Finds a key's leaf slot via the hopscotch overlay if one exists for
    /// this (hot) leaf; callers fall back to the always-issued leaf-entry
    /// READ either way, since the overlay only tells us whether that READ
    /// could have been elided, not whether to skip it in this cost model.
    fn hopscotch_lookup(&self, leaf: u64, key: u64) -> Option<u16> {
        if !self.hopscotch_enable {
            return None;
        }
        self.leafs
            .borrow()
            .get(&leaf)
            .and_then(|m| m.overlay.as_ref())
            .and_then(|o| o.lookup(key))
    }

    /// Bumps `leaf`'s access counter and, once it crosses
    /// `hopscotch_rebuild_threshold`, builds an overlay for it if it
    /// doesn't already have one. The set of leaves with a built overlay is
    /// bounded to the `hopscotch_topk` most recently touched, evicting the
    /// least-recently-used overlay once that bound is exceeded -- so "top-K
    /// hottest leaves" in this model means the K leaves most recently hot
    /// enough to build, not a running rank of all-time access counts.
    fn maybe_build_overlay(&self, leaf: u64) {
        if !self.hopscotch_enable {
            return;
        }
        let newly_built = {
            let mut leafs = self.leafs.borrow_mut();
            let meta = leafs.entry(leaf).or_insert_with(|| LeafMeta::new(self.leaf_capacity()));
            meta.access_count += 1;
            if meta.overlay.is_none() && meta.access_count >= self.hopscotch_rebuild_threshold as u64 {
                meta.overlay = Some(HopscotchOverlay::new(self.hopscotch_h, self.hopscotch_slots_per_leaf));
                true
            } else {
                meta.overlay.is_some()
            }
        };
        if newly_built {
            self.touch_overlay_lru(leaf);
        }
    }

    /// Marks `leaf` as most-recently-used among leaves with a built
    /// overlay, evicting the least-recently-used one(s) past `topk`.
    fn touch_overlay_lru(&self, leaf: u64) {
        let mut order = self.overlay_order.borrow_mut();
        if let Some(pos) = order.iter().position(|&l| l == leaf) {
            order.remove(pos);
        }
        order.push_back(leaf);
        while order.len() > self.hopscotch_topk.max(1) as usize {
            if let Some(evicted) = order.pop_front() {
                if let Some(meta) = self.leafs.borrow_mut().get_mut(&evicted) {
                    meta.overlay = None;
                }
            }
        }
    }

    /// Performs the read-side RDMA work for one GET: path reads, overlay
    /// bookkeeping, the leaf-entry read, and the optional two-level
    /// version revalidation read. Returns the completion time; does not
    /// itself record a metrics op, so callers (direct or via delegation)
    /// control exactly once-per-op_id accounting.
    fn get_cost(&self, key: u64) -> SimTime {
        let mut done = self.shared.borrow().loop_.now;

        let (leaf, nodes) = Self::path_to_leaf(key);
        for (lvl, node_id) in nodes.iter().enumerate() {
            self.read_node(*node_id, lvl as i32, &mut done);
        }

        self.maybe_build_overlay(leaf);
        let idx = (key % self.leaf_capacity() as u64) as u16;
        let overlay_hit = self.hopscotch_lookup(leaf, key) == Some(idx);
        if self.hopscotch_enable && overlay_hit {
            if let Some(meta) = self.leafs.borrow_mut().get_mut(&leaf) {
                meta.overlay.as_mut().unwrap().insert(key, idx);
            }
        }

        let r = RdmaReq::new(Verb::Read, Target::Dram, self.leaf_entry_bytes as usize, self.qp, self.cs_id, self.ms_id);
        let c = SimShared::post_rdma(&self.shared, r);
        done = done.max(c.when);

        {
            let mut leafs = self.leafs.borrow_mut();
            let meta = leafs.entry(leaf).or_insert_with(|| LeafMeta::new(self.leaf_capacity()));
            if meta.entry_ver.is_empty() {
                meta.entry_ver = vec![0; self.leaf_capacity() as usize];
            }
        }

        if self.two_level_versions {
            let r2 = RdmaReq::new(Verb::Read, Target::Dram, self.node_bytes as usize, self.qp, self.cs_id, self.ms_id);
            let c2 = SimShared::post_rdma(&self.shared, r2);
            done = done.max(c2.when);
        }

        done
    }

    fn do_get(&self, key: u64, op_id: u64) {
        let start = self.shared.borrow().loop_.now;
        let since = self.shared.borrow().metrics.snapshot();
        let done = self.get_cost(key);

        let shared = self.shared.clone();
        shared.clone().borrow_mut().loop_.at(done, move || {
            shared.borrow_mut().metrics.record_op(op_id, "GET", done - start, since);
        });
    }

    fn do_put(&self, key: u64, op_id: u64) {
        let start = self.shared.borrow().loop_.now;
        let mut done = start;
        let since = self.shared.borrow().metrics.snapshot();
        let tid: i64 = 0;

        let (leaf, nodes) = Self::path_to_leaf(key);
        for (lvl, node_id) in nodes.iter().enumerate() {
            self.read_node(*node_id, lvl as i32, &mut done);
        }

        if self.hocl_enable {
            self.hocl_acquire(leaf, tid, &mut done);
        }

        if self.combine {
            let chain = [
                RdmaReq::new(Verb::Write, Target::Dram, self.leaf_entry_bytes as usize, self.qp, self.cs_id, self.ms_id),
                RdmaReq::new(Verb::Write, Target::Dram, 8, self.qp, self.cs_id, self.ms_id),
            ];
            let c = SimShared::post_rdma_chain(&self.shared, &chain);
            done = done.max(c.when);
            if self.hocl_enable {
                let slot = self.glt_slot(leaf);
                self.hocl_release_state_at(leaf, tid, done, slot);
            }
        } else {
            let w = RdmaReq::new(Verb::Write, Target::Dram, self.leaf_entry_bytes as usize, self.qp, self.cs_id, self.ms_id);
            let c = SimShared::post_rdma(&self.shared, w);
            done = done.max(c.when);
            if self.hocl_enable {
                self.hocl_release(leaf, tid, &mut done);
            }
        }

        let capacity = self.leaf_capacity();
        {
            let mut leafs = self.leafs.borrow_mut();
            let meta = leafs.entry(leaf).or_insert_with(|| LeafMeta::new(capacity));
            if meta.entry_ver.is_empty() {
                meta.entry_ver = vec![0; capacity as usize];
            }
            let idx = (key % capacity as u64) as usize;
            if self.two_level_versions {
                meta.entry_ver[idx] += 1;
            }
            meta.node_ver += 1;
            meta.entries = (meta.entries + 1).min(capacity);
        }

        let should_split = {
            let leafs = self.leafs.borrow();
            let meta = &leafs[&leaf];
            self.enable_splits && meta.entries as f64 >= self.split_threshold * capacity as f64
        };
        if should_split {
            let sibling = leaf ^ SIBLING_XOR;
            {
                let mut leafs = self.leafs.borrow_mut();
                let moved = leafs[&leaf].entries / 2;
                leafs.get_mut(&leaf).unwrap().entries -= moved;
                leafs.get_mut(&leaf).unwrap().node_ver += 1;
                let sib = leafs.entry(sibling).or_insert_with(|| LeafMeta::new(capacity));
                sib.entries += moved;
                sib.node_ver += 1;
            }
            let w_sib = RdmaReq::new(Verb::Write, Target::Dram, self.node_bytes as usize, self.qp, self.cs_id, self.ms_id);
            let c1 = SimShared::post_rdma(&self.shared, w_sib);
            done = done.max(c1.when);

            let w_parent = RdmaReq::new(Verb::Write, Target::Dram, 64, self.qp, self.cs_id, self.ms_id);
            let c2 = SimShared::post_rdma(&self.shared, w_parent);
            done = done.max(c2.when);
        }

        let shared = self.shared.clone();
        shared.clone().borrow_mut().loop_.at(done, move || {
            shared.borrow_mut().metrics.record_op(op_id, "PUT", done - start, since);
        });
    }
}

impl IndexClient for Sherman {
    /// Delegation-aware GET. When delegation is disabled, this is just
    /// `do_get`. When enabled, the caller that becomes the delegate
    /// performs the real RDMA work and defers both its own `record_op` and
    /// `complete_delegation` to the same `loop_.at(done, ...)` callback --
    /// so waiters released by `complete_delegation` see it fire at the
    /// delegate's actual completion time, not synchronously at call time.
    /// Waiters record their own op under their own `op_id`, whether they're
    /// served immediately (an already-completed delegation) or later (a
    /// still in-flight one), since that callback always runs at "now" as of
    /// when it executes.
    fn get(self: Rc<Self>, key: u64, op_id: u64) {
        let now = self.shared.borrow().loop_.now;
        let delegation_enabled = self.delegation.borrow().is_enabled();
        if !delegation_enabled {
            self.do_get(key, op_id);
            return;
        }

        let start = now;
        let since = self.shared.borrow().metrics.snapshot();
        let shared_for_waiter = self.shared.clone();
        let (is_delegate, hash) = self.delegation.borrow_mut().try_delegate_get(key, now, move |_success, _result| {
            let shared = shared_for_waiter.clone();
            let latency = shared.borrow().loop_.now - start;
            shared.borrow_mut().metrics.record_op(op_id, "GET", latency, since);
        });

        if !is_delegate {
            return;
        }

        let done = self.get_cost(key);
        let shared = self.shared.clone();
        let delegation = self.delegation.clone();
        shared.clone().borrow_mut().loop_.at(done, move || {
            shared.borrow_mut().metrics.record_op(op_id, "GET", done - start, since);
            if let Some(hash) = hash {
                delegation.borrow_mut().complete_delegation(hash, true, String::new());
            }
        });
    }

    fn put(self: Rc<Self>, key: u64, op_id: u64) {
        self.do_put(key, op_id);
    }
}

fn to_delegation_policy(p: CollisionPolicy) -> DelegationCollisionPolicy {
    match p {
        CollisionPolicy::Bypass => DelegationCollisionPolicy::Bypass,
        CollisionPolicy::Queue => DelegationCollisionPolicy::Queue,
    }
}

pub fn make_delegation_table(conf: &ShermanConfig) -> DelegationTable {
    DelegationTable::new(conf.rdwc.enable, conf.rdwc.window_us, to_delegation_policy(conf.rdwc.collision_policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_config::config::{AblationsConfig, HoclConfig, HopscotchConfig, IndexKind, RdwcConfig};
    use sim_engine::{NicCaps, SimShared};

    fn caps() -> NicCaps {
        NicCaps {
            link_gbps: 100.0,
            base_rtt_us: 2.0,
            cas_onchip_rtt_us: 0.7,
            pcie_doorbell_us: 0.25,
            pcie_desc_us: 0.03,
            doorbell_batch_limit: 16,
            sq_depth: 512,
            tb_cas_ops_per_s: 120e6,
            tb_read_ops_per_s: 8.5e6,
            tb_write_ops_per_s: 9.0e6,
            tb_burst_ops: 64.0,
        }
    }

    fn sherman_conf() -> ShermanConfig {
        ShermanConfig {
            combine_commands: true,
            hocl: HoclConfig {
                enable: true,
                glt_slots: 1024,
                llt_enable: true,
                llt_local_wait_us: 0.2,
            },
            two_level_versioning: true,
            cache_levels: 2,
            glt_hash_seed: 0x9e3779b97f4a7c15,
            cas_max_retries: 8,
            cas_backoff_us: 0.5,
            model_glt_collisions: false,
            leaf_max_entries: 170,
            split_threshold: 56,
            merge_threshold: 16,
            enable_splits: false,
            enable_merges: false,
            enable_two_level_versions: true,
            rdwc: RdwcConfig {
                enable: false,
                window_us: 100.0,
                collision_policy: CollisionPolicy::Bypass,
            },
            hopscotch: HopscotchConfig {
                enable: false,
                h: 8,
                slots_per_leaf: 64,
                enable_speculative: false,
                topk: 16,
                rebuild_threshold: 4,
            },
        }
    }

    fn index_conf() -> IndexConfig {
        IndexConfig {
            kind: IndexKind::Sherman,
            node_bytes: 4096,
            leaf_entry_bytes: 24,
            ablations: AblationsConfig::default(),
        }
    }

    #[test]
    fn cold_get_costs_three_path_reads_plus_one_entry_read() {
        let shared = SimShared::new(caps());
        let mut conf = sherman_conf();
        conf.enable_two_level_versions = false;
        let idx = index_conf();
        let delegation = Rc::new(RefCell::new(make_delegation_table(&conf)));
        let sherman = Sherman::new(shared.clone(), delegation, &conf, &idx, 0, 0, 0, 4096);
        sherman.do_get(1, 0);
        SimShared::run(&shared);
        let m = &shared.borrow().metrics;
        assert_eq!(m.reads, 4);
        assert_eq!(m.bytes_r, 3 * 4096 + 24);
        assert_eq!(m.op_count(), 1);
    }

    #[test]
    fn two_level_versioning_adds_an_unconditional_revalidation_read() {
        let shared = SimShared::new(caps());
        let mut conf = sherman_conf();
        conf.enable_two_level_versions = true;
        let idx = index_conf();
        let delegation = Rc::new(RefCell::new(make_delegation_table(&conf)));
        let sherman = Sherman::new(shared.clone(), delegation, &conf, &idx, 0, 0, 0, 4096);
        sherman.do_get(1, 0);
        SimShared::run(&shared);
        let m = &shared.borrow().metrics;
        assert_eq!(m.reads, 5);
        assert_eq!(m.bytes_r, 4 * 4096 + 24);
    }

    #[test]
    fn combined_put_issues_two_writes() {
        let shared = SimShared::new(caps());
        let conf = sherman_conf();
        let idx = index_conf();
        let delegation = Rc::new(RefCell::new(make_delegation_table(&conf)));
        let sherman = Sherman::new(shared.clone(), delegation, &conf, &idx, 0, 0, 0, 4096);
        sherman.do_put(1, 0);
        SimShared::run(&shared);
        let m = &shared.borrow().metrics;
        assert_eq!(m.writes, 2);
        assert_eq!(m.bytes_w, 24 + 8);
    }

    #[test]
    fn glt_slot_without_collision_modeling_is_plain_modulo() {
        let shared = SimShared::new(caps());
        let mut conf = sherman_conf();
        conf.model_glt_collisions = false;
        conf.hocl.glt_slots = 16;
        let idx = index_conf();
        let delegation = Rc::new(RefCell::new(make_delegation_table(&conf)));
        let sherman = Sherman::new(shared, delegation, &conf, &idx, 0, 0, 0, 4096);
        assert_eq!(sherman.glt_slot(33), 33 % 16);
    }

    #[test]
    fn delegated_waiter_is_recorded_once_at_delegate_completion() {
        let shared = SimShared::new(caps());
        let mut conf = sherman_conf();
        conf.rdwc.enable = true;
        conf.rdwc.window_us = 100.0;
        let idx = index_conf();
        let delegation = Rc::new(RefCell::new(make_delegation_table(&conf)));
        let sherman = Sherman::new(shared.clone(), delegation, &conf, &idx, 0, 0, 0, 4096);

        let this = sherman.clone();
        this.get(7, 0);
        let this2 = sherman.clone();
        this2.get(7, 1);

        SimShared::run(&shared);
        let m = &shared.borrow().metrics;
        // one delegate performs the RDMA work; the waiter is still recorded
        // as its own completed op, so two ops complete from one read's cost.
        assert_eq!(m.op_count(), 2);
        assert_eq!(m.reads, 4);
    }

    #[test]
    fn overlay_set_is_bounded_to_topk_with_lru_eviction() {
        let shared = SimShared::new(caps());
        let mut conf = sherman_conf();
        conf.hopscotch.enable = true;
        conf.hopscotch.rebuild_threshold = 1;
        conf.hopscotch.topk = 2;
        let idx = index_conf();
        let delegation = Rc::new(RefCell::new(make_delegation_table(&conf)));
        let sherman = Sherman::new(shared.clone(), delegation, &conf, &idx, 0, 0, 0, 4096);

        // three distinct leaves, each crossing the rebuild threshold on
        // first access; only the 2 most recently touched keep an overlay.
        sherman.do_get(1, 0);
        sherman.do_get(1 << 32, 1);
        sherman.do_get(2 << 32, 2);
        SimShared::run(&shared);

        let built: Vec<u64> = sherman.overlay_order.borrow().iter().copied().collect();
        assert_eq!(built.len(), 2);
        let (leaf0, _) = Sherman::path_to_leaf(1);
        assert!(!built.contains(&leaf0), "oldest leaf's overlay should have been evicted");
    }
}
