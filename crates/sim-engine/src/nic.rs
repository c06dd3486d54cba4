//! RDMA NIC model: per-queue-pair token buckets, PCIe posting costs, send
//! queue depth backpressure, and wire service time.
//!
//! Ordering guarantee: requests posted on the same queue pair complete in
//! post order, because each QP's completion frontier (`ready_at`) only ever
//! advances.

use sim_types::{Completion, RdmaReq, SimTime, Target, Verb};
use std::collections::HashMap;

/// A rate limiter with continuous refill and a burst allowance.
#[derive(Clone, Copy, Debug, Default)]
struct TokenBucket {
    rate_ops_per_us: f64,
    burst: f64,
    tokens: f64,
    last_refill: SimTime,
}

impl TokenBucket {
    fn init(&mut self, ops_per_s: f64, burst: f64, now: SimTime) {
        self.rate_ops_per_us = ops_per_s / 1e6;
        self.burst = burst;
        self.tokens = burst;
        self.last_refill = now;
    }

    fn initialized(&self) -> bool {
        self.rate_ops_per_us != 0.0
    }

    /// Acquires `need` tokens, refilling first. Returns the time at which
    /// the tokens become available (`now` if already available).
    fn acquire(&mut self, need: f64, now: SimTime) -> SimTime {
        self.tokens = (self.burst).min(self.tokens + (now - self.last_refill) * self.rate_ops_per_us);
        self.last_refill = now;
        if self.tokens >= need {
            self.tokens -= need;
            return now;
        }
        let deficit = need - self.tokens;
        let wait_us = deficit / self.rate_ops_per_us;
        self.tokens = 0.0;
        self.last_refill = now + wait_us;
        now + wait_us
    }
}

/// Per-(compute-id, qp-id) queue pair state, created lazily on first use.
#[derive(Default)]
struct QpState {
    ready_at: SimTime,
    post_ready_at: SimTime,
    outstanding: i64,
    tb_cas: TokenBucket,
    tb_read: TokenBucket,
    tb_write: TokenBucket,
}

fn pick_bucket(st: &mut QpState, verb: Verb) -> &mut TokenBucket {
    match verb {
        Verb::Cas => &mut st.tb_cas,
        Verb::Read => &mut st.tb_read,
        // WRITE/SEND/RECV all share the write bucket, as in the original
        // prototype's `pick_bucket`.
        _ => &mut st.tb_write,
    }
}

/// Static NIC capabilities, sourced from configuration.
#[derive(Clone, Copy, Debug)]
pub struct NicCaps {
    pub link_gbps: f64,
    pub base_rtt_us: f64,
    pub cas_onchip_rtt_us: f64,
    pub pcie_doorbell_us: f64,
    pub pcie_desc_us: f64,
    pub doorbell_batch_limit: u32,
    pub sq_depth: i64,
    pub tb_cas_ops_per_s: f64,
    pub tb_read_ops_per_s: f64,
    pub tb_write_ops_per_s: f64,
    pub tb_burst_ops: f64,
}

/// The shared NIC model: all index instances in a simulated cluster post
/// through the same `Nic`, keyed by `(cs_id, qp_id)`.
pub struct Nic {
    caps: NicCaps,
    qpstate: HashMap<(u32, u32), QpState>,
}

impl Nic {
    pub fn new(caps: NicCaps) -> Self {
        Self {
            caps,
            qpstate: HashMap::new(),
        }
    }

    pub fn caps(&self) -> NicCaps {
        self.caps
    }

    pub fn bytes_per_us(&self) -> f64 {
        (self.caps.link_gbps * 1e3) / 8.0
    }

    /// Posts one request, returning its completion time. `now` is the
    /// event loop's current virtual time; `on_drain` is invoked by the
    /// caller to actually decrement `outstanding` once `done` arrives --
    /// callers own scheduling that via the event loop since `Nic` itself
    /// has no loop access.
    pub fn post(&mut self, now: SimTime, r: RdmaReq) -> Completion {
        let key = (r.cs_id, r.qp);
        let caps = self.caps;
        let st = self.qpstate.entry(key).or_default();

        if !st.tb_read.initialized() {
            st.tb_read.init(caps.tb_read_ops_per_s, caps.tb_burst_ops, now);
            st.tb_write
                .init(caps.tb_write_ops_per_s, caps.tb_burst_ops, now);
            st.tb_cas.init(caps.tb_cas_ops_per_s, caps.tb_burst_ops, now);
        }

        // 1) PCIe posting costs (descriptor + doorbell; single WQE pays both)
        let t = now.max(st.post_ready_at);
        st.post_ready_at = t + caps.pcie_desc_us + caps.pcie_doorbell_us;

        // 2) SQ depth backpressure: delay posting until the frontier of
        // already-posted work, rather than synthetically freeing a slot --
        // `outstanding` only actually drains via `complete_one`, scheduled
        // by the caller at each request's real completion time.
        if st.outstanding >= caps.sq_depth {
            st.post_ready_at = st.post_ready_at.max(st.ready_at);
        }

        // 3) token bucket
        let t_tokens = pick_bucket(st, r.verb).acquire(1.0, st.post_ready_at);

        // 4) wire/NIC service time
        let svc = if r.verb == Verb::Cas && r.target == Target::RnicOnchip {
            caps.cas_onchip_rtt_us
        } else {
            caps.base_rtt_us + (r.bytes as f64) / self.bytes_per_us()
        };

        // 5) in-order completion
        let start = now.max(st.ready_at).max(t_tokens);
        let done = start + svc;
        st.ready_at = done;
        st.outstanding += 1;
        Completion::at(done)
    }

    /// Charges batched doorbells once for the whole chain, then posts each
    /// request in order; returns each request's own completion, in order,
    /// since each independently drains its QP's outstanding count.
    pub fn post_chain(&mut self, now: SimTime, chain: &[RdmaReq]) -> Vec<Completion> {
        let Some(first) = chain.first() else {
            return Vec::new();
        };
        let key = (first.cs_id, first.qp);
        let caps = self.caps;
        let st = self.qpstate.entry(key).or_default();
        let n = chain.len() as u32;
        let batches = n.div_ceil(caps.doorbell_batch_limit.max(1));
        let t = now.max(st.post_ready_at) + (n as f64) * caps.pcie_desc_us + (batches as f64) * caps.pcie_doorbell_us;
        st.post_ready_at = t;

        chain.iter().map(|r| self.post(now, *r)).collect()
    }

    /// Decrements the outstanding-WQE counter for `key`'s queue pair. The
    /// event loop calls this when a posted request's completion event
    /// fires (spec.md §4.2 step 6).
    pub fn complete_one(&mut self, cs_id: u32, qp: u32) {
        if let Some(st) = self.qpstate.get_mut(&(cs_id, qp)) {
            st.outstanding = (st.outstanding - 1).max(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn single_read_completion_matches_seed_scenario_1() {
        let mut nic = Nic::new(caps());
        let r = RdmaReq::new(Verb::Read, Target::Dram, 4096, 0, 0, 0);
        let c = nic.post(0.0, r);
        // base_rtt(2.0) + 4096*8/1e5 bits-per-us term from bytes_per_us=1.25e4
        let expected = 2.0 + 4096.0 / (100.0 * 1e3 / 8.0);
        assert!((c.when - expected).abs() < 1e-6);
    }

    #[test]
    fn same_qp_completions_are_monotone() {
        let mut nic = Nic::new(caps());
        let r = RdmaReq::new(Verb::Read, Target::Dram, 24, 0, 0, 0);
        let mut prev = 0.0;
        for _ in 0..8 {
            let c = nic.post(0.0, r);
            assert!(c.when >= prev);
            prev = c.when;
        }
    }

    #[test]
    fn sq_depth_one_serializes_posts() {
        let mut local_caps = caps();
        local_caps.sq_depth = 1;
        let mut nic = Nic::new(local_caps);
        let r = RdmaReq::new(Verb::Read, Target::Dram, 24, 0, 0, 0);
        let mut times = Vec::new();
        for _ in 0..4 {
            times.push(nic.post(0.0, r).when);
        }
        for w in times.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn cas_onchip_uses_fixed_rtt_not_size_term() {
        let mut nic = Nic::new(caps());
        let r = RdmaReq::new(Verb::Cas, Target::RnicOnchip, 8, 0, 0, 0);
        let c = nic.post(0.0, r);
        assert!((c.when - 0.7).abs() < 1e-6);
    }
}
