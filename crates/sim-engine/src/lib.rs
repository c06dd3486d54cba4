//! Shared simulation primitives: the virtual-time event loop, the RDMA NIC
//! model, the LRU node cache, the Zipf sampler, and aggregate metrics.
//!
//! Index clients (in `sherman-index` and `dex-index`) hold an
//! `Rc<RefCell<SimShared>>` and post through it; `sim-runner` owns the
//! `SimShared` for the duration of one workload and drains it with
//! [`SimShared::run`].

pub mod cache;
pub mod event_loop;
pub mod metrics;
pub mod nic;
pub mod zipf;

pub use cache::{CacheKey, LruCache};
pub use event_loop::EventLoop;
pub use metrics::{Metrics, MetricsSnapshot, OpTraceRow};
pub use nic::{Nic, NicCaps};
pub use zipf::ZipfSampler;

use sim_types::{Completion, RdmaReq, SimTime};
use std::cell::RefCell;
use std::rc::Rc;

/// The event loop, NIC, and metrics for one workload run, bundled so index
/// clients can reach all three through a single `Rc<RefCell<_>>` handle.
pub struct SimShared {
    pub loop_: EventLoop,
    pub nic: Nic,
    pub metrics: Metrics,
}

impl SimShared {
    pub fn new(nic_caps: NicCaps) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            loop_: EventLoop::new(),
            nic: Nic::new(nic_caps),
            metrics: Metrics::new(),
        }))
    }

    /// Drains the event loop. Each iteration pops one callback and drops
    /// the borrow before invoking it, so a callback that needs to
    /// re-borrow `shared` to post further RDMA requests or schedule
    /// further events does not hit a `RefCell` double-borrow panic.
    pub fn run(shared: &Rc<RefCell<Self>>) {
        loop {
            let cb = shared.borrow_mut().loop_.pop_ready();
            match cb {
                Some(cb) => cb(),
                None => break,
            }
        }
    }

    /// Posts one RDMA request: charges its verb/byte cost in metrics, posts
    /// it to the NIC, and schedules the queue pair's outstanding-WQE
    /// decrement at its real completion time, so later posts' backpressure
    /// checks see slots freed as of events actually firing, not as of the
    /// post call itself. Index clients should always post through this
    /// rather than reaching into `nic`/`metrics` directly.
    pub fn post_rdma(shared: &Rc<RefCell<Self>>, r: RdmaReq) -> Completion {
        let now = shared.borrow().loop_.now;
        let c = {
            let mut s = shared.borrow_mut();
            let c = s.nic.post(now, r);
            s.metrics.record_verb(r.verb, r.bytes);
            c
        };
        Self::schedule_completion(shared, r.cs_id, r.qp, c.when);
        c
    }

    /// Same as [`post_rdma`](Self::post_rdma) for a batched doorbell chain;
    /// every request in the chain gets its own completion-time decrement.
    /// Returns the last request's completion, matching the single-request
    /// chain's overall finish time.
    pub fn post_rdma_chain(shared: &Rc<RefCell<Self>>, chain: &[RdmaReq]) -> Completion {
        let now = shared.borrow().loop_.now;
        let completions = {
            let mut s = shared.borrow_mut();
            let completions = s.nic.post_chain(now, chain);
            for r in chain {
                s.metrics.record_verb(r.verb, r.bytes);
            }
            completions
        };
        for (r, c) in chain.iter().zip(completions.iter()) {
            Self::schedule_completion(shared, r.cs_id, r.qp, c.when);
        }
        completions.last().copied().unwrap_or(Completion::at(now))
    }

    fn schedule_completion(shared: &Rc<RefCell<Self>>, cs_id: u32, qp: u32, when: SimTime) {
        let shared2 = shared.clone();
        shared.borrow_mut().loop_.at(when, move || {
            shared2.borrow_mut().nic.complete_one(cs_id, qp);
        });
    }
}

/// A compute-side B+-tree index client. Methods take `Rc<Self>` rather than
/// `&self`/`&mut self` because a client (e.g. Dex's repartitioner) may need
/// to schedule a closure that calls back into itself later; all per-instance
/// mutable state lives behind `RefCell` fields on the implementor instead.
pub trait IndexClient {
    fn get(self: Rc<Self>, key: u64, op_id: u64);
    fn put(self: Rc<Self>, key: u64, op_id: u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::{RdmaReq, Target, Verb};

    fn test_caps() -> NicCaps {
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
    fn callback_can_reborrow_shared_to_post_again() {
        let shared = SimShared::new(test_caps());
        let s1 = shared.clone();
        shared.borrow_mut().loop_.at(0.0, move || {
            let r = RdmaReq::new(Verb::Read, Target::Dram, 24, 0, 0, 0);
            let now = s1.borrow().loop_.now;
            let done = s1.borrow_mut().nic.post(now, r);
            s1.borrow_mut().metrics.record_verb(Verb::Read, 24);
            let s2 = s1.clone();
            s1.borrow_mut().loop_.at(done.when, move || {
                s2.borrow_mut().metrics.record_latency(done.when);
            });
        });
        SimShared::run(&shared);
        assert_eq!(shared.borrow().metrics.op_count(), 1);
        assert_eq!(shared.borrow().metrics.reads, 1);
    }
}
