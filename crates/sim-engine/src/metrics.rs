//! Per-workload-run aggregate counters and latency percentile computation.

use sim_types::{SimTime, Verb};

/// One completed operation, as it appears in a per-workload trace file.
#[derive(Debug, Clone)]
pub struct OpTraceRow {
    pub op_id: u64,
    pub kind: &'static str,
    pub latency_us: f64,
    pub reads: u64,
    pub writes: u64,
    pub cas: u64,
    pub sends: u64,
    pub recvs: u64,
    pub bytes_r: u64,
    pub bytes_w: u64,
}

/// A snapshot of the running totals, taken at an operation's start so its
/// per-op deltas can be computed on completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    reads: u64,
    writes: u64,
    cas: u64,
    sends: u64,
    recvs: u64,
    bytes_r: u64,
    bytes_w: u64,
}

/// Running totals for one (index kind, workload) pair, plus the raw latency
/// samples used to compute percentiles once the run drains.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub reads: u64,
    pub writes: u64,
    pub cas: u64,
    pub sends: u64,
    pub recvs: u64,
    pub bytes_r: u64,
    pub bytes_w: u64,
    pub dump_trace: bool,
    pub trace: Vec<OpTraceRow>,
    latencies_us: Vec<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reads: self.reads,
            writes: self.writes,
            cas: self.cas,
            sends: self.sends,
            recvs: self.recvs,
            bytes_r: self.bytes_r,
            bytes_w: self.bytes_w,
        }
    }

    /// Records one completed operation: its end-to-end latency, and (if
    /// `dump_trace` is set) a trace row of the deltas since `since`.
    pub fn record_op(&mut self, op_id: u64, kind: &'static str, latency_us: SimTime, since: MetricsSnapshot) {
        self.latencies_us.push(latency_us);
        if self.dump_trace {
            self.trace.push(OpTraceRow {
                op_id,
                kind,
                latency_us,
                reads: self.reads - since.reads,
                writes: self.writes - since.writes,
                cas: self.cas - since.cas,
                sends: self.sends - since.sends,
                recvs: self.recvs - since.recvs,
                bytes_r: self.bytes_r - since.bytes_r,
                bytes_w: self.bytes_w - since.bytes_w,
            });
        }
    }

    /// Charges one posted verb's byte cost against the running totals.
    /// Called once per `Nic::post`/`post_chain` element so `reads`/`writes`
    /// always match what was actually posted to the wire.
    pub fn record_verb(&mut self, verb: Verb, bytes: usize) {
        match verb {
            Verb::Read => {
                self.reads += 1;
                self.bytes_r += bytes as u64;
            }
            Verb::Write => {
                self.writes += 1;
                self.bytes_w += bytes as u64;
            }
            Verb::Cas => self.cas += 1,
            Verb::Send => self.sends += 1,
            Verb::Recv => self.recvs += 1,
        }
    }

    /// Records one completed operation's end-to-end latency, in microseconds.
    pub fn record_latency(&mut self, latency_us: SimTime) {
        self.latencies_us.push(latency_us);
    }

    pub fn op_count(&self) -> usize {
        self.latencies_us.len()
    }

    /// Computes the requested percentiles (0-100) from the recorded
    /// latencies. Returns an empty vec if no operations completed.
    pub fn percentiles(&self, ptiles: &[f64]) -> Vec<f64> {
        if self.latencies_us.is_empty() {
            return vec![0.0; ptiles.len()];
        }
        let mut sorted = self.latencies_us.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        ptiles.iter().map(|&p| percentile_sorted(&sorted, p)).collect()
    }
}

fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    let len = sorted.len();
    if len == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(len - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_of_uniform_ramp() {
        let mut m = Metrics::new();
        for i in 1..=100u32 {
            m.record_latency(i as f64);
        }
        let p = m.percentiles(&[50.0, 95.0, 99.0]);
        assert_eq!(p[0], 50.0);
        assert_eq!(p[1], 95.0);
        assert_eq!(p[2], 99.0);
    }

    #[test]
    fn record_verb_tracks_bytes_by_kind() {
        let mut m = Metrics::new();
        m.record_verb(Verb::Read, 4096);
        m.record_verb(Verb::Read, 24);
        m.record_verb(Verb::Write, 32);
        m.record_verb(Verb::Cas, 8);
        assert_eq!(m.reads, 2);
        assert_eq!(m.bytes_r, 4120);
        assert_eq!(m.writes, 1);
        assert_eq!(m.bytes_w, 32);
        assert_eq!(m.cas, 1);
    }

    #[test]
    fn empty_metrics_yield_zero_percentiles() {
        let m = Metrics::new();
        assert_eq!(m.percentiles(&[50.0, 99.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn trace_row_captures_deltas_since_snapshot() {
        let mut m = Metrics::new();
        m.dump_trace = true;
        let since = m.snapshot();
        m.record_verb(Verb::Read, 4096);
        m.record_verb(Verb::Read, 24);
        m.record_op(7, "GET", 10.2, since);
        assert_eq!(m.trace.len(), 1);
        let row = &m.trace[0];
        assert_eq!(row.op_id, 7);
        assert_eq!(row.reads, 2);
        assert_eq!(row.bytes_r, 4120);
    }
}
