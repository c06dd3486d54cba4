//! Drives one or more configured workloads against a fresh [`SimShared`]
//! per run, then appends a summary row (and, optionally, a per-op trace)
//! to CSV files under the configured output directory.

use dex_index::Dex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sherman_index::{make_delegation_table, Sherman};
use sim_config::config::{IndexKind, NicConfig, SimConfig, WorkloadConfig};
use sim_engine::{IndexClient, NicCaps, SimShared};
use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

/// Seed matching the original prototype's workload driver
/// (`std::mt19937_64 rng(42)`), kept literally so a given config produces
/// the same op stream every run.
const WORKLOAD_RNG_SEED: u64 = 42;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("failed to create output directory '{path}'")]
    CreateOutDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write '{path}'")]
    WriteOutput {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One completed workload's aggregate result, as it appears in a row of
/// `metrics_summary.csv`.
#[derive(Debug, Clone)]
pub struct WorkloadReport {
    pub index_name: String,
    pub workload: String,
    pub ops: usize,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub reads: u64,
    pub writes: u64,
    pub cas: u64,
    pub sends: u64,
    pub recvs: u64,
    pub bytes_r: u64,
    pub bytes_w: u64,
}

fn nic_caps(c: &NicConfig) -> NicCaps {
    NicCaps {
        link_gbps: c.link_gbps,
        base_rtt_us: c.base_rtt_us,
        cas_onchip_rtt_us: c.cas_onchip_rtt_us,
        pcie_doorbell_us: c.pcie_doorbell_us,
        pcie_desc_us: c.pcie_desc_us,
        doorbell_batch_limit: c.doorbell_batch_limit,
        sq_depth: c.sq_depth,
        tb_cas_ops_per_s: c.tb_cas_ops_per_s,
        tb_read_ops_per_s: c.tb_read_ops_per_s,
        tb_write_ops_per_s: c.tb_write_ops_per_s,
        tb_burst_ops: c.tb_burst_ops,
    }
}

pub struct WorkloadRunner {
    conf: SimConfig,
}

impl WorkloadRunner {
    pub fn new(conf: SimConfig) -> Self {
        Self { conf }
    }

    /// Runs every configured workload against `index_name`, writing the
    /// summary (and optional trace) CSVs as it goes.
    pub fn run_all(&self, index_name: &str) -> Result<Vec<WorkloadReport>, SimError> {
        std::fs::create_dir_all(&self.conf.metrics.out_dir).map_err(|source| SimError::CreateOutDir {
            path: self.conf.metrics.out_dir.clone(),
            source,
        })?;

        let mut reports = Vec::with_capacity(self.conf.workloads.len());
        for wl in &self.conf.workloads {
            let report = self.run_workload(wl, index_name)?;
            self.append_summary(&report)?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn build_sherman_indices(&self, shared: &Rc<RefCell<SimShared>>, cs_total: u32, tp: u32) -> Vec<Rc<dyn IndexClient>> {
        let delegation = Rc::new(RefCell::new(make_delegation_table(&self.conf.sherman)));
        let mut out = Vec::with_capacity((cs_total * tp) as usize);
        for cs in 0..cs_total {
            let ms = cs % self.conf.cluster.memory_nodes.max(1);
            for th in 0..tp {
                let sherman: Rc<Sherman> = Sherman::new(
                    shared.clone(),
                    delegation.clone(),
                    &self.conf.sherman,
                    &self.conf.index,
                    cs,
                    ms,
                    th,
                    self.conf.cluster.cs_cache_bytes,
                );
                out.push(sherman as Rc<dyn IndexClient>);
            }
        }
        out
    }

    fn build_dex_indices(&self, shared: &Rc<RefCell<SimShared>>, cs_total: u32, tp: u32) -> Vec<Rc<dyn IndexClient>> {
        let mut dex_conf = self.conf.dex.clone();
        let ablations = &self.conf.index.ablations.dex;
        if ablations.disable_partitioning {
            dex_conf.logical_partitioning = false;
        }
        if ablations.disable_path_cache {
            dex_conf.path_aware_cache = false;
        }
        if ablations.disable_offload {
            dex_conf.offload.enable = false;
        }
        let mut out = Vec::with_capacity((cs_total * tp) as usize);
        for cs in 0..cs_total {
            let ms = cs % self.conf.cluster.memory_nodes.max(1);
            for th in 0..tp {
                let seed = WORKLOAD_RNG_SEED ^ ((cs as u64) << 16 | th as u64);
                let dex: Rc<Dex> = Dex::new(
                    shared.clone(),
                    &dex_conf,
                    self.conf.index.node_bytes,
                    self.conf.index.leaf_entry_bytes,
                    cs,
                    ms,
                    th,
                    cs_total,
                    self.conf.cluster.cs_cache_bytes,
                    seed,
                );
                out.push(dex as Rc<dyn IndexClient>);
            }
        }
        out
    }

    fn run_workload(&self, wl: &WorkloadConfig, index_name: &str) -> Result<WorkloadReport, SimError> {
        let shared = SimShared::new(nic_caps(&self.conf.nic));
        shared.borrow_mut().metrics.dump_trace = self.conf.metrics.dump_per_op_trace;

        let cs_total = self.conf.cluster.compute_nodes;
        let tp = self.conf.cluster.threads_per_compute;
        let indices = match self.conf.index.kind {
            IndexKind::Sherman => self.build_sherman_indices(&shared, cs_total, tp),
            IndexKind::Dex => self.build_dex_indices(&shared, cs_total, tp),
        };

        let zipf = sim_engine::ZipfSampler::new(wl.keyspace, wl.zipf);
        let mut rng = StdRng::seed_from_u64(WORKLOAD_RNG_SEED);

        for op_id in 0..wl.ops {
            let idx = indices[(op_id as usize) % indices.len()].clone();
            let is_read: f64 = rng.r#gen();
            let is_read = is_read < wl.mix.read;
            let u: f64 = rng.r#gen();
            let key = zipf.sample(u);
            shared.borrow_mut().loop_.after(0.0, move || {
                if is_read {
                    idx.get(key, op_id);
                } else {
                    idx.put(key, op_id);
                }
            });
        }
        SimShared::run(&shared);

        if self.conf.metrics.dump_per_op_trace {
            self.write_trace(&shared, wl, index_name)?;
        }

        let m = &shared.borrow().metrics;
        let p = m.percentiles(&[50.0, 95.0, 99.0]);
        Ok(WorkloadReport {
            index_name: index_name.to_string(),
            workload: wl.name.clone(),
            ops: m.op_count(),
            p50_us: p[0],
            p95_us: p[1],
            p99_us: p[2],
            reads: m.reads,
            writes: m.writes,
            cas: m.cas,
            sends: m.sends,
            recvs: m.recvs,
            bytes_r: m.bytes_r,
            bytes_w: m.bytes_w,
        })
    }

    fn append_summary(&self, r: &WorkloadReport) -> Result<(), SimError> {
        let path = Path::new(&self.conf.metrics.out_dir).join("metrics_summary.csv");
        let existed = path.exists();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SimError::WriteOutput {
                path: path.display().to_string(),
                source,
            })?;
        if !existed {
            writeln!(f, "index,workload,ops,p50_us,p95_us,p99_us,reads,writes,cas,sends,recvs,bytes_r,bytes_w")
                .map_err(|source| SimError::WriteOutput {
                    path: path.display().to_string(),
                    source,
                })?;
        }
        writeln!(
            f,
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            r.index_name, r.workload, r.ops, r.p50_us, r.p95_us, r.p99_us, r.reads, r.writes, r.cas, r.sends, r.recvs, r.bytes_r, r.bytes_w
        )
        .map_err(|source| SimError::WriteOutput {
            path: path.display().to_string(),
            source,
        })
    }

    fn write_trace(&self, shared: &Rc<RefCell<SimShared>>, wl: &WorkloadConfig, index_name: &str) -> Result<(), SimError> {
        let file_name = format!("op_trace_{}_{}.csv", wl.name, index_name);
        let path = Path::new(&self.conf.metrics.out_dir).join(file_name);
        let mut f = std::fs::File::create(&path).map_err(|source| SimError::WriteOutput {
            path: path.display().to_string(),
            source,
        })?;
        writeln!(f, "op_id,type,latency_us,reads,writes,cas,sends,recvs,bytes_r,bytes_w").map_err(|source| SimError::WriteOutput {
            path: path.display().to_string(),
            source,
        })?;
        for row in &shared.borrow().metrics.trace {
            writeln!(
                f,
                "{},{},{},{},{},{},{},{},{},{}",
                row.op_id, row.kind, row.latency_us, row.reads, row.writes, row.cas, row.sends, row.recvs, row.bytes_r, row.bytes_w
            )
            .map_err(|source| SimError::WriteOutput {
                path: path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_config::config::{ClusterConfig, IndexConfig, MetricsConfig, MixConfig};

    fn minimal_conf(index: IndexKind, out_dir: &str) -> SimConfig {
        SimConfig {
            cluster: ClusterConfig {
                compute_nodes: 1,
                memory_nodes: 1,
                threads_per_compute: 1,
                cs_cache_bytes: 4096,
                ms_cpu_cores: 1,
            },
            nic: NicConfig::default(),
            memory_server: Default::default(),
            index: IndexConfig {
                kind: index,
                node_bytes: 512,
                leaf_entry_bytes: 24,
                ablations: Default::default(),
            },
            sherman: Default::default(),
            dex: Default::default(),
            workloads: vec![WorkloadConfig {
                name: "smoke".into(),
                ops: 20,
                mix: MixConfig { read: 0.8, write: 0.2 },
                keyspace: 1000,
                zipf: 0.9,
                range_len: 1,
            }],
            metrics: MetricsConfig {
                ptiles: vec![50.0, 95.0, 99.0],
                dump_per_op_trace: true,
                out_dir: out_dir.to_string(),
            },
        }
    }

    #[test]
    fn sherman_workload_runs_end_to_end_and_writes_csvs() {
        let dir = std::env::temp_dir().join(format!("sim_runner_sherman_{}", std::process::id()));
        let conf = minimal_conf(IndexKind::Sherman, dir.to_str().unwrap());
        let runner = WorkloadRunner::new(conf);
        let reports = runner.run_all("Sherman").expect("run should succeed");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].ops, 20);
        assert!(dir.join("metrics_summary.csv").exists());
        assert!(dir.join("op_trace_smoke_Sherman.csv").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn dex_workload_runs_end_to_end() {
        let dir = std::env::temp_dir().join(format!("sim_runner_dex_{}", std::process::id()));
        let conf = minimal_conf(IndexKind::Dex, dir.to_str().unwrap());
        let runner = WorkloadRunner::new(conf);
        let reports = runner.run_all("Dex").expect("run should succeed");
        assert_eq!(reports[0].ops, 20);
        std::fs::remove_dir_all(&dir).ok();
    }
}
